//! Transfer progress and the monotonic progress gate.
//!
//! Progress updates can arrive late: a chunk callback may race with a
//! cancellation or with the next transfer being promoted. The
//! [`ProgressGate`] tracks the active transfer's generation and the last
//! accepted byte count, and drops anything stale or out of order.

use tracing::debug;

/// Bytes transferred so far out of the expected total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

impl Progress {
    pub fn new(bytes_downloaded: u64, bytes_total: u64) -> Self {
        Self {
            bytes_downloaded,
            bytes_total,
        }
    }

    /// Progress of a finished transfer of `total` bytes.
    pub fn complete(total: u64) -> Self {
        Self::new(total, total)
    }

    /// Fraction done in `[0.0, 1.0]`. Unknown totals report 0.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_downloaded as f64 / self.bytes_total as f64).min(1.0)
        }
    }

    /// Sum two progress values.
    pub fn merge(self, other: Progress) -> Progress {
        Progress::new(
            self.bytes_downloaded + other.bytes_downloaded,
            self.bytes_total + other.bytes_total,
        )
    }
}

/// Accepts only non-decreasing progress for the current transfer generation.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    generation: u64,
    last: Option<u64>,
}

impl ProgressGate {
    /// Create a gate for the given transfer generation.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            last: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last accepted byte count.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Offer an update. Returns `true` if it was accepted.
    pub fn accept(&mut self, generation: u64, progress: Progress) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "Dropping progress from stale transfer"
            );
            return false;
        }
        if let Some(last) = self.last {
            if progress.bytes_downloaded < last {
                debug!(
                    bytes = progress.bytes_downloaded,
                    last, "Dropping out-of-order progress"
                );
                return false;
            }
        }
        self.last = Some(progress.bytes_downloaded);
        true
    }
}
