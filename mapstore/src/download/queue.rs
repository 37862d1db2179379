//! FIFO download queue with a single active transfer.
//!
//! The queue itself holds no lock; the storage orchestrator keeps it inside
//! its state mutex so that queue mutation and status derivation are
//! serialized together.
//!
//! ```text
//! pending: [B, C, D]          active: A (generation 4, token)
//!             │                           │
//!   enqueue ──┘ (no-op if present)        └── finish / cancel ──▶ promote B
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::progress::{Progress, ProgressGate};
use crate::country::{CountryId, DataVersion};
use crate::local::MapFileType;

/// A pending or active download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub country_id: CountryId,
    /// Full package or diff.
    pub file_kind: MapFileType,
    /// Final destination of the fetched file (before any transient suffix).
    pub download_path: PathBuf,
    pub expected_size: u64,
    /// Catalog version the download brings the package to.
    pub target_version: DataVersion,
    /// Version the diff applies to. `None` for full downloads.
    pub source_version: Option<DataVersion>,
}

impl QueuedTask {
    pub fn is_diff(&self) -> bool {
        self.file_kind == MapFileType::Diff
    }
}

/// Where a country sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMembership {
    None,
    Queued,
    Active,
}

/// The transfer currently at the head of the queue.
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub task: QueuedTask,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub gate: ProgressGate,
    pub progress: Progress,
}

/// Result of [`DownloadQueue::cancel`].
#[derive(Debug)]
pub enum Cancelled {
    /// The task was waiting and has been removed.
    Pending(QueuedTask),
    /// The task was transferring; its token has been cancelled.
    Active(ActiveTransfer),
}

impl Cancelled {
    pub fn task(&self) -> &QueuedTask {
        match self {
            Self::Pending(task) => task,
            Self::Active(active) => &active.task,
        }
    }
}

/// Ordered download queue. At most one task is active.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    pending: VecDeque<QueuedTask>,
    active: Option<ActiveTransfer>,
    next_generation: u64,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task. Returns `false` (and does nothing) if the country is
    /// already queued or active.
    pub fn enqueue(&mut self, task: QueuedTask) -> bool {
        if self.contains(task.country_id.as_str()) {
            debug!(country = %task.country_id, "Already queued");
            return false;
        }
        info!(
            country = %task.country_id,
            kind = ?task.file_kind,
            bytes = task.expected_size,
            "Enqueued download"
        );
        self.pending.push_back(task);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.membership(id) != QueueMembership::None
    }

    pub fn membership(&self, id: &str) -> QueueMembership {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.task.country_id.as_str() == id)
        {
            QueueMembership::Active
        } else if self.pending.iter().any(|t| t.country_id.as_str() == id) {
            QueueMembership::Queued
        } else {
            QueueMembership::None
        }
    }

    pub fn active(&self) -> Option<&ActiveTransfer> {
        self.active.as_ref()
    }

    /// Look up a task, active or pending.
    pub fn task(&self, id: &str) -> Option<&QueuedTask> {
        self.active
            .as_ref()
            .map(|a| &a.task)
            .filter(|t| t.country_id.as_str() == id)
            .or_else(|| self.pending.iter().find(|t| t.country_id.as_str() == id))
    }

    /// Promote the head of the queue if nothing is active.
    ///
    /// Returns the newly active transfer.
    pub fn start_next(&mut self) -> Option<&ActiveTransfer> {
        if self.active.is_some() {
            return None;
        }
        let task = self.pending.pop_front()?;
        self.next_generation += 1;
        let generation = self.next_generation;
        debug!(country = %task.country_id, generation, "Promoted to active");
        self.active = Some(ActiveTransfer {
            progress: Progress::new(0, task.expected_size),
            task,
            generation,
            cancel: CancellationToken::new(),
            gate: ProgressGate::new(generation),
        });
        self.active.as_ref()
    }

    /// Take the active transfer if it is still `generation`.
    pub fn finish(&mut self, generation: u64) -> Option<ActiveTransfer> {
        if self.active.as_ref()?.generation != generation {
            return None;
        }
        self.active.take()
    }

    /// Record progress for the active transfer. Stale or decreasing updates
    /// are dropped and `false` is returned.
    pub fn update_progress(&mut self, generation: u64, progress: Progress) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if !active.gate.accept(generation, progress) {
            return false;
        }
        active.progress = progress;
        true
    }

    /// Remove a queued task, or abort the active one.
    pub fn cancel(&mut self, id: &str) -> Option<Cancelled> {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.task.country_id.as_str() == id)
        {
            let active = self.active.take()?;
            active.cancel.cancel();
            info!(country = %id, generation = active.generation, "Aborted active download");
            return Some(Cancelled::Active(active));
        }

        let index = self
            .pending
            .iter()
            .position(|t| t.country_id.as_str() == id)?;
        let task = self.pending.remove(index)?;
        info!(country = %id, "Removed from queue");
        Some(Cancelled::Pending(task))
    }

    /// Drop everything, aborting the active transfer.
    pub fn clear(&mut self) -> Vec<QueuedTask> {
        let mut dropped = Vec::with_capacity(self.len());
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            dropped.push(active.task);
        }
        dropped.extend(self.pending.drain(..));
        dropped
    }

    /// Pending tasks, in order, for in-place rewriting.
    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut QueuedTask> {
        self.pending.iter_mut()
    }

    /// Country ids in queue order, active first.
    pub fn ids(&self) -> Vec<CountryId> {
        self.active
            .iter()
            .map(|a| a.task.country_id.clone())
            .chain(self.pending.iter().map(|t| t.country_id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}
