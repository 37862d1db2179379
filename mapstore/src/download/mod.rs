//! Package transfers.
//!
//! - `traits`: the [`Downloader`] boundary and URL layout
//! - `http`: blocking HTTP implementation with server fallback and resume
//! - `checksum`: size and SHA-256 verification
//! - `progress`: progress values and the monotonic gate
//! - `queue`: FIFO queue with one active transfer
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use mapstore::download::{Downloader, FetchRequest, HttpDownloader};
//!
//! let downloader = HttpDownloader::new(Duration::from_secs(30))?;
//! let request = FetchRequest::new(
//!     vec!["https://cdn.example.com/maps/230101/Abkhazia.mwm".to_string()],
//!     "/tmp/Abkhazia.mwm.downloading",
//!     4_689_718,
//! );
//! downloader.fetch(&request, &mut |p| println!("{}/{}", p.bytes_downloaded, p.bytes_total))?;
//! ```

mod checksum;
mod http;
mod progress;
mod queue;
mod traits;

pub use checksum::{calculate_file_checksum, verify_file};
pub use http::{HttpDownloader, DEFAULT_TIMEOUT_SECS};
pub use progress::{Progress, ProgressGate};
pub use queue::{ActiveTransfer, Cancelled, DownloadQueue, QueueMembership, QueuedTask};
pub use traits::{diff_url, map_url, Downloader, FetchRequest};
