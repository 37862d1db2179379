//! Execution contexts.
//!
//! The storage orchestrator never does slow work or invokes subscriber
//! callbacks on the caller's thread. It hands jobs to a [`TaskRunner`]:
//!
//! - [`ThreadRunner`] - one named worker thread, jobs run in FIFO order
//! - [`ManualRunner`] - jobs wait until the host pumps them, for hosts with
//!   their own main loop and for deterministic tests

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{StorageError, StorageResult};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere jobs can be run.
pub trait TaskRunner: Send + Sync {
    /// Schedule a job. Jobs spawned on the same runner run in order.
    fn spawn(&self, job: Job);
}

/// Runs jobs on a dedicated worker thread.
pub struct ThreadRunner {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRunner {
    /// Start a worker thread called `name`.
    pub fn new(name: impl Into<String>) -> StorageResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .map_err(|e| StorageError::InvalidConfig(format!("failed to start {}: {}", name, e)))?;

        debug!(runner = %name, "Worker thread started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(runner = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl TaskRunner for ThreadRunner {
    fn spawn(&self, job: Job) {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    error!(runner = %self.name, "Worker thread gone, job dropped");
                }
            }
            None => debug!(runner = %self.name, "Runner shut down, job dropped"),
        }
    }
}

impl Drop for ThreadRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRunner").field("name", &self.name).finish()
    }
}

/// Queues jobs until the host runs them.
#[derive(Clone, Default)]
pub struct ManualRunner {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl ManualRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the jobs queued at the time of the call. Jobs they spawn wait
    /// for the next call. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let count = self.jobs.lock().len();
        for _ in 0..count {
            let Some(job) = self.jobs.lock().pop_front() else {
                return count;
            };
            job();
        }
        count
    }

    /// Run jobs until the queue is empty, including newly spawned ones.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(job) = self.jobs.lock().pop_front() else {
                return ran;
            };
            job();
            ran += 1;
        }
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl TaskRunner for ManualRunner {
    fn spawn(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

impl fmt::Debug for ManualRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualRunner")
            .field("pending", &self.pending())
            .finish()
    }
}
