//! Jobs and the queue that runs them.
//!
//! A [`Job`] is one file's copy, move or download. Jobs are handed to a
//! [`JobQueueManager`], which validates them, runs them one at a time on a
//! dedicated worker task and folds their [`JobEvent`]s into aggregate
//! counters before forwarding them as [`crate::AppEvent`]s.

mod queue;
mod worker;

pub use queue::{DisplayRow, JobQueueManager, QueueSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which manager a job (or an event) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Transfers,
    Downloads,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Transfers => write!(f, "transfers"),
            QueueKind::Downloads => write!(f, "downloads"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Copy,
    Move,
}

/// Events a running job reports about itself
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress {
        job_id: String,
        transferred: u64,
        chunk_len: u64,
        total: u64,
    },
    Status {
        job_id: String,
        status: JobStatus,
    },
    Finished {
        job_id: String,
    },
    Error {
        job_id: String,
        message: String,
    },
    Duplicate {
        job_id: String,
        path: PathBuf,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Status { job_id, .. }
            | JobEvent::Finished { job_id }
            | JobEvent::Error { job_id, .. }
            | JobEvent::Duplicate { job_id, .. } => job_id,
        }
    }
}

/// Event sender bound to a single job.
///
/// Sends never block; if the manager is gone the events are dropped.
#[derive(Debug, Clone)]
pub struct JobEvents {
    job_id: String,
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobEvents {
    pub fn new(job_id: impl Into<String>, tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, transferred: u64, chunk_len: u64, total: u64) {
        self.emit(JobEvent::Progress {
            job_id: self.job_id.clone(),
            transferred,
            chunk_len,
            total,
        });
    }

    pub fn status(&self, status: JobStatus) {
        self.emit(JobEvent::Status {
            job_id: self.job_id.clone(),
            status,
        });
    }

    pub fn finished(&self) {
        self.emit(JobEvent::Finished {
            job_id: self.job_id.clone(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(JobEvent::Error {
            job_id: self.job_id.clone(),
            message: message.into(),
        });
    }

    pub fn duplicate(&self, path: &Path) {
        self.emit(JobEvent::Duplicate {
            job_id: self.job_id.clone(),
            path: path.to_path_buf(),
        });
    }
}

/// One unit of work executed by a queue's worker.
///
/// `run` owns the job and must report a terminal outcome through `events`:
/// `finished` on success, `error` on failure. It must not panic on I/O
/// failures; the worker survives panics but reports them as job errors.
pub trait Job: Send + 'static {
    fn id(&self) -> &str;
    fn source(&self) -> &Path;
    fn destination(&self) -> &Path;
    fn operation(&self) -> Operation;
    /// Declared size in bytes
    fn size(&self) -> u64;
    fn cancel_token(&self) -> &CancellationToken;
    fn run(self, events: JobEvents) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("'{0}' is already in the queue")]
    AlreadyQueued(String),
    #[error("'{}' is already being transferred to '{}'", from.display(), to.display())]
    SameRoute { from: PathBuf, to: PathBuf },
    #[error("'{}' is being moved by another job", .0.display())]
    SourceBeingMoved(PathBuf),
    #[error("Cannot read '{}': {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("The {0} queue is shut down")]
    Closed(QueueKind),
}
