use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::constants::chunk_size;
use super::fs_ops;
use crate::jobs::{EnqueueError, Job, JobEvents, JobStatus, Operation};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Cannot open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot create '{}': {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Transfer interrupted: {0}")]
    Interrupted(#[from] io::Error),
}

impl TransferError {
    /// Whether the destination may hold partial output
    fn touched_destination(&self) -> bool {
        !matches!(self, TransferError::Open { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Duplicate,
    Renamed,
    Copied(u64),
    Cancelled,
}

/// A single local copy or move
#[derive(Debug)]
pub struct TransferJob {
    id: String,
    source: PathBuf,
    destination: PathBuf,
    operation: Operation,
    size: u64,
    cancel: CancellationToken,
}

impl TransferJob {
    /// Build a job for `source`. A directory `destination` resolves to a file
    /// of the same name inside it.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        operation: Operation,
    ) -> Result<Self, EnqueueError> {
        let source = source.into();
        let meta = std::fs::metadata(&source).map_err(|e| EnqueueError::Unreadable {
            path: source.clone(),
            source: e,
        })?;
        if !meta.is_file() {
            return Err(EnqueueError::Unreadable {
                path: source,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        let destination = fs_ops::resolve_destination(&source, destination.into());

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source,
            destination,
            operation,
            size: meta.len(),
            cancel: CancellationToken::new(),
        })
    }

    async fn transfer(&self, events: &JobEvents) -> Result<Outcome, TransferError> {
        if fs_ops::file_exists_with_size(&self.destination, self.size).await {
            return Ok(Outcome::Duplicate);
        }

        if self.operation == Operation::Move
            && fs_ops::same_filesystem(&self.source, &self.destination)
        {
            match tokio::fs::rename(&self.source, &self.destination).await {
                Ok(()) => {
                    self.remove_source_folder().await;
                    return Ok(Outcome::Renamed);
                }
                Err(e) => debug!(job_id = %self.id, "Rename failed, copying instead: {}", e),
            }
        }

        self.copy_across(events).await
    }

    /// Chunked copy, then metadata; a finished move also removes the source
    async fn copy_across(&self, events: &JobEvents) -> Result<Outcome, TransferError> {
        let outcome = self.copy_chunks(events).await?;

        if let Err(e) = fs_ops::copy_metadata(&self.source, &self.destination).await {
            warn!(job_id = %self.id, "Could not copy metadata to {:?}: {}", self.destination, e);
        }

        if matches!(outcome, Outcome::Copied(_)) && self.operation == Operation::Move {
            fs_ops::delete_file(&self.source).await;
            self.remove_source_folder().await;
        }
        Ok(outcome)
    }

    async fn copy_chunks(&self, events: &JobEvents) -> Result<Outcome, TransferError> {
        let mut src = File::open(&self.source)
            .await
            .map_err(|e| TransferError::Open {
                path: self.source.clone(),
                source: e,
            })?;
        let mut dst = File::create(&self.destination)
            .await
            .map_err(|e| TransferError::Create {
                path: self.destination.clone(),
                source: e,
            })?;

        let mut buffer = vec![0u8; chunk_size(self.size)];
        let mut transferred: u64 = 0;

        loop {
            let n = src.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buffer[..n]).await?;
            transferred += n as u64;
            events.progress(transferred, n as u64, self.size.max(transferred));

            if self.cancel.is_cancelled() {
                dst.flush().await?;
                info!(job_id = %self.id, "Transfer cancelled after {} bytes", transferred);
                return Ok(Outcome::Cancelled);
            }
        }

        dst.flush().await?;
        Ok(Outcome::Copied(transferred))
    }

    async fn remove_source_folder(&self) {
        if let Some(parent) = self.source.parent() {
            fs_ops::remove_folder(parent).await;
        }
    }

    async fn execute(self, events: JobEvents) {
        events.status(JobStatus::Running);

        match self.transfer(&events).await {
            Ok(outcome) => {
                debug!(job_id = %self.id, ?outcome, "Transfer done: {:?} -> {:?}", self.source, self.destination);
                match outcome {
                    Outcome::Duplicate => {
                        events.duplicate(&self.destination);
                        events.progress(self.size, 0, self.size);
                    }
                    Outcome::Renamed | Outcome::Cancelled => {
                        events.progress(self.size, 0, self.size);
                    }
                    Outcome::Copied(0) => events.progress(0, 0, 0),
                    Outcome::Copied(_) => {}
                }
                events.status(JobStatus::Complete);
                events.finished();
            }
            Err(e) => {
                warn!(job_id = %self.id, "Transfer of {:?} failed: {}", self.source, e);
                // An open failure happens before the destination is created
                if e.touched_destination() {
                    fs_ops::delete_file(&self.destination).await;
                }
                events.error(e.to_string());
                events.status(JobStatus::Error);
            }
        }
    }
}

impl Job for TransferJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn run(self, events: JobEvents) -> impl std::future::Future<Output = ()> + Send {
        self.execute(events)
    }
}
