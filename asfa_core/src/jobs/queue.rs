use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use super::worker::spawn_worker;
use super::{EnqueueError, Job, JobEvent, JobStatus, Operation, QueueKind};
use crate::AppEvent;
use crate::utils::{format_bytes, percentage};

/// How often the aggregate status line is recomputed
const STATUS_TICK: Duration = Duration::from_millis(100);

struct ActiveJob {
    source: PathBuf,
    destination: PathBuf,
    operation: Operation,
    size: u64,
    cancel: CancellationToken,
}

struct DisplayEntry {
    seq: u64,
    progress: f64,
    status: JobStatus,
}

/// A row of the display table: active jobs plus retained terminal ones
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRow {
    pub job_id: String,
    pub progress: f64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub remaining: usize,
    pub errors: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percent: f64,
}

#[derive(Default)]
struct QueueState {
    active: HashMap<String, ActiveJob>,
    display: HashMap<String, DisplayEntry>,
    next_seq: u64,
    errors: usize,
    total_bytes: u64,
    transferred_bytes: u64,
    job_bytes: HashMap<String, u64>,
    /// Per-job percentages since the last idle
    job_percent: HashMap<String, f64>,
    duplicates: Vec<PathBuf>,
    busy: bool,
}

impl QueueState {
    fn check_valid<J: Job>(&self, job: &J) -> Result<(), EnqueueError> {
        if self.active.contains_key(job.id()) {
            return Err(EnqueueError::AlreadyQueued(job.id().to_string()));
        }
        for other in self.active.values() {
            if other.source != job.source() {
                continue;
            }
            if other.destination == job.destination() {
                return Err(EnqueueError::SameRoute {
                    from: other.source.clone(),
                    to: other.destination.clone(),
                });
            }
            if other.operation == Operation::Move || job.operation() == Operation::Move {
                return Err(EnqueueError::SourceBeingMoved(other.source.clone()));
            }
        }
        Ok(())
    }

    fn insert<J: Job>(&mut self, job: &J) {
        let id = job.id().to_string();
        self.active.insert(
            id.clone(),
            ActiveJob {
                source: job.source().to_path_buf(),
                destination: job.destination().to_path_buf(),
                operation: job.operation(),
                size: job.size(),
                cancel: job.cancel_token().clone(),
            },
        );
        self.set_row(&id, 0.0, JobStatus::Waiting);
        self.total_bytes += job.size();
        self.job_percent.insert(id, 0.0);
        self.busy = true;
    }

    fn set_row(&mut self, id: &str, progress: f64, status: JobStatus) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.display.insert(
            id.to_string(),
            DisplayEntry {
                seq,
                progress,
                status,
            },
        );
    }

    /// Drop a job from the active table and take its bytes out of the totals
    fn release(&mut self, id: &str) -> Option<ActiveJob> {
        let job = self.active.remove(id)?;
        let moved = self.job_bytes.remove(id).unwrap_or(0);
        self.total_bytes = self.total_bytes.saturating_sub(job.size);
        self.transferred_bytes = self.transferred_bytes.saturating_sub(moved);
        self.job_percent.remove(id);
        Some(job)
    }

    fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Progress {
                job_id,
                transferred,
                chunk_len,
                total,
            } => {
                if !self.active.contains_key(job_id) {
                    return;
                }
                *self.job_bytes.entry(job_id.clone()).or_default() += chunk_len;
                self.transferred_bytes += chunk_len;
                let percent = percentage(*transferred, *total).min(100.0);
                self.job_percent.insert(job_id.clone(), percent);
                if let Some(row) = self.display.get_mut(job_id) {
                    row.progress = percent;
                }
            }
            JobEvent::Status { job_id, status } => {
                if let Some(row) = self.display.get_mut(job_id) {
                    row.status = *status;
                }
            }
            JobEvent::Finished { job_id } => {
                // Leave the finished job's bytes in the totals until idle
                self.active.remove(job_id);
            }
            JobEvent::Error { job_id, .. } => {
                if self.release(job_id).is_some() {
                    self.errors += 1;
                }
            }
            JobEvent::Duplicate { path, .. } => {
                self.duplicates.push(path.clone());
            }
        }
    }

    /// Idle notification for the transition to an empty active table
    fn take_idle(&mut self, kind: QueueKind) -> Option<AppEvent> {
        if !self.busy || !self.active.is_empty() {
            return None;
        }
        self.busy = false;
        self.total_bytes = 0;
        self.transferred_bytes = 0;
        self.job_bytes.clear();
        self.job_percent.clear();
        Some(AppEvent::QueueIdle {
            queue: kind,
            duplicates: std::mem::take(&mut self.duplicates),
        })
    }

    fn snapshot(&self, kind: QueueKind) -> QueueSnapshot {
        let percent = match kind {
            QueueKind::Transfers if !self.job_percent.is_empty() => {
                self.job_percent.values().sum::<f64>() / self.job_percent.len() as f64
            }
            QueueKind::Transfers => 0.0,
            QueueKind::Downloads if self.total_bytes == 0 => 0.0,
            QueueKind::Downloads => {
                percentage(self.transferred_bytes, self.total_bytes).min(100.0)
            }
        };
        QueueSnapshot {
            remaining: self.active.len(),
            errors: self.errors,
            total_bytes: self.total_bytes,
            transferred_bytes: self.transferred_bytes,
            percent,
        }
    }

    fn status_line(&self) -> String {
        format!("{} remaining, {} errors", self.active.len(), self.errors)
    }
}

/// Owns the active-job table of one engine and its single worker.
///
/// Cloning gives another handle to the same queue. Must be created inside a
/// tokio runtime: `new` spawns the worker, the event consumer and the status
/// ticker. Dropping the last handle stops the worker and the ticker.
pub struct JobQueueManager<J: Job> {
    kind: QueueKind,
    state: Arc<Mutex<QueueState>>,
    jobs_tx: mpsc::UnboundedSender<J>,
    released: Arc<Notify>,
    shutdown: CancellationToken,
    _stop_on_drop: Arc<DropGuard>,
}

impl<J: Job> Clone for JobQueueManager<J> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            state: self.state.clone(),
            jobs_tx: self.jobs_tx.clone(),
            released: self.released.clone(),
            shutdown: self.shutdown.clone(),
            _stop_on_drop: self._stop_on_drop.clone(),
        }
    }
}

impl<J: Job> JobQueueManager<J> {
    pub fn new(kind: QueueKind, event_tx: mpsc::Sender<AppEvent>) -> Self {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (job_events_tx, job_events_rx) = mpsc::unbounded_channel();
        let released = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        spawn_worker(kind, jobs_rx, job_events_tx, shutdown.clone());
        tokio::spawn(consume_events(
            kind,
            state.clone(),
            job_events_rx,
            released.clone(),
            event_tx.clone(),
        ));
        tokio::spawn(report_status(
            kind,
            state.clone(),
            event_tx,
            shutdown.clone(),
        ));

        Self {
            kind,
            state,
            jobs_tx,
            released,
            _stop_on_drop: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Validate and submit a job to the worker
    pub fn enqueue(&self, job: J) -> Result<(), EnqueueError> {
        let id = job.id().to_string();
        {
            let mut state = self.lock();
            state.check_valid(&job)?;
            state.insert(&job);
        }

        if self.jobs_tx.send(job).is_err() {
            let mut state = self.lock();
            state.release(&id);
            state.display.remove(&id);
            return Err(EnqueueError::Closed(self.kind));
        }
        debug!(queue = %self.kind, job_id = %id, "Job enqueued");
        Ok(())
    }

    /// Cancel a job and drop its bookkeeping without waiting for the worker
    pub fn kill(&self, job_id: &str) -> bool {
        let job = {
            let mut state = self.lock();
            let job = state.release(job_id);
            if job.is_some() {
                state.display.remove(job_id);
            }
            job
        };
        match job {
            Some(job) => {
                job.cancel.cancel();
                info!(queue = %self.kind, job_id = %job_id, "Job cancelled");
                self.released.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.lock().active.keys().cloned().collect();
        for id in ids {
            self.kill(&id);
        }
    }

    /// Purge terminal rows from the display table and reset the error count
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.display.retain(|_, row| !row.status.is_terminal());
        state.errors = 0;
    }

    /// Add a finished row for a file that already exists locally
    pub fn mark_existing(&self, path: &Path) {
        let id = path.to_string_lossy().into_owned();
        self.lock().set_row(&id, 100.0, JobStatus::Complete);
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.lock().active.contains_key(job_id)
    }

    pub fn active_ids(&self) -> HashSet<String> {
        self.lock().active.keys().cloned().collect()
    }

    /// Display rows in insertion order
    pub fn display_rows(&self) -> Vec<DisplayRow> {
        let state = self.lock();
        let mut rows: Vec<(u64, DisplayRow)> = state
            .display
            .iter()
            .map(|(id, entry)| {
                (
                    entry.seq,
                    DisplayRow {
                        job_id: id.clone(),
                        progress: entry.progress,
                        status: entry.status,
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lock().snapshot(self.kind)
    }

    /// `"<n> remaining, <m> errors"`
    pub fn status_line(&self) -> String {
        self.lock().status_line()
    }

    /// `"<transferred> / <total>"`
    pub fn progress_line(&self) -> String {
        let state = self.lock();
        format!(
            "{} / {}",
            format_bytes(state.transferred_bytes),
            format_bytes(state.total_bytes)
        )
    }

    /// Cancel everything and stop the worker and the status ticker
    pub fn shutdown(&self) {
        self.cancel_all();
        self.shutdown.cancel();
    }
}

fn to_app_event(queue: QueueKind, event: JobEvent) -> AppEvent {
    match event {
        JobEvent::Progress {
            job_id,
            transferred,
            chunk_len,
            total,
        } => AppEvent::JobProgress {
            queue,
            job_id,
            transferred,
            chunk_len,
            total,
        },
        JobEvent::Status { job_id, status } => AppEvent::JobStatus {
            queue,
            job_id,
            status,
        },
        JobEvent::Finished { job_id } => AppEvent::JobFinished { queue, job_id },
        JobEvent::Error { job_id, message } => AppEvent::JobError {
            queue,
            job_id,
            message,
        },
        JobEvent::Duplicate { path, .. } => AppEvent::DuplicateFound { path },
    }
}

/// The only place job events touch the aggregate counters
async fn consume_events(
    kind: QueueKind,
    state: Arc<Mutex<QueueState>>,
    mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
    released: Arc<Notify>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    loop {
        let event = tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => Some(event),
                None => break,
            },
            _ = released.notified() => None,
        };

        let idle = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(event) = &event {
                state.apply(event);
            }
            state.take_idle(kind)
        };

        if let Some(event) = event {
            let _ = event_tx.send(to_app_event(kind, event)).await;
        }
        if let Some(idle) = idle {
            info!(queue = %kind, "Queue idle");
            let _ = event_tx.send(idle).await;
        }
    }
    debug!(queue = %kind, "Event consumer stopped");
}

async fn report_status(
    kind: QueueKind,
    state: Arc<Mutex<QueueState>>,
    event_tx: mpsc::Sender<AppEvent>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATUS_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = String::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let text = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status_line();
        if text != last {
            last = text.clone();
            if event_tx
                .send(AppEvent::QueueStatus { queue: kind, text })
                .await
                .is_err()
            {
                break;
            }
        }
    }
}
