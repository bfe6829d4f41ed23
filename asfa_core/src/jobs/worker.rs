use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{Job, JobEvent, JobEvents, JobStatus, QueueKind};

/// Spawn the single worker draining `jobs_rx` in FIFO order.
pub(super) fn spawn_worker<J: Job>(
    kind: QueueKind,
    mut jobs_rx: mpsc::UnboundedReceiver<J>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = jobs_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            run_one(kind, job, &events_tx).await;
        }
        debug!(queue = %kind, "Worker stopped");
    })
}

async fn run_one<J: Job>(kind: QueueKind, job: J, events_tx: &mpsc::UnboundedSender<JobEvent>) {
    let job_id = job.id().to_string();

    // Killed while still waiting in the FIFO
    if job.cancel_token().is_cancelled() {
        debug!(queue = %kind, job_id = %job_id, "Skipping cancelled job");
        return;
    }

    debug!(queue = %kind, job_id = %job_id, "Starting job");
    let events = JobEvents::new(job_id.clone(), events_tx.clone());

    // A separate task keeps a panicking job from taking the worker down with it
    if let Err(e) = tokio::spawn(job.run(events)).await {
        error!(queue = %kind, job_id = %job_id, "Job task failed: {}", e);
        let events = JobEvents::new(job_id, events_tx.clone());
        events.error("Failed. Something went wrong.");
        events.status(JobStatus::Error);
    }
}
