//! One instance of every component, wired to a single event channel.

use anyhow::Context;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowseDirection, BrowseError, Listing, ListingRow, LocalExistence, RemoteBrowser};
use crate::config::AppConfig;
use crate::discovery::{DiscoveryListener, PeerIdentity};
use crate::download::DownloadJob;
use crate::ftps::{AuthorizeError, Credentials, TransferServer};
use crate::jobs::{EnqueueError, Job, JobQueueManager, Operation, QueueKind};
use crate::transfer::{TransferJob, plan_folder};
use crate::{AppCommand, AppEvent};

struct DiscoveryTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Facade over the transfer and download queues, the server, the browser
/// and the discovery listener. Must be created inside a tokio runtime.
pub struct Backend {
    config: AppConfig,
    transfers: JobQueueManager<TransferJob>,
    downloads: JobQueueManager<DownloadJob>,
    server: TransferServer,
    browser: RemoteBrowser,
    discovery: Option<DiscoveryTask>,
    event_tx: mpsc::Sender<AppEvent>,
}

impl Backend {
    pub fn new(config: AppConfig, event_tx: mpsc::Sender<AppEvent>) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.download_dir) {
            warn!("Cannot create download folder {:?}: {}", config.download_dir, e);
        }
        Self {
            transfers: JobQueueManager::new(QueueKind::Transfers, event_tx.clone()),
            downloads: JobQueueManager::new(QueueKind::Downloads, event_tx.clone()),
            server: TransferServer::from_config(&config),
            browser: RemoteBrowser::new(config.download_dir.clone()),
            discovery: None,
            event_tx,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn transfers(&self) -> &JobQueueManager<TransferJob> {
        &self.transfers
    }

    pub fn downloads(&self) -> &JobQueueManager<DownloadJob> {
        &self.downloads
    }

    pub fn server(&self) -> &TransferServer {
        &self.server
    }

    pub fn browser(&self) -> &RemoteBrowser {
        &self.browser
    }

    async fn emit(&self, event: AppEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn enqueue_transfer(
        &self,
        source: &Path,
        destination: &Path,
        operation: Operation,
    ) -> Result<String, EnqueueError> {
        let job = TransferJob::new(source, destination, operation)?;
        let id = job.id().to_string();
        self.transfers.enqueue(job)?;
        Ok(id)
    }

    /// Queue a copy; a directory destination receives a file of the same name
    pub fn enqueue_copy(&self, source: &Path, destination: &Path) -> Result<String, EnqueueError> {
        self.enqueue_transfer(source, destination, Operation::Copy)
    }

    pub fn enqueue_move(&self, source: &Path, destination: &Path) -> Result<String, EnqueueError> {
        self.enqueue_transfer(source, destination, Operation::Move)
    }

    /// Queue every eligible file of `source` under `destination/<name>`.
    /// Files rejected by the queue are skipped; returns the ids queued.
    pub fn enqueue_folder(
        &self,
        source: &Path,
        destination: &Path,
        operation: Operation,
        recurse: bool,
        ignored_extensions: &HashSet<String>,
    ) -> anyhow::Result<Vec<String>> {
        let entries = plan_folder(source, destination, recurse, ignored_extensions)
            .with_context(|| format!("Cannot read folder {:?}", source))?;
        let planned = entries.len();
        let mut queued = Vec::with_capacity(planned);
        for entry in entries {
            match self.enqueue_transfer(&entry.source, &entry.destination_dir, operation) {
                Ok(id) => queued.push(id),
                Err(e) => warn!("Skipping {:?}: {}", entry.source, e),
            }
        }
        info!("Queued {} of {} files from {:?}", queued.len(), planned, source);
        Ok(queued)
    }

    pub fn enqueue_download(
        &self,
        remote_name: &str,
        remote_dir: &str,
        size: u64,
        credentials: Credentials,
    ) -> Result<String, EnqueueError> {
        let job = DownloadJob::new(
            remote_name,
            remote_dir,
            size,
            credentials,
            &self.config.download_dir,
        );
        let id = job.id().to_string();
        self.downloads.enqueue(job)?;
        Ok(id)
    }

    pub fn cancel(&self, queue: QueueKind, job_id: &str) -> bool {
        match queue {
            QueueKind::Transfers => self.transfers.kill(job_id),
            QueueKind::Downloads => self.downloads.kill(job_id),
        }
    }

    pub fn cancel_all(&self, queue: QueueKind) {
        match queue {
            QueueKind::Transfers => self.transfers.cancel_all(),
            QueueKind::Downloads => self.downloads.cancel_all(),
        }
    }

    pub fn cleanup_display(&self, queue: QueueKind) {
        match queue {
            QueueKind::Transfers => self.transfers.cleanup(),
            QueueKind::Downloads => self.downloads.cleanup(),
        }
    }

    pub fn authorize_user(
        &self,
        username: &str,
        password: &str,
        root: &Path,
    ) -> Result<(), AuthorizeError> {
        self.server.authorize(username, password, root)
    }

    pub fn revoke_user(&self, username: &str) -> bool {
        self.server.revoke(username)
    }

    pub fn set_bandwidth(&self, bytes_per_sec: u64) {
        self.server.set_bandwidth_limit(bytes_per_sec);
    }

    /// Serve on every interface at the configured port
    pub async fn start_server(&mut self) -> anyhow::Result<PeerIdentity> {
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.server_port));
        self.server.start(&self.config.username, bind).await
    }

    pub async fn stop_server(&mut self) -> bool {
        self.server.stop().await
    }

    pub fn connect(&mut self, credentials: Credentials) {
        self.browser.connect(credentials);
    }

    /// Navigate and list the remote folder, classified against the active
    /// downloads
    pub async fn browse(
        &mut self,
        path: &str,
        direction: BrowseDirection,
    ) -> Result<Listing, BrowseError> {
        self.browser.navigate(path, direction);
        self.browser.list(self.downloads.active_ids()).await
    }

    /// Show a listed file that is already downloaded as a finished row
    pub fn mark_downloaded(&self, row: &ListingRow) {
        if row.existence == LocalExistence::Downloaded {
            self.downloads.mark_existing(&row.local_path);
        }
    }

    /// Listen for peer announcements, reported as `PeerDiscovered`
    pub fn start_discovery(&mut self) -> anyhow::Result<()> {
        if self.discovery.is_some() {
            return Ok(());
        }
        let listener = DiscoveryListener::bind(&self.config.discovery)?;
        let cancel = CancellationToken::new();
        let task = listener.start_listening(self.event_tx.clone(), cancel.clone());
        info!("Listening for peers on port {}", self.config.discovery.port);
        self.discovery = Some(DiscoveryTask { cancel, task });
        Ok(())
    }

    pub async fn stop_discovery(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            discovery.cancel.cancel();
            let _ = discovery.task.await;
        }
    }

    /// Cancel all jobs, stop the server and discovery
    pub async fn shutdown(&mut self) {
        self.transfers.shutdown();
        self.downloads.shutdown();
        self.server.stop().await;
        self.stop_discovery().await;
    }

    /// Carry out one command, reporting the outcome as events
    pub async fn handle(&mut self, cmd: AppCommand) {
        debug!(?cmd, "Command");
        match cmd {
            AppCommand::EnqueueCopy {
                source,
                destination,
            } => {
                let result = self.enqueue_copy(&source, &destination);
                self.report_enqueue(QueueKind::Transfers, result).await;
            }
            AppCommand::EnqueueMove {
                source,
                destination,
            } => {
                let result = self.enqueue_move(&source, &destination);
                self.report_enqueue(QueueKind::Transfers, result).await;
            }
            AppCommand::EnqueueFolder {
                source,
                destination,
                operation,
                recurse,
                ignored_extensions,
            } => {
                match self.enqueue_folder(
                    &source,
                    &destination,
                    operation,
                    recurse,
                    &ignored_extensions,
                ) {
                    Ok(ids) => {
                        for job_id in ids {
                            self.emit(AppEvent::JobQueued {
                                queue: QueueKind::Transfers,
                                job_id,
                            })
                            .await;
                        }
                    }
                    Err(e) => self.emit(AppEvent::Error(format!("{:#}", e))).await,
                }
            }
            AppCommand::EnqueueDownload {
                remote_name,
                remote_dir,
                size,
                credentials,
            } => {
                let Some(credentials) = credentials.or_else(|| self.browser.credentials().cloned())
                else {
                    self.emit(AppEvent::Error(BrowseError::NotAuthenticated.to_string()))
                        .await;
                    return;
                };
                let result = self.enqueue_download(&remote_name, &remote_dir, size, credentials);
                self.report_enqueue(QueueKind::Downloads, result).await;
            }
            AppCommand::Cancel { queue, job_id } => {
                if !self.cancel(queue, &job_id) {
                    debug!(%queue, %job_id, "Nothing to cancel");
                }
            }
            AppCommand::CancelAll { queue } => self.cancel_all(queue),
            AppCommand::CleanupDisplay { queue } => self.cleanup_display(queue),
            AppCommand::QueryProgress { queue } => {
                let (snapshot, text) = match queue {
                    QueueKind::Transfers => (self.transfers.snapshot(), self.transfers.progress_line()),
                    QueueKind::Downloads => (self.downloads.snapshot(), self.downloads.progress_line()),
                };
                self.emit(AppEvent::QueueProgress {
                    queue,
                    snapshot,
                    text,
                })
                .await;
            }
            AppCommand::AuthorizeUser {
                username,
                password,
                root,
            } => match self.authorize_user(&username, &password, &root) {
                Ok(()) => self.emit(AppEvent::UserAuthorized { username }).await,
                Err(e) => self.emit(AppEvent::Error(e.to_string())).await,
            },
            AppCommand::RevokeUser { username } => {
                if self.revoke_user(&username) {
                    self.emit(AppEvent::UserRevoked { username }).await;
                }
            }
            AppCommand::SetBandwidth { bytes_per_sec } => self.set_bandwidth(bytes_per_sec),
            AppCommand::StartServer => match self.start_server().await {
                Ok(identity) => {
                    self.emit(AppEvent::Status(format!("Server running on '{}'", identity.addr)))
                        .await;
                    self.emit(AppEvent::ServerStarted { identity }).await;
                }
                Err(e) => {
                    error!("Server failed to start: {:#}", e);
                    self.emit(AppEvent::Error("Server failed to start.".to_string()))
                        .await;
                }
            },
            AppCommand::StopServer => {
                if self.stop_server().await {
                    self.emit(AppEvent::Status("Server stopped".to_string())).await;
                    self.emit(AppEvent::ServerStopped).await;
                }
            }
            AppCommand::Connect { credentials } => self.connect(credentials),
            AppCommand::Browse { path, direction } => match self.browse(&path, direction).await {
                Ok(listing) => {
                    let location = listing.location().to_string();
                    let rows: Vec<ListingRow> = listing.collect();
                    for row in &rows {
                        self.mark_downloaded(row);
                    }
                    self.emit(AppEvent::Status(format!("Fetched folder items: {}", rows.len())))
                        .await;
                    self.emit(AppEvent::Listing { location, rows }).await;
                }
                Err(e) => {
                    self.emit(AppEvent::BrowseFailed {
                        message: e.to_string(),
                    })
                    .await
                }
            },
            AppCommand::Shutdown => self.shutdown().await,
        }
    }

    async fn report_enqueue(&self, queue: QueueKind, result: Result<String, EnqueueError>) {
        match result {
            Ok(job_id) => self.emit(AppEvent::JobQueued { queue, job_id }).await,
            Err(e) => {
                warn!(%queue, "Enqueue rejected: {}", e);
                self.emit(AppEvent::Error(e.to_string())).await;
            }
        }
    }
}
