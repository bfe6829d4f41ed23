use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod backend;
pub mod browser;
pub mod config;
pub mod discovery;
pub mod download;
pub mod ftps;
pub mod identity;
pub mod jobs;
pub mod transfer;
pub mod utils;

pub use backend::Backend;
use browser::{BrowseDirection, ListingRow};
use config::AppConfig;
use discovery::PeerIdentity;
use ftps::Credentials;
use jobs::{JobStatus, Operation, QueueKind, QueueSnapshot};

//Command from the frontend to the core
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    EnqueueCopy {
        source: PathBuf,
        destination: PathBuf,
    },
    EnqueueMove {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Copy or move every file of a folder, optionally recursing
    EnqueueFolder {
        source: PathBuf,
        destination: PathBuf,
        operation: Operation,
        recurse: bool,
        /// Lowercase extensions with the dot, or `"without extensions"`
        ignored_extensions: HashSet<String>,
    },
    /// Fetch a remote file into the download directory. Without credentials
    /// the browser's current peer is used.
    EnqueueDownload {
        remote_name: String,
        remote_dir: String,
        size: u64,
        credentials: Option<Credentials>,
    },
    Cancel {
        queue: QueueKind,
        job_id: String,
    },
    CancelAll {
        queue: QueueKind,
    },
    CleanupDisplay {
        queue: QueueKind,
    },
    QueryProgress {
        queue: QueueKind,
    },
    AuthorizeUser {
        username: String,
        password: String,
        root: PathBuf,
    },
    RevokeUser {
        username: String,
    },
    SetBandwidth {
        bytes_per_sec: u64,
    },
    StartServer,
    StopServer,
    /// Browse another peer; resets navigation to its root
    Connect {
        credentials: Credentials,
    },
    Browse {
        path: String,
        direction: BrowseDirection,
    },
    Shutdown,
}

//Report from the core to the frontend
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Status(String),
    Error(String),

    JobQueued {
        queue: QueueKind,
        job_id: String,
    },
    JobProgress {
        queue: QueueKind,
        job_id: String,
        transferred: u64,
        chunk_len: u64,
        total: u64,
    },
    JobStatus {
        queue: QueueKind,
        job_id: String,
        status: JobStatus,
    },
    JobFinished {
        queue: QueueKind,
        job_id: String,
    },
    JobError {
        queue: QueueKind,
        job_id: String,
        message: String,
    },
    /// A local transfer found its destination already in place
    DuplicateFound {
        path: PathBuf,
    },

    /// `"<n> remaining, <m> errors"`, sent when it changes
    QueueStatus {
        queue: QueueKind,
        text: String,
    },
    QueueProgress {
        queue: QueueKind,
        snapshot: QueueSnapshot,
        /// `"<transferred> / <total>"`
        text: String,
    },
    /// The queue ran out of work; carries the duplicates met since the last one
    QueueIdle {
        queue: QueueKind,
        duplicates: Vec<PathBuf>,
    },

    PeerDiscovered {
        username: String,
        addr: SocketAddr,
    },

    ServerStarted {
        identity: PeerIdentity,
    },
    ServerStopped,
    UserAuthorized {
        username: String,
    },
    UserRevoked {
        username: String,
    },

    Listing {
        location: String,
        rows: Vec<ListingRow>,
    },
    BrowseFailed {
        message: String,
    },
}

/// Drive a [`Backend`] from a command channel until `Shutdown` or until
/// every command sender is gone.
pub async fn run_backend(
    config: AppConfig,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let mut backend = Backend::new(config, event_tx.clone());

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "Name: {}, downloads go to {}",
            backend.config().username,
            backend.config().download_dir.display()
        )))
        .await;

    if let Err(e) = backend.start_discovery() {
        warn!("Peer discovery disabled: {:#}", e);
        let _ = event_tx
            .send(AppEvent::Error(format!("Peer discovery disabled: {}", e)))
            .await;
    }

    // Main loop: Wait for commands from the frontend
    while let Some(cmd) = cmd_rx.recv().await {
        if cmd == AppCommand::Shutdown {
            break;
        }
        backend.handle(cmd).await;
    }

    backend.shutdown().await;
    info!("Backend stopped");
}
