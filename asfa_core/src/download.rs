//! Download engine: retrieves one remote file from a peer's server into the
//! local download directory.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ftps::{Credentials, DataStream, FtpError, FtpsClient};
use crate::jobs::{Job, JobEvents, JobStatus, Operation};
use crate::transfer::fs_ops;
use crate::utils::basename;

/// Upper bound for a single read from the data connection
pub const MAX_BLOCK_SIZE: usize = 10 * 1024 * 1024;
const FALLBACK_BLOCK_SIZE: usize = 1024;

/// Read size for a file of `declared` bytes
pub fn block_size(declared: u64) -> usize {
    if declared == 0 {
        FALLBACK_BLOCK_SIZE
    } else {
        declared.min(MAX_BLOCK_SIZE as u64) as usize
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Remote(#[from] FtpError),
    #[error("Cannot write '{}': {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    /// Message reported on the job: the server's own text for rejected
    /// commands, a friendly one for refused connections.
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::Remote(e) if e.is_connection_refused() => {
                "No connection could be made.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Complete(u64),
    Cancelled(u64),
}

/// Resources held by a running download. `close` releases whatever is
/// still open and may be called any number of times.
#[derive(Default)]
struct DownloadSession {
    client: Option<FtpsClient>,
    data: Option<DataStream>,
    file: Option<File>,
}

impl DownloadSession {
    async fn abort(&mut self) {
        let data = self.data.take();
        if let (Some(client), Some(data)) = (self.client.as_mut(), data) {
            if let Err(e) = client.abort(data).await {
                debug!("ABOR failed: {}", e);
            }
        }
    }

    async fn close(&mut self) {
        self.data.take();
        if let Some(client) = self.client.take() {
            if let Err(e) = client.quit().await {
                debug!("QUIT failed: {}", e);
            }
        }
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }
}

/// One remote file to fetch. Its id is the local destination path, so the
/// same file cannot be queued twice.
#[derive(Debug)]
pub struct DownloadJob {
    id: String,
    remote_name: String,
    remote_dir: String,
    remote_path: PathBuf,
    destination: PathBuf,
    size: u64,
    credentials: Credentials,
    cancel: CancellationToken,
}

impl DownloadJob {
    pub fn new(
        remote_name: &str,
        remote_dir: &str,
        size: u64,
        credentials: Credentials,
        download_dir: &Path,
    ) -> Self {
        let destination = download_dir.join(basename(remote_name));
        let remote_path = PathBuf::from(format!(
            "ftps://{}:{}/{}",
            credentials.host,
            credentials.port,
            [remote_dir.trim_matches('/'), remote_name]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("/")
        ));
        Self {
            id: destination.to_string_lossy().into_owned(),
            remote_name: remote_name.to_string(),
            remote_dir: remote_dir.to_string(),
            remote_path,
            destination,
            size,
            credentials,
            cancel: CancellationToken::new(),
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    fn local_error(&self, source: io::Error) -> DownloadError {
        DownloadError::Local {
            path: self.destination.clone(),
            source,
        }
    }

    async fn fetch(
        &self,
        session: &mut DownloadSession,
        events: &JobEvents,
    ) -> Result<Fetch, DownloadError> {
        let file = session.file.insert(
            File::create(&self.destination)
                .await
                .map_err(|e| self.local_error(e))?,
        );
        let client = session.client.insert(self.credentials.open_session().await?);
        client.cwd(&self.remote_dir).await?;
        events.status(JobStatus::Running);

        let data = session.data.insert(client.retrieve(&self.remote_name).await?);
        let mut buffer = vec![0u8; block_size(self.size)];
        let mut transferred: u64 = 0;

        loop {
            let n = data.read(&mut buffer).await.map_err(FtpError::from)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .await
                .map_err(|e| self.local_error(e))?;
            transferred += n as u64;
            events.progress(transferred, n as u64, self.size.max(transferred));

            if self.cancel.is_cancelled() {
                return Ok(Fetch::Cancelled(transferred));
            }
        }

        file.flush().await.map_err(|e| self.local_error(e))?;
        if let Some(data) = session.data.take() {
            client.finish_transfer(data).await?;
        }
        Ok(Fetch::Complete(transferred))
    }

    async fn execute(self, events: JobEvents) {
        let mut session = DownloadSession::default();
        let result = self.fetch(&mut session, &events).await;

        match result {
            Ok(Fetch::Complete(bytes)) => {
                session.close().await;
                if bytes == 0 {
                    events.progress(0, 0, 0);
                }
                info!(job_id = %self.id, "Downloaded {} bytes", bytes);
                events.status(JobStatus::Complete);
                events.finished();
            }
            Ok(Fetch::Cancelled(bytes)) => {
                session.abort().await;
                session.close().await;
                fs_ops::delete_file(&self.destination).await;
                info!(job_id = %self.id, "Download cancelled after {} bytes", bytes);
                events.status(JobStatus::Complete);
                events.finished();
            }
            Err(e) => {
                session.close().await;
                fs_ops::delete_file(&self.destination).await;
                let message = e.user_message();
                warn!(job_id = %self.id, "Couldn't download: {}", e);
                events.error(message);
                events.status(JobStatus::Error);
            }
        }
    }
}

impl Job for DownloadJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> &Path {
        &self.remote_path
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    fn operation(&self) -> Operation {
        Operation::Copy
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftps::Reply;

    fn creds() -> Credentials {
        Credentials::new("bob", "pw", "127.0.0.1", 3000)
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(0), 1024);
        assert_eq!(block_size(500), 500);
        assert_eq!(block_size(50 * 1024 * 1024), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_job_identity() {
        let dir = Path::new("/home/me/asfa");
        let job = DownloadJob::new("song.mp3", "music/rock", 42, creds(), dir);
        assert_eq!(job.destination(), dir.join("song.mp3"));
        assert_eq!(job.id(), dir.join("song.mp3").to_string_lossy());
        assert_eq!(job.source(), Path::new("ftps://127.0.0.1:3000/music/rock/song.mp3"));
        assert_eq!(job.size(), 42);
        assert_eq!(job.operation(), Operation::Copy);

        let root = DownloadJob::new("a.txt", "", 1, creds(), dir);
        assert_eq!(root.source(), Path::new("ftps://127.0.0.1:3000/a.txt"));
    }

    #[test]
    fn test_user_messages() {
        let refused = DownloadError::Remote(FtpError::Io(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        )));
        assert_eq!(refused.user_message(), "No connection could be made.");

        let missing = DownloadError::Remote(FtpError::from_reply(Reply::new(
            550,
            "No such file or directory.",
        )));
        assert_eq!(missing.user_message(), "550 No such file or directory.");

        let auth = DownloadError::Remote(FtpError::from_reply(Reply::new(
            530,
            "Authentication failed.",
        )));
        assert_eq!(auth.user_message(), "530 Authentication failed.");
    }
}
