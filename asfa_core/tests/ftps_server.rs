//! Server, downloads and browsing against a real loopback FTPS server.

use asfa_core::AppEvent;
use asfa_core::browser::{EntryType, LocalExistence, RemoteBrowser};
use asfa_core::config::DiscoveryConfig;
use asfa_core::download::DownloadJob;
use asfa_core::ftps::{Credentials, FtpError, FtpsClient, TransferServer};
use asfa_core::jobs::{Job, JobQueueManager, JobStatus, QueueKind};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

struct Fixture {
    server: TransferServer,
    share: TempDir,
    downloads: TempDir,
    port: u16,
}

impl Fixture {
    async fn start(bandwidth: u64) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init()
            .ok();

        let share = tempfile::tempdir().unwrap();
        std::fs::create_dir(share.path().join("music")).unwrap();
        std::fs::write(share.path().join("music").join("song.bin"), patterned(300_000)).unwrap();
        std::fs::write(share.path().join("readme.txt"), b"hello peers").unwrap();
        std::fs::write(share.path().join("desktop.ini"), b"junk").unwrap();

        let discovery = DiscoveryConfig {
            group: Ipv4Addr::LOCALHOST,
            port: 9,
            ..DiscoveryConfig::default()
        };
        let mut server = TransferServer::new(bandwidth, false, discovery);
        server.authorize("bob", "secret", share.path()).unwrap();
        let identity = server
            .start("tester", "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        Self {
            server,
            share,
            downloads: tempfile::tempdir().unwrap(),
            port: identity.addr.port(),
        }
    }

    fn credentials(&self, username: &str, password: &str) -> Credentials {
        Credentials::new(username, password, "127.0.0.1", self.port)
    }

    fn download_dir(&self) -> &Path {
        self.downloads.path()
    }
}

fn downloads() -> (JobQueueManager<DownloadJob>, mpsc::Receiver<AppEvent>) {
    let (tx, rx) = mpsc::channel(8192);
    (JobQueueManager::new(QueueKind::Downloads, tx), rx)
}

async fn collect_until<F>(rx: &mut mpsc::Receiver<AppEvent>, mut pred: F) -> Vec<AppEvent>
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn terminal_status(job_id: &str) -> impl FnMut(&AppEvent) -> bool + '_ {
    move |e| {
        matches!(e, AppEvent::JobStatus { job_id: id, status, .. }
            if id == job_id && status.is_terminal())
    }
}

fn job_error(events: &[AppEvent]) -> Option<&str> {
    events.iter().find_map(|e| match e {
        AppEvent::JobError { message, .. } => Some(message.as_str()),
        _ => None,
    })
}

#[tokio::test]
async fn test_download_file() {
    let fixture = Fixture::start(0).await;
    let (manager, mut rx) = downloads();

    let job = DownloadJob::new(
        "song.bin",
        "music",
        300_000,
        fixture.credentials("bob", "secret"),
        fixture.download_dir(),
    );
    let job_id = job.id().to_string();
    let local = job.destination().to_path_buf();
    manager.enqueue(job).unwrap();

    let events = collect_until(&mut rx, |e| {
        matches!(e, AppEvent::JobFinished { job_id: id, .. } if *id == job_id)
    })
    .await;
    assert!(events.contains(&AppEvent::JobStatus {
        queue: QueueKind::Downloads,
        job_id: job_id.clone(),
        status: JobStatus::Complete,
    }));
    let last_progress = events.iter().rev().find_map(|e| match e {
        AppEvent::JobProgress {
            transferred, total, ..
        } => Some((*transferred, *total)),
        _ => None,
    });
    assert_eq!(last_progress, Some((300_000, 300_000)));
    assert_eq!(local, fixture.download_dir().join("song.bin"));
    assert_eq!(std::fs::read(&local).unwrap(), patterned(300_000));
}

#[tokio::test]
async fn test_cancel_deletes_partial_download() {
    let fixture = Fixture::start(512 * 1024).await;
    let big = fixture.share.path().join("big.bin");
    std::fs::write(&big, patterned(4 * 1024 * 1024)).unwrap();
    let (manager, mut rx) = downloads();

    let job = DownloadJob::new(
        "big.bin",
        "",
        4 * 1024 * 1024,
        fixture.credentials("bob", "secret"),
        fixture.download_dir(),
    );
    let job_id = job.id().to_string();
    let local = job.destination().to_path_buf();
    manager.enqueue(job).unwrap();

    collect_until(&mut rx, |e| {
        matches!(e, AppEvent::JobProgress { transferred, .. } if *transferred > 0)
    })
    .await;
    assert!(manager.kill(&job_id));
    assert!(!manager.is_active(&job_id));

    let events = collect_until(&mut rx, terminal_status(&job_id)).await;
    assert_eq!(
        events.last(),
        Some(&AppEvent::JobStatus {
            queue: QueueKind::Downloads,
            job_id: job_id.clone(),
            status: JobStatus::Complete,
        })
    );
    assert_eq!(job_error(&events), None);
    assert!(!local.exists());
}

#[tokio::test]
async fn test_bad_credentials_and_missing_files() {
    let fixture = Fixture::start(0).await;
    let (manager, mut rx) = downloads();

    let cases = [
        ("wrong.bin", "", fixture.credentials("bob", "nope"), "530 Authentication failed."),
        ("who.bin", "", fixture.credentials("eve", "secret"), "530 Authentication failed."),
        (
            "anon.bin",
            "",
            fixture.credentials("anonymous", ""),
            "530 Anonymous access not allowed.",
        ),
        (
            "missing.bin",
            "music",
            fixture.credentials("bob", "secret"),
            "550 No such file or directory.",
        ),
        (
            "song.bin",
            "nowhere",
            fixture.credentials("bob", "secret"),
            "550 No such file or directory.",
        ),
    ];

    for (name, dir, credentials, expected) in cases {
        let job = DownloadJob::new(name, dir, 10, credentials, fixture.download_dir());
        let job_id = job.id().to_string();
        let local = job.destination().to_path_buf();
        manager.enqueue(job).unwrap();

        let events = collect_until(&mut rx, terminal_status(&job_id)).await;
        assert_eq!(job_error(&events), Some(expected), "{}", name);
        assert!(matches!(
            events.last(),
            Some(AppEvent::JobStatus {
                status: JobStatus::Error,
                ..
            })
        ));
        assert!(!local.exists(), "partial file left for {}", name);
    }
    assert_eq!(manager.snapshot().errors, 5);
}

#[tokio::test]
async fn test_connection_refused_message() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let downloads_dir = tempfile::tempdir().unwrap();
    let (manager, mut rx) = downloads();
    let job = DownloadJob::new(
        "a.bin",
        "",
        1,
        Credentials::new("bob", "pw", "127.0.0.1", port),
        downloads_dir.path(),
    );
    let job_id = job.id().to_string();
    manager.enqueue(job).unwrap();

    let events = collect_until(&mut rx, terminal_status(&job_id)).await;
    assert_eq!(job_error(&events), Some("No connection could be made."));
}

#[tokio::test]
async fn test_browse_listing() {
    let fixture = Fixture::start(0).await;
    // Same size as the remote song: reported as already downloaded
    std::fs::write(fixture.download_dir().join("song.bin"), patterned(300_000)).unwrap();
    let queued: PathBuf = fixture.download_dir().join("readme.txt");

    let mut browser = RemoteBrowser::new(fixture.download_dir());
    browser.connect(fixture.credentials("bob", "secret"));

    let rows: Vec<_> = browser
        .list(HashSet::from([queued.to_string_lossy().into_owned()]))
        .await
        .unwrap()
        .collect();
    let names: Vec<(&str, EntryType, LocalExistence)> = rows
        .iter()
        .map(|r| (r.name.as_str(), r.kind, r.existence))
        .collect();
    assert_eq!(
        names,
        vec![
            ("music", EntryType::Folder, LocalExistence::Absent),
            ("readme.txt", EntryType::File, LocalExistence::Downloading),
        ]
    );

    browser.forward("music");
    let listing = browser.list(HashSet::new()).await.unwrap();
    assert_eq!(listing.location(), "/music");
    let rows: Vec<_> = listing.collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "song.bin");
    assert_eq!(rows[0].size, 300_000);
    assert_eq!(rows[0].existence, LocalExistence::Downloaded);

    // A failed listing sends the browser home
    browser.forward("missing");
    let err = browser.list(HashSet::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "550 No such file or directory.");
    assert_eq!(browser.history(), [""]);
}

#[tokio::test]
async fn test_authorization_changes_apply_to_new_logins() {
    let mut fixture = Fixture::start(0).await;
    let other = tempfile::tempdir().unwrap();
    std::fs::write(other.path().join("note.txt"), b"for alice").unwrap();

    fixture
        .server
        .authorize("alice", "pw", other.path())
        .unwrap();
    let mut client = fixture.credentials("alice", "pw").open_session().await.unwrap();
    assert_eq!(client.size("note.txt").await.unwrap(), 9);

    assert!(fixture.server.revoke("alice"));
    // The open session keeps working
    assert_eq!(client.pwd().await.unwrap(), "/");
    client.quit().await.unwrap();

    let err = fixture
        .credentials("alice", "pw")
        .open_session()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FtpError::Permanent { code: 530, .. }));

    assert!(fixture.server.stop().await);
}

#[tokio::test]
async fn test_paths_stay_inside_the_root() {
    let fixture = Fixture::start(0).await;
    let mut client = fixture.credentials("bob", "secret").open_session().await.unwrap();

    client.cwd("../../..").await.unwrap();
    assert_eq!(client.pwd().await.unwrap(), "/");
    client.cwd("music").await.unwrap();
    assert_eq!(client.pwd().await.unwrap(), "/music");
    client.cwd("/../music/..").await.unwrap();
    assert_eq!(client.pwd().await.unwrap(), "/");

    let err = client.cwd("/etc").await.unwrap_err();
    assert!(matches!(err, FtpError::Permanent { code: 550, .. }));
    let err = client.size("../../etc/passwd").await.unwrap_err();
    assert!(matches!(err, FtpError::Permanent { code: 550, .. }));
    client.quit().await.unwrap();
}

#[tokio::test]
async fn test_plaintext_commands_are_refused() {
    let fixture = Fixture::start(0).await;
    let mut stream = TcpStream::connect(("127.0.0.1", fixture.port)).await.unwrap();
    let mut buf = vec![0u8; 256];

    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"220 asfa server\r\n");

    stream.write_all(b"USER bob\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"550 SSL/TLS required on the control channel.\r\n");

    stream.write_all(b"QUIT\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"221 Goodbye.\r\n");
}

#[tokio::test]
async fn test_data_channel_requires_protection() {
    let fixture = Fixture::start(0).await;
    let mut client = FtpsClient::connect("127.0.0.1", fixture.port).await.unwrap();
    client.login("bob", "secret").await.unwrap();
    // No PROT P yet: data commands are refused
    let err = client.mlsd(None).await.unwrap_err();
    assert!(matches!(err, FtpError::Permanent { code: 522, .. }));

    client.prot_p().await.unwrap();
    let lines = client.mlsd(None).await.unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "type=file;size=4; desktop.ini");
    // Folder sizes depend on the filesystem
    assert!(lines[1].starts_with("type=dir;size=") && lines[1].ends_with("; music"));
    assert_eq!(lines[2], "type=file;size=11; readme.txt");
    client.quit().await.unwrap();
}
