//! Remote browser: navigates a peer's share and lists it, marking entries
//! that already exist in (or are on their way to) the download directory.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ftps::reply::parse_mlsd_line;
use crate::ftps::{Credentials, FtpError};
use crate::utils::{basename, is_sys_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowseDirection {
    /// Enter the given folder
    Forward,
    /// Go up one level
    Back,
    /// List the current folder again
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LocalExistence {
    Absent = 0,
    /// Same name and size already in the download directory
    Downloaded = 1,
    /// Currently queued or running in the download queue
    Downloading = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRow {
    pub name: String,
    pub existence: LocalExistence,
    pub kind: EntryType,
    pub size: u64,
    /// Where the entry would land when downloaded
    pub local_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("First, set your credentials in the Settings tab.")]
    NotAuthenticated,
    /// Rejected by the server, carries its reply
    #[error("{0}")]
    PermissionDenied(String),
    #[error("Failed. No connection could be made.")]
    ConnectionRefused,
    #[error("Failed. Something went wrong.")]
    Generic(#[source] FtpError),
}

impl From<FtpError> for BrowseError {
    fn from(e: FtpError) -> Self {
        if e.is_permanent() {
            BrowseError::PermissionDenied(e.to_string())
        } else if e.is_connection_refused() {
            BrowseError::ConnectionRefused
        } else {
            BrowseError::Generic(e)
        }
    }
}

/// Rows of one remote folder, classified against the local download
/// directory as they are consumed.
#[derive(Debug)]
pub struct Listing {
    location: String,
    lines: std::vec::IntoIter<String>,
    download_dir: PathBuf,
    in_flight: HashSet<String>,
}

impl Listing {
    fn new(
        location: String,
        lines: Vec<String>,
        download_dir: PathBuf,
        in_flight: HashSet<String>,
    ) -> Self {
        Self {
            location,
            lines: lines.into_iter(),
            download_dir,
            in_flight,
        }
    }

    /// Remote folder this listing came from
    pub fn location(&self) -> &str {
        &self.location
    }

    fn classify(&self, local_path: &Path, size: u64) -> LocalExistence {
        let on_disk = std::fs::metadata(local_path)
            .map(|m| m.is_file() && m.len() == size)
            .unwrap_or(false);
        if on_disk {
            LocalExistence::Downloaded
        } else if self.in_flight.contains(local_path.to_string_lossy().as_ref()) {
            LocalExistence::Downloading
        } else {
            LocalExistence::Absent
        }
    }
}

impl Iterator for Listing {
    type Item = ListingRow;

    fn next(&mut self) -> Option<ListingRow> {
        while let Some(line) = self.lines.next() {
            let Some(entry) = parse_mlsd_line(&line) else {
                debug!("Skipping unparsable listing line {:?}", line);
                continue;
            };
            let kind = match entry.kind.as_str() {
                "dir" => EntryType::Folder,
                "cdir" | "pdir" => continue,
                _ => EntryType::File,
            };
            let name = basename(&entry.name).to_string();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            if kind == EntryType::File && is_sys_file(&name) {
                continue;
            }
            let size = entry.size.unwrap_or(0);
            let local_path = self.download_dir.join(&name);
            let existence = self.classify(&local_path, size);
            return Some(ListingRow {
                name,
                existence,
                kind,
                size,
                local_path,
            });
        }
        None
    }
}

/// Client-side browsing state for one peer
#[derive(Debug)]
pub struct RemoteBrowser {
    credentials: Option<Credentials>,
    history: Vec<String>,
    download_dir: PathBuf,
}

impl RemoteBrowser {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            credentials: None,
            history: vec![String::new()],
            download_dir: download_dir.into(),
        }
    }

    /// Switch to another peer (or new credentials), back at its root
    pub fn connect(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
        self.reset();
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_download_dir(&mut self, dir: impl Into<PathBuf>) {
        self.download_dir = dir.into();
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn forward(&mut self, path: &str) {
        if !path.is_empty() {
            self.history.push(path.to_string());
        }
    }

    /// Go up one level; a no-op at the root
    pub fn back(&mut self) {
        if self.history.len() > 1 {
            self.history.pop();
        }
    }

    pub fn navigate(&mut self, path: &str, direction: BrowseDirection) {
        match direction {
            BrowseDirection::Forward => self.forward(path),
            BrowseDirection::Back => self.back(),
            BrowseDirection::Refresh => {}
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Remote path of the current folder, relative to the share root
    pub fn current_path(&self) -> String {
        self.history.join("/")
    }

    fn reset(&mut self) {
        self.history.truncate(1);
    }

    /// List the current folder. `in_flight` holds the ids (local paths) of
    /// active downloads. Any failure sends the browser back to the root.
    pub async fn list(&mut self, in_flight: HashSet<String>) -> Result<Listing, BrowseError> {
        match self.fetch_lines().await {
            Ok(lines) => {
                debug!("Fetched {} entries from '/{}'", lines.len(), self.current_path());
                Ok(Listing::new(
                    format!("/{}", self.current_path().trim_start_matches('/')),
                    lines,
                    self.download_dir.clone(),
                    in_flight,
                ))
            }
            Err(e) => {
                warn!("Error fetching files: {}", e);
                self.reset();
                Err(e)
            }
        }
    }

    async fn fetch_lines(&self) -> Result<Vec<String>, BrowseError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(BrowseError::NotAuthenticated)?;
        let mut client = credentials.open_session().await?;
        client.cwd(&self.current_path()).await?;
        let lines = client.mlsd(None).await?;
        if let Err(e) = client.quit().await {
            debug!("QUIT failed: {}", e);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftps::Reply;
    use std::io;

    #[test]
    fn test_history_navigation() {
        let mut browser = RemoteBrowser::new("/tmp");
        assert_eq!(browser.history(), [""]);
        browser.back();
        assert_eq!(browser.history(), [""]);

        browser.forward("music");
        browser.forward("");
        browser.navigate("rock", BrowseDirection::Forward);
        assert_eq!(browser.current_path(), "/music/rock");

        browser.navigate("ignored", BrowseDirection::Back);
        assert_eq!(browser.current_path(), "/music");
        browser.navigate("", BrowseDirection::Refresh);
        assert_eq!(browser.history(), ["", "music"]);

        browser.connect(Credentials::new("bob", "pw", "127.0.0.1", 3000));
        assert_eq!(browser.history(), [""]);
        assert_eq!(browser.current_path(), "");
    }

    #[tokio::test]
    async fn test_list_without_credentials() {
        let mut browser = RemoteBrowser::new("/tmp");
        browser.forward("music");
        let err = browser.list(HashSet::new()).await.unwrap_err();
        assert!(matches!(err, BrowseError::NotAuthenticated));
        assert_eq!(err.to_string(), "First, set your credentials in the Settings tab.");
        assert_eq!(browser.history(), [""]);
    }

    #[test]
    fn test_error_classification() {
        let err = BrowseError::from(FtpError::from_reply(Reply::new(
            550,
            "No such file or directory.",
        )));
        assert_eq!(err.to_string(), "550 No such file or directory.");

        let err = BrowseError::from(FtpError::Io(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        )));
        assert_eq!(err.to_string(), "Failed. No connection could be made.");

        let err = BrowseError::from(FtpError::Closed);
        assert_eq!(err.to_string(), "Failed. Something went wrong.");
    }

    #[test]
    fn test_listing_classifies_rows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.txt"), b"12345").unwrap();
        std::fs::write(dir.path().join("partial.txt"), b"12").unwrap();
        let queued = dir.path().join("queued.bin");
        let in_flight = HashSet::from([queued.to_string_lossy().into_owned()]);

        let lines = [
            "type=cdir; .",
            "type=pdir; ..",
            "type=dir;size=4096; albums",
            "type=file;size=5; done.txt",
            "type=file;size=5; partial.txt",
            "type=file;size=9; queued.bin",
            "type=file;size=1; desktop.ini",
            "type=dir;size=0; ~folder",
            "garbage",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let listing = Listing::new("/".into(), lines, dir.path().to_path_buf(), in_flight);
        let rows: Vec<(String, LocalExistence, EntryType)> =
            listing.map(|r| (r.name, r.existence, r.kind)).collect();

        assert_eq!(
            rows,
            vec![
                ("albums".into(), LocalExistence::Absent, EntryType::Folder),
                ("done.txt".into(), LocalExistence::Downloaded, EntryType::File),
                ("partial.txt".into(), LocalExistence::Absent, EntryType::File),
                ("queued.bin".into(), LocalExistence::Downloading, EntryType::File),
                ("~folder".into(), LocalExistence::Absent, EntryType::Folder),
            ]
        );
    }
}
