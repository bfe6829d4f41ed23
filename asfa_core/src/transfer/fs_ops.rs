//! Filesystem helpers for local transfers. Release-type operations (unlink,
//! empty-directory removal) swallow and log their failures.

use filetime::FileTime;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A directory destination means "inside that directory, same file name"
pub fn resolve_destination(source: &Path, destination: PathBuf) -> PathBuf {
    if destination.is_dir() {
        if let Some(name) = source.file_name() {
            return destination.join(name);
        }
    }
    destination
}

/// Whether `path` is a regular file of exactly `size` bytes
pub async fn file_exists_with_size(path: &Path, size: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() == size,
        Err(_) => false,
    }
}

/// Whether a rename from `source` to `destination` can stay on one device.
///
/// The destination may not exist yet, in which case its parent is checked.
pub fn same_filesystem(source: &Path, destination: &Path) -> bool {
    let target = if destination.exists() {
        destination
    } else {
        match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    };

    same_device(source, target)
}

#[cfg(unix)]
fn same_device(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

/// Compares path roots (drive prefixes) where device ids are unavailable
#[cfg(not(unix))]
fn same_device(a: &Path, b: &Path) -> bool {
    if !a.exists() || !b.exists() {
        return false;
    }
    let root = |p: &Path| {
        std::path::absolute(p)
            .ok()
            .and_then(|abs| abs.components().next().map(|c| c.as_os_str().to_owned()))
    };
    match (root(a), root(b)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
        _ => false,
    }
}

/// Copy timestamps, permissions and extended attributes from `source` onto
/// `destination`. Attributes the destination refuses are skipped.
pub async fn copy_metadata(source: &Path, destination: &Path) -> io::Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let meta = std::fs::metadata(&source)?;
        copy_xattrs(&source, &destination);
        filetime::set_file_times(
            &destination,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )?;
        // Permissions last, the source may be read-only
        std::fs::set_permissions(&destination, meta.permissions())
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(unix)]
fn copy_xattrs(source: &Path, destination: &Path) {
    let names = match xattr::list(source) {
        Ok(names) => names,
        Err(e) => {
            debug!("No extended attributes read from {:?}: {}", source, e);
            return;
        }
    };
    for name in names {
        match xattr::get(source, &name) {
            Ok(Some(value)) => {
                if let Err(e) = xattr::set(destination, &name, &value) {
                    debug!("Extended attribute {:?} not copied to {:?}: {}", name, destination, e);
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Extended attribute {:?} unreadable on {:?}: {}", name, source, e),
        }
    }
}

#[cfg(not(unix))]
fn copy_xattrs(_source: &Path, _destination: &Path) {}

pub async fn delete_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not delete {:?}: {}", path, e),
    }
}

/// Remove a directory if it is empty
pub async fn remove_folder(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir(path).await {
        debug!("Kept folder {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_destination_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_destination(Path::new("/music/song.mp3"), dir.path().to_path_buf());
        assert_eq!(resolved, dir.path().join("song.mp3"));

        let file_target = dir.path().join("renamed.mp3");
        assert_eq!(
            resolve_destination(Path::new("/music/song.mp3"), file_target.clone()),
            file_target
        );
    }

    #[tokio::test]
    async fn test_file_exists_with_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();

        assert!(file_exists_with_size(&path, 16).await);
        assert!(!file_exists_with_size(&path, 15).await);
        assert!(!file_exists_with_size(dir.path(), 0).await);
        assert!(!file_exists_with_size(&dir.path().join("missing"), 0).await);
    }

    #[test]
    fn test_same_filesystem_within_one_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();
        assert!(same_filesystem(&src, &dir.path().join("b.txt")));
        assert!(!same_filesystem(&dir.path().join("missing"), &dir.path().join("b.txt")));
    }

    #[tokio::test]
    async fn test_copy_metadata_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"hello").unwrap();
        std::fs::write(&dst, b"hello").unwrap();

        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        std::fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(old)
            .unwrap();

        copy_metadata(&src, &dst).await.unwrap();
        let modified = std::fs::metadata(&dst).unwrap().modified().unwrap();
        assert_eq!(modified, old);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_metadata_carries_extended_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tagged.txt");
        let dst = dir.path().join("copy.txt");
        std::fs::write(&src, b"hello").unwrap();
        std::fs::write(&dst, b"hello").unwrap();

        if xattr::set(&src, "user.asfa.tag", b"blue").is_err() {
            // Filesystem without user attributes (tmpfs on older kernels)
            return;
        }
        copy_metadata(&src, &dst).await.unwrap();
        assert_eq!(
            xattr::get(&dst, "user.asfa.tag").unwrap(),
            Some(b"blue".to_vec())
        );
    }

    #[tokio::test]
    async fn test_remove_folder_keeps_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full");
        let empty = dir.path().join("empty");
        std::fs::create_dir(&full).unwrap();
        std::fs::create_dir(&empty).unwrap();
        std::fs::write(full.join("f"), b"x").unwrap();

        remove_folder(&full).await;
        remove_folder(&empty).await;
        assert!(full.exists());
        assert!(!empty.exists());

        // Missing files are not an error
        delete_file(&dir.path().join("nope")).await;
    }
}
