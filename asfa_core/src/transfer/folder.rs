use std::cmp::Ordering;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::utils::{extension_key, is_sys_file};

/// One file of a folder transfer and the directory it goes into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub source: PathBuf,
    pub destination_dir: PathBuf,
}

/// Files first, then folders, each by name
fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

/// Walk `source_dir` and create its mirror under `destination_dir`.
///
/// Returns the files to transfer, each directory's files before its
/// subdirectories. Symlinks, system files and files whose extension key is in
/// `ignored_extensions` are left out.
pub fn plan_folder(
    source_dir: &Path,
    destination_dir: &Path,
    recurse: bool,
    ignored_extensions: &HashSet<String>,
) -> io::Result<Vec<FolderEntry>> {
    let name = source_dir.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "source folder has no name")
    })?;
    let target = destination_dir.join(name);
    std::fs::create_dir_all(&target)?;

    let mut walker = WalkDir::new(source_dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by(files_first);
    if !recurse {
        walker = walker.max_depth(1);
    }

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let relative_dir = path
            .parent()
            .and_then(|p| p.strip_prefix(source_dir).ok())
            .unwrap_or(Path::new(""));
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            debug!("Skipping link {:?}", path);
        } else if file_type.is_dir() {
            if recurse {
                std::fs::create_dir_all(target.join(relative_dir).join(entry.file_name()))?;
            }
        } else if file_type.is_file() {
            let name = entry.file_name().to_str().unwrap_or_default();
            if is_sys_file(name) || ignored_extensions.contains(&extension_key(path)) {
                debug!("Skipping {:?}", path);
                continue;
            }
            entries.push(FolderEntry {
                source: path.to_path_buf(),
                destination_dir: target.join(relative_dir),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_plan_files_before_folders() {
        let src_root = tempfile::tempdir().unwrap();
        let dst_root = tempfile::tempdir().unwrap();
        let album = src_root.path().join("album");
        fs::create_dir_all(album.join("disc2")).unwrap();
        fs::write(album.join("01.mp3"), b"a").unwrap();
        fs::write(album.join("cover.JPG"), b"b").unwrap();
        fs::write(album.join("Folder.jpg"), b"c").unwrap();
        fs::write(album.join("notes"), b"d").unwrap();
        fs::write(album.join("disc2").join("02.mp3"), b"e").unwrap();
        // Sorts before "disc2" by name, still comes after the files
        fs::create_dir_all(album.join("art")).unwrap();

        let ignored: HashSet<String> = [".jpg".to_string()].into_iter().collect();
        let plan = plan_folder(&album, dst_root.path(), true, &ignored).unwrap();

        let names: Vec<_> = plan
            .iter()
            .map(|e| e.source.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["01.mp3", "notes", "02.mp3"]);
        assert_eq!(plan[0].destination_dir, dst_root.path().join("album"));
        assert_eq!(plan[2].destination_dir, dst_root.path().join("album").join("disc2"));
        assert!(dst_root.path().join("album").join("disc2").is_dir());
        assert!(dst_root.path().join("album").join("art").is_dir());
    }

    #[test]
    fn test_plan_without_recursion_and_extensionless_filter() {
        let src_root = tempfile::tempdir().unwrap();
        let dst_root = tempfile::tempdir().unwrap();
        let docs = src_root.path().join("docs");
        fs::create_dir_all(docs.join("sub")).unwrap();
        fs::write(docs.join("a.txt"), b"a").unwrap();
        fs::write(docs.join("LICENSE"), b"b").unwrap();
        fs::write(docs.join("sub").join("b.txt"), b"c").unwrap();

        let ignored: HashSet<String> = ["without extensions".to_string()].into_iter().collect();
        let plan = plan_folder(&docs, dst_root.path(), false, &ignored).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].source, docs.join("a.txt"));
        assert!(!dst_root.path().join("docs").join("sub").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_plan_skips_symlinks() {
        let src_root = tempfile::tempdir().unwrap();
        let dst_root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"s").unwrap();

        let share = src_root.path().join("share");
        fs::create_dir(&share).unwrap();
        fs::write(share.join("real.txt"), b"r").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), share.join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path(), share.join("linked_dir")).unwrap();

        let plan = plan_folder(&share, dst_root.path(), true, &HashSet::new()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].source, share.join("real.txt"));
        assert!(!dst_root.path().join("share").join("linked_dir").exists());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dst_root = tempfile::tempdir().unwrap();
        let missing = dst_root.path().join("nope");
        let err = plan_folder(&missing, dst_root.path(), true, &HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
