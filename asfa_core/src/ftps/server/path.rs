//! Virtual paths: what a session sees is always rooted at `/`, which maps to
//! the authenticated user's shared directory.

use std::path::{Path, PathBuf};

/// Normalize `arg` against the virtual working directory `cwd`.
///
/// The result is absolute; `..` stops at `/`.
pub fn resolve_virtual(cwd: &str, arg: &str) -> String {
    let mut parts: Vec<&str> = if arg.starts_with('/') {
        Vec::new()
    } else {
        cwd.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in arg.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Map a normalized virtual path onto the real filesystem under `root`
pub fn to_real(root: &Path, virtual_path: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in virtual_path.split('/').filter(|s| !s.is_empty()) {
        if segment.contains(['\\', '\0']) || segment == ".." {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

/// Canonical form of `path` if it exists and stays inside `root`
/// (`root` must already be canonical). Catches symlinks leading out.
pub async fn contained(root: &Path, path: &Path) -> Option<PathBuf> {
    let canonical = tokio::fs::canonicalize(path).await.ok()?;
    canonical.starts_with(root).then_some(canonical)
}
