use std::path::Path;

/// File names that are never listed or transferred
const EXCLUDED_NAMES: [&str; 3] = ["AlbumArtSmall.jpg", "Folder.jpg", "desktop.ini"];

/// Prefixes of generated/temporary files that are never listed or transferred
const EXCLUDED_PREFIXES: [&str; 2] = ["AlbumArt_", "~"];

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Last component of a path, ignoring trailing separators.
///
/// Works for both `/` and `\` separated paths so remote (FTP) names and local
/// Windows paths resolve the same way.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
}

/// Whether a file name matches one of the known system/junk file patterns
pub fn is_sys_file(path: &str) -> bool {
    let name = basename(path);
    EXCLUDED_NAMES.contains(&name) || EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Lowercased extension (with the leading dot) used to filter folder transfers.
/// Files without one map to `"without extensions"`.
pub fn extension_key(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.to_lowercase()),
        _ => "without extensions".to_string(),
    }
}

/// Format a byte count for display (max unit GB)
pub fn format_bytes(bytes: u64) -> String {
    let value = bytes as f64;
    if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.2} MB", value / MB)
    } else if value >= KB {
        format!("{:.2} KB", value / KB)
    } else {
        format!("{} Bytes", bytes)
    }
}

/// Percentage of `done` over `total`, treating an empty total as finished
pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 * 100.0) / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename_strips_trailing_separator() {
        assert_eq!(basename("music/rock/"), "rock");
        assert_eq!(basename("/abs/path/file.txt"), "file.txt");
        assert_eq!(basename("C:\\Users\\me\\song.mp3"), "song.mp3");
        assert_eq!(basename("plain"), "plain");
        assert_eq!(basename(""), "");
    }

    #[test]
    fn test_sys_files() {
        assert!(is_sys_file("desktop.ini"));
        assert!(is_sys_file("/share/Folder.jpg"));
        assert!(is_sys_file("AlbumArt_{1234}_Large.jpg"));
        assert!(is_sys_file("~$report.docx"));
        assert!(!is_sys_file("report.docx"));
        assert!(!is_sys_file("folder.jpeg"));
    }

    #[test]
    fn test_extension_key() {
        assert_eq!(extension_key(Path::new("a/b/Movie.MKV")), ".mkv");
        assert_eq!(extension_key(Path::new("README")), "without extensions");
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(512), "512 Bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_percentage_of_empty_total() {
        assert_eq!(percentage(0, 0), 100.0);
        assert_eq!(percentage(50, 200), 25.0);
    }
}
