use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::discovery::{
    DISCOVERY_INTERVAL_SECS, DISCOVERY_PORT, MULTICAST_GROUP, MULTICAST_TTL,
};
use crate::identity;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "asfa";
const APP_NAME: &str = "asfa";
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "ASFA_CONFIG_DIR";

/// Default shared bandwidth for server data connections (10 MiB/s)
pub const DEFAULT_BANDWIDTH_LIMIT: u64 = 10 * 1024 * 1024;

/// Ports scanned when looking for a free server port
pub const SERVER_PORT_RANGE: std::ops::Range<u16> = 3000..6067;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: DISCOVERY_PORT,
            ttl: MULTICAST_TTL,
            interval_secs: DISCOVERY_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name announced to peers and shown in their browse list
    pub username: String,
    pub download_dir: PathBuf,
    pub server_port: u16,
    /// Bytes per second shared by server data connections, 0 = unlimited
    pub bandwidth_limit: u64,
    /// Store authorized users' passwords as blake3 digests
    pub hash_passwords: bool,
    pub log_level: String,
    pub discovery: DiscoveryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        // ~/asfa on every platform
        let download_dir = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("asfa");

        Self {
            username: identity::default_username(),
            download_dir,
            server_port: identity::find_available_port(SERVER_PORT_RANGE)
                .unwrap_or(SERVER_PORT_RANGE.start),
            bandwidth_limit: DEFAULT_BANDWIDTH_LIMIT,
            hash_passwords: false,
            log_level: "info".to_string(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from a specific file; missing or malformed files give defaults
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::get_config_path().context("No config directory available")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config {:?}", path))?;
        Ok(())
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = AppConfig::default();
        config.username = "alice".to_string();
        config.bandwidth_limit = 0;
        config.discovery.interval_secs = 7;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.bandwidth_limit, 0);
        assert_eq!(loaded.discovery.interval_secs, 7);
        assert_eq!(loaded.discovery.group, MULTICAST_GROUP);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{ "username": "bob" }"#).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.username, "bob");
        assert_eq!(loaded.bandwidth_limit, DEFAULT_BANDWIDTH_LIMIT);
        assert_eq!(loaded.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "not json").unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.log_level, "info");
        assert!(!loaded.hash_passwords);
    }
}
