use crate::core::firewall::DEFAULT_PORTS;
use crate::core::snapshot::{DEFAULT_BACKUP_PATH, DEFAULT_RETENTION};
use crate::utils::get_data_dir;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Optional settings read from `config.json`
///
/// Every field has a default, so a missing or partial file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// `PORT/PROTOCOL` entries used when `--ports` is not given
    #[serde(default = "default_ports")]
    pub default_ports: Vec<String>,
    /// Where the pre-change backup is written
    #[serde(default = "default_backup_path")]
    pub backup_path: PathBuf,
    /// Persist applied rules unless `--no-save` is given
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Timestamped snapshots kept in the state directory
    #[serde(default = "default_retention")]
    pub snapshot_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ports: default_ports(),
            backup_path: default_backup_path(),
            persist: true,
            snapshot_retention: DEFAULT_RETENTION,
        }
    }
}

impl Config {
    /// Default port list in the comma-separated `--ports` form
    pub fn default_ports_arg(&self) -> String {
        self.default_ports.join(",")
    }
}

fn default_ports() -> Vec<String> {
    DEFAULT_PORTS.split(',').map(String::from).collect()
}

fn default_backup_path() -> PathBuf {
    PathBuf::from(DEFAULT_BACKUP_PATH)
}

fn default_true() -> bool {
    true
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

/// Location of the config file: `PORTWALL_CONFIG`, else the XDG data directory.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PORTWALL_CONFIG")
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from disk, or returns default if not found.
pub async fn load_config() -> Config {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => Config::default(),
    }
}

/// Loads the config at `path`. A missing file yields the defaults; an
/// unreadable or malformed one is logged and also yields the defaults.
pub async fn load_config_from(path: &Path) -> Config {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<Config>(&json) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring malformed config {:?}: {e}", path);
                Config::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            warn!("Failed to read config {:?}: {e}", path);
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).await;
        assert_eq!(config, Config::default());
        assert_eq!(config.default_ports_arg(), "22/tcp,80/tcp,443/tcp,9100/tcp");
        assert!(config.persist);
    }

    #[tokio::test]
    async fn test_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_ports": ["2222/tcp", "51820/udp"], "persist": false}"#)
            .unwrap();

        let config = load_config_from(&path).await;
        assert_eq!(config.default_ports_arg(), "2222/tcp,51820/udp");
        assert!(!config.persist);
        assert_eq!(config.backup_path, PathBuf::from(DEFAULT_BACKUP_PATH));
        assert_eq!(config.snapshot_retention, DEFAULT_RETENTION);
    }

    #[tokio::test]
    async fn test_malformed_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_config_from(&path).await, Config::default());
    }

    #[test]
    fn test_config_path_env_override() {
        let _guard = crate::core::test_helpers::ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("PORTWALL_CONFIG", "/etc/portwall.json");
        }
        let path = config_path();
        unsafe {
            std::env::remove_var("PORTWALL_CONFIG");
        }

        assert_eq!(path, Some(PathBuf::from("/etc/portwall.json")));
    }
}
