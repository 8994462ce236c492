use crate::core::store::{JsonRuleFile, PersistenceError};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides [`AppConfig::iptables_command`] when set
pub const IPTABLES_COMMAND_ENV: &str = "PHOQUE_IPTABLES_COMMAND";

/// Application configuration, stored at `<data dir>/config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// iptables binary, by name or absolute path
    #[serde(default = "default_iptables_command")]
    pub iptables_command: String,
    /// Rule file location (default: `<data dir>/rules.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
    /// Also delete `phoque-<uuid>` entries whose id names no stored rule.
    /// Leftovers of stored rules are always removed.
    #[serde(default = "default_true")]
    pub sweep_untracked: bool,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables_command: default_iptables_command(),
            rules_file: None,
            sweep_untracked: true,
            audit_log: true,
        }
    }
}

impl AppConfig {
    /// The iptables binary to run; the environment takes precedence.
    pub fn iptables_command(&self) -> String {
        std::env::var(IPTABLES_COMMAND_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.iptables_command.clone())
    }

    pub fn rules_file(&self) -> Result<PathBuf, PersistenceError> {
        match self.rules_file {
            Some(ref path) => Ok(path.clone()),
            None => JsonRuleFile::default_path(),
        }
    }
}

fn default_iptables_command() -> String {
    "iptables".to_string()
}

fn default_true() -> bool {
    true
}

pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config_to(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        tokio::fs::write(&temp_path, json.as_bytes()).await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config at `path`, or the defaults if it is missing or unreadable.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from the data directory. On first run the defaults are
/// written out so they can be edited.
pub async fn load_config() -> AppConfig {
    let Some(path) = config_path() else {
        return AppConfig::default();
    };

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let config = AppConfig::default();
        match save_config_to(&path, &config).await {
            Ok(()) => tracing::info!("Wrote default config to {:?}", path),
            Err(e) => tracing::warn!("Could not write default config {:?}: {}", path, e),
        }
        return config;
    }

    load_config_from(&path).await
}
