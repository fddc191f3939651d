//! Configuration management for LeadFlow.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadFlowError, Result};

/// Top-level LeadFlow configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadFlowConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage settings.
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Duplicate-detection cache.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Lead capture behaviour.
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file (None = `leadflow.db` next to the config file).
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a captured phone/email blocks re-capture, in seconds.
    #[serde(default = "default_duplicate_ttl")]
    pub duplicate_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_duplicate_ttl() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            duplicate_ttl_secs: default_duplicate_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Keep a lead when no agent is eligible instead of rejecting it.
    #[serde(default)]
    pub allow_unassigned: bool,
    /// Window for the repository duplicate check.
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_hours: i64,
    /// Due date offset of the initial follow-up task.
    #[serde(default = "default_follow_up_delay")]
    pub follow_up_delay_hours: i64,
}

fn default_duplicate_window() -> i64 {
    24
}

fn default_follow_up_delay() -> i64 {
    24
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            allow_unassigned: false,
            duplicate_window_hours: default_duplicate_window(),
            follow_up_delay_hours: default_follow_up_delay(),
        }
    }
}

impl LeadFlowConfig {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadFlowError::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| LeadFlowError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadFlowError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("leadflow")
    }

    /// Resolved SQLite database path.
    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(p) => PathBuf::from(p),
            None => Self::config_dir().join("leadflow.db"),
        }
    }

    /// `host:port` for the API listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = LeadFlowConfig::load(Path::new("/nonexistent/leadflow.toml")).unwrap();
        assert_eq!(config, LeadFlowConfig::default());
        assert_eq!(config.capture.duplicate_window_hours, 24);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: LeadFlowConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [capture]
            allow_unassigned = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert!(parsed.capture.allow_unassigned);
        assert_eq!(parsed.capture.follow_up_delay_hours, 24);
        assert_eq!(parsed.cache.duplicate_ttl_secs, 3600);
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("leadflow-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = LeadFlowConfig::default();
        config.database.path = Some("/var/lib/leadflow/leads.db".into());
        config.save(&path).unwrap();

        let loaded = LeadFlowConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.database_path(), PathBuf::from("/var/lib/leadflow/leads.db"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let path = std::env::temp_dir().join(format!("leadflow-bad-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "server = [").unwrap();
        let result = LeadFlowConfig::load(&path);
        assert!(matches!(result, Err(LeadFlowError::Config(_))));
        std::fs::remove_file(&path).unwrap();
    }
}
