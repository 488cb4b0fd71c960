//! Persisted settings, loaded from `~/.territory/settings.toml`.
//!
//! Settings provide defaults; environment variables override them during
//! `Config` resolution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub territory: TerritorySettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerritorySettings {
    pub page_size: usize,
    pub chunk_size: usize,
    pub page_delay_ms: u64,
    pub audit: AuditSettings,
}

impl Default for TerritorySettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            chunk_size: 500,
            page_delay_ms: 50,
            audit: AuditSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "logs/assignment_audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub libsql_path: Option<String>,
    pub libsql_url: Option<String>,
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".territory")
            .join("settings.toml")
    }

    /// Load settings from `TERRITORY_SETTINGS` or the default location.
    /// A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os("TERRITORY_SETTINGS") {
            Some(raw) if !raw.is_empty() => PathBuf::from(raw),
            _ => Self::default_path(),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
