//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then `Settings` from the TOML file,
//! then environment variables (with `.env` loaded by `dotenvy`).

mod helpers;
mod territory;

use std::path::PathBuf;

use secrecy::SecretString;

pub use self::territory::{AuditConfig, TerritoryConfig};
use crate::config::helpers::optional_env;
use crate::error::ConfigError;
use crate::settings::Settings;

/// libSQL connection settings.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub libsql_path: Option<PathBuf>,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let libsql_path = optional_env("LIBSQL_PATH")?
            .or_else(|| settings.database.libsql_path.clone())
            .map(PathBuf::from);
        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.libsql_url.clone());
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);

        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "LIBSQL_AUTH_TOKEN".to_string(),
                hint: "required when LIBSQL_URL is set".to_string(),
            });
        }

        Ok(Self {
            libsql_path,
            libsql_url,
            libsql_auth_token,
        })
    }
}

/// Default local database file.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".territory")
        .join("territory.db")
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub territory: TerritoryConfig,
}

impl Config {
    /// Load `.env`, the settings file and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let settings = Settings::load()?;
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            territory: TerritoryConfig::resolve(settings)?,
        })
    }
}
