use std::path::{Component, PathBuf};
use std::time::Duration;

use crate::config::helpers::{parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;
use crate::territory::pager::PageOptions;

/// Assignment audit controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

/// Batching and pacing for the territory core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerritoryConfig {
    /// Rows requested per page by the bulk reader.
    pub page_size: usize,
    /// Values per membership predicate and rows per write batch.
    pub chunk_size: usize,
    /// Pause between consecutive page fetches.
    pub page_delay: Duration,
    pub audit: AuditConfig,
}

impl Default for TerritoryConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            chunk_size: 500,
            page_delay: Duration::from_millis(50),
            audit: AuditConfig {
                enabled: false,
                path: PathBuf::from("logs/assignment_audit.jsonl"),
                hash_chain: true,
            },
        }
    }
}

impl TerritoryConfig {
    pub fn page_options(&self) -> PageOptions {
        PageOptions {
            page_size: self.page_size,
            delay: self.page_delay,
        }
    }

    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let page_size = parse_env("TERRITORY_PAGE_SIZE", settings.territory.page_size)?;
        let chunk_size = parse_env("TERRITORY_CHUNK_SIZE", settings.territory.chunk_size)?;
        let page_delay_ms = parse_env("TERRITORY_PAGE_DELAY_MS", settings.territory.page_delay_ms)?;

        Ok(Self {
            page_size: validate_positive("TERRITORY_PAGE_SIZE", page_size)?,
            chunk_size: validate_positive("TERRITORY_CHUNK_SIZE", chunk_size)?,
            page_delay: Duration::from_millis(page_delay_ms),
            audit: AuditConfig {
                enabled: parse_bool_env(
                    "TERRITORY_AUDIT_ENABLED",
                    settings.territory.audit.enabled,
                )?,
                path: {
                    let raw = parse_string_env(
                        "TERRITORY_AUDIT_PATH",
                        settings.territory.audit.path.clone(),
                    )?;
                    validate_audit_path(&raw)?
                },
                hash_chain: parse_bool_env(
                    "TERRITORY_AUDIT_HASH_CHAIN",
                    settings.territory.audit.hash_chain,
                )?,
            },
        })
    }
}

fn validate_positive(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "TERRITORY_AUDIT_PATH".to_string(),
        message: message.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("audit log path must not be empty"));
    }

    let mut normalized = PathBuf::new();
    for component in PathBuf::from(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid("audit log path must not contain '..' components"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("audit log path must be relative to the working directory"));
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(invalid(
            "audit log path must be under 'logs/' and include a filename",
        ));
    }
    Ok(normalized)
}
