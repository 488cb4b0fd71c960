//! libSQL/Turso backend for the `TabularStore` trait.
//!
//! Works against a local file or an embedded replica of a remote Turso
//! database. Each call opens a fresh connection from the shared
//! `libsql::Database` handle.

mod tabular;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::params;

use crate::db::libsql_migrations::{SCHEMA, SCHEMA_VERSION};
use crate::db::{Database, StoreLimits};
use crate::error::DatabaseError;

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<libsql::Database>,
    limits: StoreLimits,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open {}: {}", path.display(), e)))?;
        Ok(Self {
            db: Arc::new(db),
            limits: StoreLimits::default(),
        })
    }

    /// Open an embedded replica that syncs from a remote Turso database.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = libsql::Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open replica of {url}: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            limits: StoreLimits::default(),
        })
    }

    /// Override the request ceilings this backend enforces.
    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Open a connection to the database.
    pub async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        self.db
            .connect()
            .map_err(|e| DatabaseError::Pool(e.to_string()))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), DatabaseError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            DatabaseError::Pool(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, "territory_core"],
        )
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::debug!(version = SCHEMA_VERSION, "libSQL schema up to date");
        Ok(())
    }
}

/// Convert a JSON cell to a libSQL parameter.
pub(crate) fn json_to_value(value: &serde_json::Value) -> libsql::Value {
    match value {
        serde_json::Value::Null => libsql::Value::Null,
        serde_json::Value::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(int) => libsql::Value::Integer(int),
            None => libsql::Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => libsql::Value::Text(s.clone()),
        other => libsql::Value::Text(other.to_string()),
    }
}

/// Convert a libSQL cell to JSON.
pub(crate) fn value_to_json(
    value: libsql::Value,
    column: &str,
) -> Result<serde_json::Value, DatabaseError> {
    Ok(match value {
        libsql::Value::Null => serde_json::Value::Null,
        libsql::Value::Integer(int) => serde_json::Value::from(int),
        libsql::Value::Real(real) => serde_json::Number::from_f64(real)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        libsql::Value::Text(text) => serde_json::Value::String(text),
        libsql::Value::Blob(_) => {
            return Err(DatabaseError::Serialization(format!(
                "unexpected blob in column '{column}'"
            )));
        }
    })
}
