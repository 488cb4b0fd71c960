//! Database abstraction layer.
//!
//! Provides a backend-agnostic `TabularStore` trait describing the remote
//! tabular store the CRM runs against: ordered range reads, composable
//! filters, batched insert/delete and one server-side anti-join. Two
//! implementations exist:
//!
//! - `memory`: in-process reference store, used to verify chunking and
//!   pagination and as the test double for every component.
//! - `libsql` (default feature): libSQL (Turso's SQLite fork) for local or
//!   remote-replica deployment.

pub mod memory;
pub mod query;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

pub use query::{Filter, FilterValue, OrderBy, Row, Select, StoreLimits, Table, from_row, to_row};

pub type ClientId = Uuid;
pub type EmployeeId = Uuid;
pub type ProjectId = Uuid;
pub type ReservationId = Uuid;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    #[cfg(feature = "libsql")]
    {
        use secrecy::ExposeSecret as _;

        let default_path = crate::config::default_libsql_path();
        let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);

        let backend = if let Some(ref url) = config.libsql_url {
            let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                DatabaseError::Pool("LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string())
            })?;
            libsql::LibSqlBackend::new_remote_replica(db_path, url, token.expose_secret()).await?
        } else {
            libsql::LibSqlBackend::new_local(db_path).await?
        };
        backend.run_migrations().await?;
        Ok(Arc::new(backend))
    }
    #[cfg(not(feature = "libsql"))]
    {
        let _ = config;
        Err(DatabaseError::Pool(
            "No database backend available. Enable the 'libsql' feature.".to_string(),
        ))
    }
}

/// Canonical timestamp text: RFC 3339, UTC, fixed microsecond width.
///
/// Every timestamp written by this crate uses this form so that text
/// comparison in SQL agrees with chronological order.
pub fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's `datetime()` form.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| rfc_err),
    }
}

/// Serde codec pinning row timestamps to [`fmt_ts`].
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::fmt_ts(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => serializer.serialize_str(&crate::db::fmt_ts(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => crate::db::parse_timestamp(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Client lifecycle label. Read and filtered on, never changed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Lead,
    Reserved,
    Visited,
    Converted,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Reserved => "reserved",
            Self::Visited => "visited",
            Self::Converted => "converted",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "lead" => Some(Self::Lead),
            "reserved" => Some(Self::Reserved),
            "visited" => Some(Self::Visited),
            "converted" => Some(Self::Converted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    #[serde(default)]
    pub mobile: Option<String>,
    pub status: ClientStatus,
    #[serde(default)]
    pub interested_project_id: Option<ProjectId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Grants a non-admin employee access to one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectGrantRecord {
    pub employee_id: EmployeeId,
    pub project_id: ProjectId,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Territory ownership of one client by one employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub client_id: ClientId,
    pub employee_id: EmployeeId,
    #[serde(with = "timestamp")]
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_by: Option<EmployeeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRecord {
    pub id: Uuid,
    pub client_id: ClientId,
    #[serde(default)]
    pub employee_id: Option<EmployeeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: ReservationId,
    pub client_id: ClientId,
    #[serde(default)]
    pub employee_id: Option<EmployeeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub status: String,
}

/// Note on a reservation. Reaches its client only through the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationNoteRecord {
    pub id: Uuid,
    pub reservation_id: ReservationId,
    #[serde(default)]
    pub created_by: Option<EmployeeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: Uuid,
    pub client_id: ClientId,
    #[serde(default)]
    pub sales_employee_id: Option<EmployeeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub id: Uuid,
    pub client_id: ClientId,
    #[serde(default)]
    pub employee_id: Option<EmployeeId>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Remote tabular store consumed by the territory core.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Request ceilings this store enforces.
    fn limits(&self) -> StoreLimits;

    /// Rows `[offset, offset + limit)` of `select` in its declared order.
    /// `limit` is clamped to `limits().max_page_rows`.
    async fn select_range(
        &self,
        select: &Select,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>, DatabaseError>;

    /// Insert all rows or none. Duplicate keys are a `Constraint` error.
    async fn insert_rows(&self, table: Table, rows: &[Row]) -> Result<u64, DatabaseError>;

    /// Delete every row matching `filter`; returns the number removed.
    async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, DatabaseError>;

    /// Ids of clients with zero assignment rows, computed by the store.
    async fn unassigned_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: TabularStore {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
