//! In-process reference implementation of [`TabularStore`].
//!
//! Evaluates [`Filter`] trees directly over JSON rows, enforces the same
//! [`StoreLimits`] as the hosted store, and keeps per-operation call
//! counters plus scheduled failures so callers can observe exactly which
//! requests a component issued.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::query::{Filter, FilterValue, Row, Select, StoreLimits, Table, to_row};
use crate::db::{ClientId, Database, TabularStore, parse_timestamp};
use crate::error::DatabaseError;

/// Store operation, for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Select,
    Insert,
    Delete,
    Unassigned,
}

impl StoreOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Unassigned => "unassigned_client_ids",
        }
    }
}

#[derive(Debug, Default)]
struct CallLog {
    counts: HashMap<StoreOperation, usize>,
    /// Absolute call numbers (per operation) that must fail.
    failures: HashSet<(StoreOperation, usize)>,
}

/// In-memory tabular store.
pub struct InMemoryStore {
    limits: StoreLimits,
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    calls: Mutex<CallLog>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store enforcing the default hosted-store ceilings.
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            limits,
            tables: Mutex::new(HashMap::new()),
            calls: Mutex::new(CallLog::default()),
        }
    }

    /// Append rows without call accounting or constraint checks.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Row>) {
        let mut tables = lock(&self.tables);
        tables.entry(table).or_default().extend(rows);
    }

    /// Encode and append records without call accounting.
    pub fn seed_records<T: Serialize>(&self, table: Table, records: &[T]) -> Result<(), DatabaseError> {
        let rows = records.iter().map(to_row).collect::<Result<Vec<_>, _>>()?;
        self.seed(table, rows);
        Ok(())
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        lock(&self.tables).get(&table).cloned().unwrap_or_default()
    }

    /// Calls issued for `operation` since creation or the last reset.
    pub fn call_count(&self, operation: StoreOperation) -> usize {
        lock(&self.calls).counts.get(&operation).copied().unwrap_or(0)
    }

    /// Total calls across all operations.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).counts.values().sum()
    }

    /// Reset call counters. Scheduled failures are dropped as well.
    pub fn reset_calls(&self) {
        let mut calls = lock(&self.calls);
        calls.counts.clear();
        calls.failures.clear();
    }

    /// Make the `nth` upcoming call of `operation` fail (1-based).
    pub fn fail_nth(&self, operation: StoreOperation, nth: usize) {
        let mut calls = lock(&self.calls);
        let current = calls.counts.get(&operation).copied().unwrap_or(0);
        calls.failures.insert((operation, current + nth.max(1)));
    }

    fn record_call(&self, operation: StoreOperation) -> Result<(), DatabaseError> {
        let mut calls = lock(&self.calls);
        let count = calls.counts.entry(operation).or_insert(0);
        *count += 1;
        let call = *count;
        if calls.failures.remove(&(operation, call)) {
            return Err(DatabaseError::Injected {
                operation: operation.as_str(),
                call,
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn compare_value(value: Option<&serde_json::Value>, expected: &FilterValue) -> Option<Ordering> {
    let value = value?;
    match expected {
        FilterValue::Text(text) => value.as_str().map(|v| v.cmp(text.as_str())),
        FilterValue::Integer(int) => value.as_i64().map(|v| v.cmp(int)),
        FilterValue::Timestamp(ts) => value
            .as_str()
            .and_then(|raw| parse_timestamp(raw).ok())
            .map(|v| v.cmp(ts)),
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => compare_value(row.get(*column), value) == Some(Ordering::Equal),
        Filter::In(column, values) => values
            .iter()
            .any(|value| compare_value(row.get(*column), value) == Some(Ordering::Equal)),
        Filter::Gte(column, value) => matches!(
            compare_value(row.get(*column), value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Filter::Lt(column, value) => {
            compare_value(row.get(*column), value) == Some(Ordering::Less)
        }
        Filter::Search(columns, needle) => {
            let needle = needle.to_lowercase();
            columns.iter().any(|column| {
                row.get(*column)
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|v| v.to_lowercase().contains(&needle))
            })
        }
        Filter::And(parts) => parts.iter().all(|part| matches(row, part)),
        Filter::Or(parts) => parts.iter().any(|part| matches(row, part)),
    }
}

/// Total order over JSON cells: nulls first, then numbers, then text.
fn cmp_cells(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn key_of(table: Table, row: &Row) -> Vec<String> {
    table
        .key_columns()
        .iter()
        .map(|column| {
            row.get(*column)
                .map(|value| match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        })
        .collect()
}

#[async_trait]
impl TabularStore for InMemoryStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn select_range(
        &self,
        select: &Select,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>, DatabaseError> {
        self.record_call(StoreOperation::Select)?;
        select.validate(&self.limits)?;
        let limit = limit.min(self.limits.max_page_rows);

        let tables = lock(&self.tables);
        let mut rows: Vec<&Row> = tables
            .get(&select.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| select.filter.as_ref().is_none_or(|f| matches(row, f)))
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            select
                .order
                .iter()
                .map(|order| {
                    let ordering = cmp_cells(a.get(order.column), b.get(order.column));
                    if order.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                select
                    .table
                    .columns()
                    .iter()
                    .map(|column| {
                        (
                            (*column).to_string(),
                            row.get(*column).cloned().unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect()
            })
            .collect())
    }

    async fn insert_rows(&self, table: Table, rows: &[Row]) -> Result<u64, DatabaseError> {
        self.record_call(StoreOperation::Insert)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tables = lock(&self.tables);
        let existing = tables.entry(table).or_default();
        let mut keys: HashSet<Vec<String>> = existing.iter().map(|row| key_of(table, row)).collect();

        for row in rows {
            if let Some(column) = row.keys().find(|column| !table.has_column(column)) {
                return Err(DatabaseError::Query(format!(
                    "unknown column '{column}' on table {table}"
                )));
            }
            if !keys.insert(key_of(table, row)) {
                return Err(DatabaseError::Constraint(format!(
                    "UNIQUE constraint failed: {}({})",
                    table,
                    table.key_columns().join(", ")
                )));
            }
        }

        existing.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, DatabaseError> {
        self.record_call(StoreOperation::Delete)?;
        filter.validate(table, &self.limits)?;

        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !matches(row, filter));
        Ok((before - rows.len()) as u64)
    }

    async fn unassigned_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError> {
        self.record_call(StoreOperation::Unassigned)?;

        let tables = lock(&self.tables);
        let assigned: HashSet<&str> = tables
            .get(&Table::ClientAssignments)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("client_id").and_then(serde_json::Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let mut clients: Vec<&Row> = tables
            .get(&Table::Clients)
            .map(|rows| rows.iter().collect())
            .unwrap_or_default();
        clients.sort_by(|a, b| {
            cmp_cells(a.get("created_at"), b.get("created_at"))
                .then_with(|| cmp_cells(a.get("id"), b.get("id")))
        });

        clients
            .into_iter()
            .filter_map(|row| row.get("id").and_then(serde_json::Value::as_str))
            .filter(|id| !assigned.contains(id))
            .map(|id| {
                ClientId::parse_str(id)
                    .map_err(|e| DatabaseError::Serialization(format!("invalid clients.id: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl Database for InMemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
