//! Backend-neutral query descriptors for the tabular store.
//!
//! Components never write SQL. They describe reads as a [`Select`] over one
//! [`Table`] with an optional [`Filter`] tree, and each backend compiles or
//! evaluates that description. Both backends enforce the same
//! [`StoreLimits`], which model the ceilings of the hosted store the CRM was
//! built against.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::DatabaseError;

use super::fmt_ts;

/// One row as exchanged with a store: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Largest number of values a single membership predicate may carry.
pub const DEFAULT_MAX_MEMBERSHIP: usize = 500;

/// Largest number of rows a single fetch may return.
pub const DEFAULT_MAX_PAGE_ROWS: usize = 1000;

/// Hard request ceilings imposed by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_membership: usize,
    pub max_page_rows: usize,
}

impl StoreLimits {
    /// Limits that never reject a request. Used by reference stores.
    pub fn unbounded() -> Self {
        Self {
            max_membership: usize::MAX,
            max_page_rows: usize::MAX,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_membership: DEFAULT_MAX_MEMBERSHIP,
            max_page_rows: DEFAULT_MAX_PAGE_ROWS,
        }
    }
}

/// Tables of the CRM schema that this crate reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Clients,
    Projects,
    EmployeeProjects,
    ClientAssignments,
    ClientFollowups,
    Reservations,
    ReservationNotes,
    Sales,
    Visits,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Clients,
        Table::Projects,
        Table::EmployeeProjects,
        Table::ClientAssignments,
        Table::ClientFollowups,
        Table::Reservations,
        Table::ReservationNotes,
        Table::Sales,
        Table::Visits,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Projects => "projects",
            Self::EmployeeProjects => "employee_projects",
            Self::ClientAssignments => "client_assignments",
            Self::ClientFollowups => "client_followups",
            Self::Reservations => "reservations",
            Self::ReservationNotes => "reservation_notes",
            Self::Sales => "sales",
            Self::Visits => "visits",
        }
    }

    /// Columns in select order.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Clients => &[
                "id",
                "name",
                "mobile",
                "status",
                "interested_project_id",
                "created_at",
                "updated_at",
            ],
            Self::Projects => &["id", "name", "code", "created_at"],
            Self::EmployeeProjects => &["employee_id", "project_id", "created_at"],
            Self::ClientAssignments => &["client_id", "employee_id", "assigned_at", "assigned_by"],
            Self::ClientFollowups => &["id", "client_id", "employee_id", "created_at"],
            Self::Reservations => &["id", "client_id", "employee_id", "created_at", "status"],
            Self::ReservationNotes => &["id", "reservation_id", "created_by", "created_at"],
            Self::Sales => &["id", "client_id", "sales_employee_id", "created_at", "price"],
            Self::Visits => &["id", "client_id", "employee_id", "created_at"],
        }
    }

    /// Columns that identify a row uniquely.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::EmployeeProjects => &["employee_id", "project_id"],
            Self::ClientAssignments => &["client_id", "employee_id"],
            _ => &["id"],
        }
    }

    /// Timestamp column used as the primary sort key.
    pub fn timestamp_column(self) -> &'static str {
        match self {
            Self::ClientAssignments => "assigned_at",
            _ => "created_at",
        }
    }

    pub fn has_column(self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Stable ordering: timestamp first, then the key columns as tie-breakers.
    pub fn default_order(self) -> Vec<OrderBy> {
        let mut order = vec![OrderBy::asc(self.timestamp_column())];
        order.extend(self.key_columns().iter().copied().map(OrderBy::asc));
        order
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Literal compared against a column.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl FilterValue {
    /// Representation stored in rows and bound as SQL parameters.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(value) => serde_json::Value::String(value.clone()),
            Self::Integer(value) => serde_json::Value::from(*value),
            Self::Timestamp(value) => serde_json::Value::String(fmt_ts(value)),
        }
    }
}

impl From<Uuid> for FilterValue {
    fn from(value: Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&Uuid> for FilterValue {
    fn from(value: &Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Predicate tree over the columns of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(&'static str, FilterValue),
    /// Column value is one of the listed values. An empty list matches nothing.
    In(&'static str, Vec<FilterValue>),
    Gte(&'static str, FilterValue),
    Lt(&'static str, FilterValue),
    /// Case-insensitive substring match against any of the columns.
    Search(Vec<&'static str>, String),
    /// Conjunction. Empty matches everything.
    And(Vec<Filter>),
    /// Disjunction. Empty matches nothing.
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<FilterValue>) -> Self {
        Self::Eq(column, value.into())
    }

    pub fn is_in<I, V>(column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        Self::In(column, values.into_iter().map(Into::into).collect())
    }

    pub fn gte(column: &'static str, value: impl Into<FilterValue>) -> Self {
        Self::Gte(column, value.into())
    }

    pub fn lt(column: &'static str, value: impl Into<FilterValue>) -> Self {
        Self::Lt(column, value.into())
    }

    /// Conjoin two filters, flattening nested conjunctions.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = match self {
            Self::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Self::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Self::And(parts)
    }

    /// True when the filter can be decided as matching nothing without
    /// consulting a store.
    pub fn is_unsatisfiable(&self) -> bool {
        match self {
            Self::In(_, values) => values.is_empty(),
            Self::And(parts) => parts.iter().any(Filter::is_unsatisfiable),
            Self::Or(parts) => parts.iter().all(Filter::is_unsatisfiable),
            _ => false,
        }
    }

    /// Check column names and membership sizes against a table and limits.
    pub fn validate(&self, table: Table, limits: &StoreLimits) -> Result<(), DatabaseError> {
        match self {
            Self::Eq(column, _) | Self::Gte(column, _) | Self::Lt(column, _) => {
                check_column(table, column)
            }
            Self::In(column, values) => {
                check_column(table, column)?;
                if values.len() > limits.max_membership {
                    return Err(DatabaseError::PredicateTooLarge {
                        column: (*column).to_string(),
                        values: values.len(),
                        limit: limits.max_membership,
                    });
                }
                Ok(())
            }
            Self::Search(columns, _) => columns
                .iter()
                .try_for_each(|column| check_column(table, column)),
            Self::And(parts) | Self::Or(parts) => parts
                .iter()
                .try_for_each(|part| part.validate(table, limits)),
        }
    }
}

fn check_column(table: Table, column: &str) -> Result<(), DatabaseError> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(DatabaseError::Query(format!(
            "unknown column '{column}' on table {table}"
        )))
    }
}

/// Sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: &'static str) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    pub fn desc(column: &'static str) -> Self {
        Self {
            column,
            descending: true,
        }
    }
}

/// Ordered read over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Table,
    pub filter: Option<Filter>,
    pub order: Vec<OrderBy>,
}

impl Select {
    /// Read of the whole table in its default, deterministic order.
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filter: None,
            order: table.default_order(),
        }
    }

    /// Add a predicate, conjoined with any existing one.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Replace the ordering. The key columns are appended as tie-breakers so
    /// pages stay stable.
    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        let mut order = order;
        for key in self.table.key_columns().iter().copied() {
            if !order.iter().any(|o| o.column == key) {
                order.push(OrderBy::asc(key));
            }
        }
        self.order = order;
        self
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.filter.as_ref().is_some_and(Filter::is_unsatisfiable)
    }

    pub fn validate(&self, limits: &StoreLimits) -> Result<(), DatabaseError> {
        for order in &self.order {
            check_column(self.table, order.column)?;
        }
        match &self.filter {
            Some(filter) => filter.validate(self.table, limits),
            None => Ok(()),
        }
    }
}

/// Encode a record as a store row.
pub fn to_row<T: Serialize>(record: &T) -> Result<Row, DatabaseError> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(row) => Ok(row),
        other => Err(DatabaseError::Serialization(format!(
            "expected an object row, got {other}"
        ))),
    }
}

/// Decode a store row into a record.
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, DatabaseError> {
    Ok(serde_json::from_value(serde_json::Value::Object(row))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_uses_timestamp_then_keys() {
        let order = Table::ClientAssignments.default_order();
        let columns: Vec<&str> = order.iter().map(|o| o.column).collect();
        assert_eq!(columns, vec!["assigned_at", "client_id", "employee_id"]);
    }

    #[test]
    fn every_default_order_references_known_columns() {
        for table in Table::ALL {
            Select::new(table)
                .validate(&StoreLimits::default())
                .unwrap_or_else(|e| panic!("{table}: {e}"));
        }
    }

    #[test]
    fn oversized_membership_is_rejected() {
        let ids: Vec<Uuid> = (0..501).map(|_| Uuid::new_v4()).collect();
        let select = Select::new(Table::Clients).filter(Filter::is_in("id", ids));
        let err = select
            .validate(&StoreLimits::default())
            .expect_err("501 values must exceed the ceiling");
        let DatabaseError::PredicateTooLarge {
            column,
            values,
            limit,
        } = err
        else {
            panic!("expected PredicateTooLarge");
        };
        assert_eq!(column, "id");
        assert_eq!(values, 501);
        assert_eq!(limit, 500);
    }

    #[test]
    fn membership_at_the_ceiling_is_accepted() {
        let ids: Vec<Uuid> = (0..500).map(|_| Uuid::new_v4()).collect();
        let filter = Filter::Or(vec![
            Filter::is_in("id", ids.clone()),
            Filter::is_in("id", ids),
        ]);
        assert!(filter.validate(Table::Clients, &StoreLimits::default()).is_ok());
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let err = Filter::eq("client_id", "x")
            .validate(Table::Projects, &StoreLimits::default())
            .expect_err("projects has no client_id");
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn unsatisfiable_detection() {
        assert!(Filter::In("id", Vec::new()).is_unsatisfiable());
        assert!(Filter::Or(Vec::new()).is_unsatisfiable());
        assert!(
            Filter::eq("status", "lead")
                .and(Filter::In("id", Vec::new()))
                .is_unsatisfiable()
        );
        assert!(!Filter::And(Vec::new()).is_unsatisfiable());
        assert!(
            !Filter::Or(vec![Filter::In("id", Vec::new()), Filter::eq("status", "lead")])
                .is_unsatisfiable()
        );
    }

    #[test]
    fn select_filter_flattens_conjunctions() {
        let select = Select::new(Table::Visits)
            .filter(Filter::eq("employee_id", "e"))
            .filter(Filter::eq("client_id", "c"));
        match select.filter {
            Some(Filter::And(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn order_by_appends_key_tie_breakers() {
        let select = Select::new(Table::Clients).order_by(vec![OrderBy::desc("name")]);
        let columns: Vec<&str> = select.order.iter().map(|o| o.column).collect();
        assert_eq!(columns, vec!["name", "id"]);
    }
}
