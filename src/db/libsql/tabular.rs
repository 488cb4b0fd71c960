use async_trait::async_trait;
use libsql::params::Params;

use crate::db::query::{Filter, FilterValue, Row, Select, StoreLimits, Table};
use crate::db::{ClientId, TabularStore, fmt_ts};
use crate::error::DatabaseError;

use super::{LibSqlBackend, json_to_value, value_to_json};

/// Parameterized SQL fragment under construction.
#[derive(Debug, Default)]
struct SqlBuilder {
    sql: String,
    params: Vec<libsql::Value>,
}

impl SqlBuilder {
    fn bind(&mut self, value: &FilterValue) {
        self.sql.push('?');
        self.params.push(match value {
            FilterValue::Text(text) => libsql::Value::Text(text.clone()),
            FilterValue::Integer(int) => libsql::Value::Integer(*int),
            FilterValue::Timestamp(ts) => libsql::Value::Text(fmt_ts(ts)),
        });
    }

    /// Bind a whole membership list as one JSON array parameter, so the
    /// statement's parameter count does not grow with the id count.
    fn bind_membership<'a>(
        &mut self,
        column: &str,
        values: impl Iterator<Item = &'a FilterValue>,
    ) {
        let array = serde_json::Value::Array(values.map(FilterValue::to_json).collect());
        self.sql.push_str(&format!("{column} IN (SELECT value FROM json_each(?))"));
        self.params.push(libsql::Value::Text(array.to_string()));
    }

    /// Column names come from `Table::columns` and are validated before
    /// compilation, so they are spliced verbatim.
    fn push_filter(&mut self, filter: &Filter) {
        match filter {
            Filter::Eq(column, value) => {
                self.sql.push_str(&format!("{column} = "));
                self.bind(value);
            }
            Filter::In(column, values) => {
                if values.is_empty() {
                    self.sql.push('0');
                    return;
                }
                self.bind_membership(column, values.iter());
            }
            Filter::Gte(column, value) => {
                self.sql.push_str(&format!("{column} >= "));
                self.bind(value);
            }
            Filter::Lt(column, value) => {
                self.sql.push_str(&format!("{column} < "));
                self.bind(value);
            }
            Filter::Search(columns, needle) => {
                if columns.is_empty() {
                    self.sql.push('0');
                    return;
                }
                let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
                self.sql.push('(');
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(" OR ");
                    }
                    self.sql
                        .push_str(&format!("LOWER(COALESCE({column}, '')) LIKE ? ESCAPE '\\'"));
                    self.params.push(libsql::Value::Text(pattern.clone()));
                }
                self.sql.push(')');
            }
            Filter::And(parts) => self.push_group(parts, " AND ", '1'),
            Filter::Or(parts) => match single_column_membership(parts) {
                // Chunked membership lists compile to one subquery; SQLite
                // caps expression depth.
                Some((column, values)) if !values.is_empty() => {
                    self.bind_membership(column, values.into_iter());
                }
                _ => self.push_group(parts, " OR ", '0'),
            },
        }
    }

    fn push_group(&mut self, parts: &[Filter], joiner: &str, empty: char) {
        if parts.is_empty() {
            self.sql.push(empty);
            return;
        }
        self.sql.push('(');
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(joiner);
            }
            self.push_filter(part);
        }
        self.sql.push(')');
    }
}

/// Values of a disjunction made only of `In` predicates on one column.
fn single_column_membership(parts: &[Filter]) -> Option<(&'static str, Vec<&FilterValue>)> {
    let Some(Filter::In(column, _)) = parts.first() else {
        return None;
    };
    let mut values = Vec::new();
    for part in parts {
        match part {
            Filter::In(other, chunk) if other == column => values.extend(chunk),
            _ => return None,
        }
    }
    Some((*column, values))
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn compile_select(select: &Select, offset: usize, limit: usize) -> SqlBuilder {
    let mut builder = SqlBuilder::default();
    builder.sql = format!(
        "SELECT {} FROM {}",
        select.table.columns().join(", "),
        select.table
    );
    if let Some(filter) = &select.filter {
        builder.sql.push_str(" WHERE ");
        builder.push_filter(filter);
    }
    if !select.order.is_empty() {
        let order = select
            .order
            .iter()
            .map(|o| {
                if o.descending {
                    format!("{} DESC", o.column)
                } else {
                    format!("{} ASC", o.column)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        builder.sql.push_str(&format!(" ORDER BY {order}"));
    }
    builder.sql.push_str(" LIMIT ? OFFSET ?");
    builder
        .params
        .push(libsql::Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    builder
        .params
        .push(libsql::Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
    builder
}

fn compile_insert(table: Table, rows: &[Row]) -> Result<SqlBuilder, DatabaseError> {
    let columns = table.columns();
    let mut builder = SqlBuilder::default();
    builder.sql = format!("INSERT INTO {} ({}) VALUES ", table, columns.join(", "));
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

    for (i, row) in rows.iter().enumerate() {
        if let Some(column) = row.keys().find(|column| !table.has_column(column)) {
            return Err(DatabaseError::Query(format!(
                "unknown column '{column}' on table {table}"
            )));
        }
        if i > 0 {
            builder.sql.push_str(", ");
        }
        builder.sql.push_str(&placeholders);
        for column in columns {
            builder.params.push(
                row.get(*column)
                    .map(json_to_value)
                    .unwrap_or(libsql::Value::Null),
            );
        }
    }
    Ok(builder)
}

#[async_trait]
impl TabularStore for LibSqlBackend {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn select_range(
        &self,
        select: &Select,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>, DatabaseError> {
        select.validate(&self.limits)?;
        let limit = limit.min(self.limits.max_page_rows);
        let compiled = compile_select(select, offset, limit);

        let conn = self.connect().await?;
        let mut rows = conn
            .query(&compiled.sql, Params::Positional(compiled.params))
            .await?;

        let columns = select.table.columns();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut record = Row::new();
            for (idx, column) in columns.iter().enumerate() {
                let idx = i32::try_from(idx)
                    .map_err(|_| DatabaseError::Query("column index overflow".to_string()))?;
                let value = row.get_value(idx)?;
                record.insert((*column).to_string(), value_to_json(value, column)?);
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn insert_rows(&self, table: Table, rows: &[Row]) -> Result<u64, DatabaseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let compiled = compile_insert(table, rows)?;
        let conn = self.connect().await?;
        let inserted = conn
            .execute(&compiled.sql, Params::Positional(compiled.params))
            .await?;
        Ok(inserted)
    }

    async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, DatabaseError> {
        filter.validate(table, &self.limits)?;
        let mut compiled = SqlBuilder::default();
        compiled.push_filter(filter);
        let sql = format!("DELETE FROM {} WHERE {}", table, compiled.sql);

        let conn = self.connect().await?;
        let deleted = conn
            .execute(&sql, Params::Positional(compiled.params))
            .await?;
        Ok(deleted)
    }

    async fn unassigned_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT c.id FROM clients c \
                 WHERE NOT EXISTS (SELECT 1 FROM client_assignments a WHERE a.client_id = c.id) \
                 ORDER BY c.created_at ASC, c.id ASC",
                (),
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            ids.push(ClientId::parse_str(&raw).map_err(|e| {
                DatabaseError::Serialization(format!("invalid clients.id uuid: {e}"))
            })?);
        }
        Ok(ids)
    }
}
