//! Read access to the appliance's relational database.
//!
//! Only what lifecycle code needs: does a table exist, and fetch rows
//! filtered by column equality. Rows come back as loose JSON maps so the
//! schema does not have to be mirrored here.

pub mod psql;

pub use psql::PsqlStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::errors::StoreError;
use crate::remote::CommandChannel;

/// One column constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::Ne(c, _) => c,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, value) => row.get(column).is_some_and(|v| values_equal(v, value)),
            Self::Ne(column, value) => row.get(column).is_some_and(|v| !v.is_null() && !values_equal(v, value)),
        }
    }
}

// Numbers compare by value so that `1` matches `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// A single-table select.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn ne(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Ne(column.into(), value.into()));
        self
    }

    /// Ascending order on one column.
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Evaluate the filters against an in-memory row.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Apply the query to an in-memory table.
    pub fn apply(&self, rows: &[Row]) -> Vec<Row> {
        let mut selected: Vec<Row> = rows.iter().filter(|r| self.matches(r)).cloned().collect();
        if let Some(column) = &self.order_by {
            selected.sort_by(|a, b| compare_values(a.get(column), b.get(column)));
        }
        if let Some(n) = self.limit {
            selected.truncate(n);
        }
        selected
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// A database row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Booleans, tolerating Postgres' `t`/`f` text form.
    pub fn bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "t" | "true" => Some(true),
                "f" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A handle on one appliance database.
#[async_trait]
pub trait RelationalStore: Send + Sync + fmt::Debug {
    /// Host the database lives on.
    fn hostname(&self) -> &str;

    async fn has_table(&self, table: &str) -> Result<bool, StoreError>;

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Fetch, failing with [`StoreError::MissingTable`] if the table is absent.
    async fn fetch_existing(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        if !self.has_table(&query.table).await? {
            return Err(StoreError::MissingTable(query.table.clone()));
        }
        self.fetch(query).await
    }

    async fn first(&self, query: &Query) -> Result<Option<Row>, StoreError> {
        let rows = self.fetch(&query.clone().limit(1)).await?;
        Ok(rows.into_iter().next())
    }
}

/// Opens a store handle for a database host.
#[async_trait]
pub trait StoreOpener: Send + Sync + fmt::Debug {
    /// `channel` is connected to `db_address`.
    async fn open(
        &self,
        db_address: &str,
        database: &str,
        channel: Arc<dyn CommandChannel>,
    ) -> Result<Arc<dyn RelationalStore>, StoreError>;
}

/// Opens [`PsqlStore`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsqlOpener;

#[async_trait]
impl StoreOpener for PsqlOpener {
    async fn open(
        &self,
        db_address: &str,
        database: &str,
        channel: Arc<dyn CommandChannel>,
    ) -> Result<Arc<dyn RelationalStore>, StoreError> {
        Ok(Arc::new(PsqlStore::new(db_address, database, channel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn servers() -> Vec<Row> {
        vec![
            Row::new().with("id", 2).with("name", "b").with("is_master", false),
            Row::new().with("id", 1).with("name", "a").with("is_master", true),
            Row::new().with("id", 3).with("name", "c").with("is_master", Value::Null),
        ]
    }

    #[test]
    fn test_eq_and_order() {
        let q = Query::table("miq_servers").ne("name", "c").order_by("id");
        let rows = q.apply(&servers());
        let names: Vec<_> = rows.iter().filter_map(|r| r.str("name")).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_ne_skips_nulls() {
        let rows = Query::table("t").ne("is_master", true).apply(&servers());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].i64("id"), Some(2));
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        let row = Row::new().with("id", json!(1.0));
        assert!(Query::table("t").eq("id", 1).matches(&row));
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::from(
            json!({"id": "42", "active": "t", "name": "EVM"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(row.i64("id"), Some(42));
        assert_eq!(row.bool("active"), Some(true));
        assert_eq!(row.str("name"), Some("EVM"));
        assert_eq!(row.str("missing"), None);
    }

    #[test]
    fn test_limit() {
        let rows = Query::table("t").order_by("id").limit(1).apply(&servers());
        assert_eq!(rows[0].i64("id"), Some(1));
        assert_eq!(rows.len(), 1);
    }
}
