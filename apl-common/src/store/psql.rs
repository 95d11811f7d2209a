//! [`RelationalStore`] that runs `psql` on the database host over a command
//! channel and decodes `row_to_json` output.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{Filter, Query, RelationalStore, Row};
use crate::errors::StoreError;
use crate::remote::CommandChannel;
use crate::util::{shell_quote, sql_literal};

/// Plain SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`.
fn identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => sql_literal(s),
        other => sql_literal(&other.to_string()),
    }
}

/// Render a query as a single SQL statement returning one JSON object per row.
pub fn render_sql(query: &Query) -> Result<String, StoreError> {
    let table = identifier(&query.table)?;
    let mut sql = format!("SELECT row_to_json(t) FROM {table} t");

    let mut clauses = Vec::with_capacity(query.filters.len());
    for filter in &query.filters {
        let column = identifier(filter.column())?;
        clauses.push(match filter {
            Filter::Eq(_, Value::Null) => format!("t.{column} IS NULL"),
            Filter::Ne(_, Value::Null) => format!("t.{column} IS NOT NULL"),
            Filter::Eq(_, v) => format!("t.{column} = {}", literal(v)),
            Filter::Ne(_, v) => format!("t.{column} <> {}", literal(v)),
        });
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if let Some(column) = &query.order_by {
        sql.push_str(&format!(" ORDER BY t.{}", identifier(column)?));
    }
    if let Some(n) = query.limit {
        sql.push_str(&format!(" LIMIT {n}"));
    }
    Ok(sql)
}

/// Decode `psql -t -A` output: one JSON object per non-empty line.
pub fn parse_rows(table: &str, output: &str) -> Result<Vec<Row>, StoreError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Map<String, Value>>(line)
                .map(Row::from)
                .map_err(|e| StoreError::Decode {
                    table: table.to_string(),
                    message: format!("{e}: {line}"),
                })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PsqlStore {
    hostname: String,
    database: String,
    channel: Arc<dyn CommandChannel>,
}

impl PsqlStore {
    /// `channel` must be connected to `hostname`, the database host.
    pub fn new(hostname: impl Into<String>, database: impl Into<String>, channel: Arc<dyn CommandChannel>) -> Self {
        Self {
            hostname: hostname.into(),
            database: database.into(),
            channel,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    async fn psql(&self, table: &str, sql: &str) -> Result<String, StoreError> {
        let command = format!(
            "psql -U postgres -t -A -c {} {}",
            shell_quote(sql),
            shell_quote(&self.database)
        );
        trace!(host = %self.hostname, sql, "Running query");
        let result = self.channel.run(&command, None).await?;
        if result.failed() {
            return Err(StoreError::QueryFailed {
                table: table.to_string(),
                status: result.exit_status,
                output: result.output,
            });
        }
        Ok(result.output)
    }
}

#[async_trait]
impl RelationalStore for PsqlStore {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        let name = identifier(table)?;
        let sql = format!(
            "SELECT count(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = '{name}'"
        );
        let output = self.psql(table, &sql).await?;
        let count = output.trim().parse::<u64>().map_err(|e| StoreError::Decode {
            table: table.to_string(),
            message: format!("table count {:?}: {e}", output.trim()),
        })?;
        Ok(count > 0)
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let sql = render_sql(query)?;
        let output = self.psql(&query.table, &sql).await?;
        let rows = parse_rows(&query.table, &output)?;
        debug!(host = %self.hostname, table = %query.table, rows = rows.len(), "Fetched rows");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use crate::remote::CommandResult;

    #[test]
    fn test_render_sql_filters() {
        let q = Query::table("assigned_server_roles")
            .eq("miq_server_id", 1_000_000_000_001i64)
            .eq("active", true)
            .ne("name", "O'Brien")
            .eq("zone_id", Value::Null)
            .order_by("id")
            .limit(5);
        assert_eq!(
            render_sql(&q).unwrap(),
            "SELECT row_to_json(t) FROM assigned_server_roles t WHERE t.miq_server_id = 1000000000001 \
             AND t.active = TRUE AND t.name <> 'O''Brien' AND t.zone_id IS NULL ORDER BY t.id LIMIT 5"
        );
    }

    #[test]
    fn test_render_sql_rejects_injection() {
        let q = Query::table("miq_servers; DROP TABLE x");
        assert!(matches!(render_sql(&q), Err(StoreError::InvalidIdentifier(_))));
        let q = Query::table("miq_servers").eq("id = 1 OR 1", 1);
        assert!(matches!(render_sql(&q), Err(StoreError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_parse_rows() {
        let rows = parse_rows(
            "miq_servers",
            "{\"id\":1,\"name\":\"EVM\"}\n\n{\"id\":2,\"name\":\"EVM2\"}\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].str("name"), Some("EVM2"));

        let err = parse_rows("miq_servers", "not json").unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_fetch_runs_psql_on_channel() {
        let channel = Arc::new(MockChannel::new("db.example.com"));
        channel.respond(
            "row_to_json",
            CommandResult::new(0, "{\"id\":7,\"guid\":\"abc\"}\n"),
        );
        let store = PsqlStore::new("db.example.com", "vmdb_production", channel.clone());

        let rows = store.fetch(&Query::table("miq_servers").eq("guid", "abc")).await.unwrap();
        assert_eq!(rows[0].i64("id"), Some(7));

        let cmds = channel.commands();
        assert!(cmds[0].starts_with("psql -U postgres -t -A -c "));
        assert!(cmds[0].ends_with(" vmdb_production"));
    }

    #[tokio::test]
    async fn test_query_failure_carries_status() {
        let channel = Arc::new(MockChannel::new("db"));
        channel.respond("psql", CommandResult::new(2, "connection refused"));
        let store = PsqlStore::new("db", "vmdb_production", channel);
        let err = store.has_table("miq_servers").await.unwrap_err();
        assert!(matches!(err, StoreError::QueryFailed { status: 2, .. }));
    }

    #[tokio::test]
    async fn test_has_table_rejects_garbled_count() {
        let channel = Arc::new(MockChannel::new("db"));
        channel.respond("information_schema.tables", CommandResult::new(0, "could not translate host name\n"));
        let store = PsqlStore::new("db", "vmdb_production", channel.clone());
        let err = store.has_table("miq_servers").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { ref table, .. } if table == "miq_servers"));

        channel.respond("information_schema.tables", CommandResult::new(0, " 1\n"));
        assert!(store.has_table("miq_servers").await.unwrap());
    }
}
