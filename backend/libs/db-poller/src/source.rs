//! Where polled rows come from.
//!
//! Sources return rows ordered by `(timestamp, id)` as JSON objects; the
//! PostgreSQL implementations render each row with `to_jsonb`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::config::StateBasedConfig;
use crate::error::PollerResult;

/// A changed row read from the source table.
#[derive(Debug, Clone, PartialEq)]
pub struct PolledRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// The whole row as a JSON object
    pub data: serde_json::Value,
}

/// Rows strictly after the `(from, last_id)` cursor and no later than `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub last_id: i64,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, timestamp: DateTime<Utc>, id: i64) -> bool {
        (timestamp > self.from || (timestamp == self.from && id > self.last_id))
            && timestamp <= self.to
    }
}

#[async_trait]
pub trait TimeBasedSource: Send + Sync {
    /// Up to `limit` rows inside `window`, ordered by `(timestamp, id)`.
    async fn fetch_page(&self, window: &TimeWindow, limit: usize) -> PollerResult<Vec<PolledRow>>;
}

#[async_trait]
pub trait StateBasedSource: Send + Sync {
    /// Up to `limit` pending rows, ordered by `(timestamp, id)`.
    async fn fetch_pending(&self, limit: usize) -> PollerResult<Vec<PolledRow>>;

    /// Stamp the rows with `ids`: timestamp (and publish timestamp) set to
    /// `now`, state set to `state` when given.
    async fn finalize(
        &self,
        ids: &[i64],
        state: Option<&str>,
        now: DateTime<Utc>,
    ) -> PollerResult<u64>;
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn push_select(builder: &mut QueryBuilder<'_, Postgres>, table: &str, id: &str, timestamp: &str) {
    builder.push(format!(
        "SELECT t.{id}::BIGINT AS poll_id, t.{ts}::TIMESTAMPTZ AS poll_ts, to_jsonb(t) AS poll_data FROM {table} t WHERE ",
        id = quote_ident(id),
        ts = quote_ident(timestamp),
        table = quote_ident(table),
    ));
}

fn push_order(builder: &mut QueryBuilder<'_, Postgres>, id: &str, timestamp: &str, limit: usize) {
    builder.push(format!(
        " ORDER BY t.{}, t.{} LIMIT ",
        quote_ident(timestamp),
        quote_ident(id)
    ));
    builder.push_bind(limit as i64);
}

fn to_polled_row(row: PgRow) -> Result<PolledRow, sqlx::Error> {
    Ok(PolledRow {
        id: row.try_get("poll_id")?,
        timestamp: row.try_get("poll_ts")?,
        data: row.try_get("poll_data")?,
    })
}

/// Cursor-based reads of a PostgreSQL table.
pub struct PgTimeBasedSource {
    pool: PgPool,
    table: String,
    id_column: String,
    timestamp_column: String,
}

impl PgTimeBasedSource {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        id_column: impl Into<String>,
        timestamp_column: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            id_column: id_column.into(),
            timestamp_column: timestamp_column.into(),
        }
    }

    pub fn build_query(&self, window: &TimeWindow, limit: usize) -> QueryBuilder<'static, Postgres> {
        let ts = quote_ident(&self.timestamp_column);
        let id = quote_ident(&self.id_column);

        let mut builder = QueryBuilder::new("");
        push_select(&mut builder, &self.table, &self.id_column, &self.timestamp_column);
        builder.push(format!("((t.{ts} > "));
        builder.push_bind(window.from);
        builder.push(format!(") OR (t.{ts} = "));
        builder.push_bind(window.from);
        builder.push(format!(" AND t.{id} > "));
        builder.push_bind(window.last_id);
        builder.push(format!(")) AND t.{ts} <= "));
        builder.push_bind(window.to);
        push_order(&mut builder, &self.id_column, &self.timestamp_column, limit);
        builder
    }
}

#[async_trait]
impl TimeBasedSource for PgTimeBasedSource {
    async fn fetch_page(&self, window: &TimeWindow, limit: usize) -> PollerResult<Vec<PolledRow>> {
        let rows = self
            .build_query(window, limit)
            .build()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(to_polled_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

/// State-column reads and updates of a PostgreSQL table.
pub struct PgStateBasedSource {
    pool: PgPool,
    table: String,
    id_column: String,
    timestamp_column: String,
    state: StateBasedConfig,
}

impl PgStateBasedSource {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        id_column: impl Into<String>,
        timestamp_column: impl Into<String>,
        state: StateBasedConfig,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            id_column: id_column.into(),
            timestamp_column: timestamp_column.into(),
            state,
        }
    }

    pub fn build_pending_query(&self, limit: usize) -> QueryBuilder<'static, Postgres> {
        let state = quote_ident(&self.state.state_column);

        let mut builder = QueryBuilder::new("");
        push_select(&mut builder, &self.table, &self.id_column, &self.timestamp_column);
        match &self.state.pending_state {
            Some(pending) => {
                builder.push(format!("t.{state} = "));
                builder.push_bind(pending.clone());
            }
            None => {
                builder.push(format!("t.{state} IS NULL"));
            }
        }
        push_order(&mut builder, &self.id_column, &self.timestamp_column, limit);
        builder
    }

    pub fn build_finalize(
        &self,
        ids: &[i64],
        state: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(format!(
            "UPDATE {} SET {} = ",
            quote_ident(&self.table),
            quote_ident(&self.timestamp_column)
        ));
        builder.push_bind(now);
        if let Some(column) = &self.state.publish_timestamp_column {
            builder.push(format!(", {} = ", quote_ident(column)));
            builder.push_bind(now);
        }
        if let Some(state) = state {
            builder.push(format!(", {} = ", quote_ident(&self.state.state_column)));
            builder.push_bind(state.to_string());
        }
        builder.push(format!(" WHERE {} = ANY(", quote_ident(&self.id_column)));
        builder.push_bind(ids.to_vec());
        builder.push(")");
        builder
    }
}

#[async_trait]
impl StateBasedSource for PgStateBasedSource {
    async fn fetch_pending(&self, limit: usize) -> PollerResult<Vec<PolledRow>> {
        let rows = self
            .build_pending_query(limit)
            .build()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(to_polled_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn finalize(
        &self,
        ids: &[i64],
        state: Option<&str>,
        now: DateTime<Utc>,
    ) -> PollerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .build_finalize(ids, state, now)
            .build()
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
