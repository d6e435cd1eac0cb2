//! PostgreSQL [`BatchStore`] built on sqlx.
//!
//! Bound values are cast to the declared type of their column, looked up once
//! per table from `pg_attribute`. A JSON string can then land in a `uuid`,
//! `timestamptz` or `date` column.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{BatchError, BatchResult};
use crate::record::ColumnValue;
use crate::store::{BatchStore, BatchWriter, DeleteStatement, Predicate, UpsertStatement};

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_list(idents: &[String]) -> String {
    idents
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column name to SQL type as rendered by `format_type`.
pub type ColumnTypes = HashMap<String, String>;

const COLUMN_TYPES_SQL: &str = r#"
    SELECT a.attname::TEXT AS column_name,
           format_type(a.atttypid, a.atttypmod) AS data_type
    FROM pg_attribute a
    WHERE a.attrelid = $1::regclass
      AND a.attnum > 0
      AND NOT a.attisdropped
"#;

fn column_type<'t>(types: &'t ColumnTypes, column: &str) -> Option<&'t str> {
    types.get(column).map(String::as_str)
}

/// Bind `value`, cast to `sql_type` when the column type is known.
fn push_value(
    builder: &mut QueryBuilder<'_, Postgres>,
    value: &ColumnValue,
    sql_type: Option<&str>,
) {
    match sql_type {
        Some(sql_type) if !value.is_null() => {
            builder.push("CAST(");
            push_bind(builder, value);
            builder.push(format!(" AS {sql_type})"));
        }
        _ => push_bind(builder, value),
    }
}

fn push_bind(builder: &mut QueryBuilder<'_, Postgres>, value: &ColumnValue) {
    match value {
        ColumnValue::Null => {
            builder.push("NULL");
        }
        ColumnValue::Bool(v) => {
            builder.push_bind(*v);
        }
        ColumnValue::Int(v) => {
            builder.push_bind(*v);
        }
        ColumnValue::Float(v) => {
            builder.push_bind(*v);
        }
        ColumnValue::Text(v) => {
            builder.push_bind(v.clone());
        }
        ColumnValue::Bytes(v) => {
            builder.push_bind(v.clone());
        }
        ColumnValue::Uuid(v) => {
            builder.push_bind(*v);
        }
        ColumnValue::Timestamp(v) => {
            builder.push_bind(*v);
        }
        ColumnValue::Json(v) => {
            builder.push_bind(v.clone());
        }
    }
}

/// Render an upsert. Exposed for inspection in tests.
pub fn build_upsert(
    statement: &UpsertStatement,
    types: &ColumnTypes,
) -> QueryBuilder<'static, Postgres> {
    let column_types: Vec<Option<&str>> = statement
        .columns
        .iter()
        .map(|c| column_type(types, c))
        .collect();
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(&statement.table),
        quote_list(&statement.columns)
    ));

    for (i, row) in statement.rows.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push("(");
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                builder.push(", ");
            }
            match value {
                Some(value) => {
                    let sql_type = column_types.get(j).copied().flatten();
                    push_value(&mut builder, value, sql_type);
                }
                None => {
                    builder.push("DEFAULT");
                }
            }
        }
        builder.push(")");
    }

    if !statement.conflict_target.is_empty() {
        builder.push(format!(
            " ON CONFLICT ({}) ",
            quote_list(&statement.conflict_target)
        ));
        if statement.update_columns.is_empty() {
            builder.push("DO NOTHING");
        } else {
            let assignments = statement
                .update_columns
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            builder.push(format!("DO UPDATE SET {assignments}"));
        }
    }

    if let Some(column) = &statement.returning {
        builder.push(format!(" RETURNING {}", quote_ident(column)));
    }
    builder
}

fn push_predicate(
    builder: &mut QueryBuilder<'_, Postgres>,
    predicate: &Predicate,
    types: &ColumnTypes,
) {
    match predicate {
        Predicate::Eq(column, value) => {
            builder.push(format!("{} = ", quote_ident(column)));
            push_value(builder, value, column_type(types, column));
        }
        Predicate::DistinctFrom(column, value) => {
            builder.push(format!("{} IS DISTINCT FROM ", quote_ident(column)));
            push_value(builder, value, column_type(types, column));
        }
        Predicate::In(column, values) => {
            if values.is_empty() {
                builder.push("FALSE");
                return;
            }
            builder.push(format!("{} IN (", quote_ident(column)));
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(builder, value, column_type(types, column));
            }
            builder.push(")");
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            let (joiner, empty) = match predicate {
                Predicate::And(_) => (" AND ", "TRUE"),
                _ => (" OR ", "FALSE"),
            };
            if parts.is_empty() {
                builder.push(empty);
                return;
            }
            builder.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    builder.push(joiner);
                }
                push_predicate(builder, part, types);
            }
            builder.push(")");
        }
    }
}

/// Render a delete. Exposed for inspection in tests.
pub fn build_delete(
    statement: &DeleteStatement,
    types: &ColumnTypes,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "DELETE FROM {} WHERE ",
        quote_ident(&statement.table)
    ));
    push_predicate(&mut builder, &statement.predicate, types);
    builder
}

/// Read a returned key of unknown type.
fn returned_value(row: &PgRow, column: &str) -> BatchResult<ColumnValue> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
        return Ok(v.map(ColumnValue::Int).unwrap_or(ColumnValue::Null));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(column) {
        return Ok(v.map(|v| ColumnValue::Int(v.into())).unwrap_or(ColumnValue::Null));
    }
    if let Ok(v) = row.try_get::<Option<Uuid>, _>(column) {
        return Ok(v.map(ColumnValue::Uuid).unwrap_or(ColumnValue::Null));
    }
    row.try_get::<Option<String>, _>(column)
        .map(|v| v.map(ColumnValue::Text).unwrap_or(ColumnValue::Null))
        .map_err(|e| BatchError::Store(format!("unsupported type for returned column {column}: {e}")))
}

type ColumnTypeCache = Arc<DashMap<String, Arc<ColumnTypes>>>;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
    column_types: ColumnTypeCache,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            column_types: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Drop cached column types, e.g. after a migration altered a table.
    pub fn forget_column_types(&self) {
        self.column_types.clear();
    }
}

pub struct PgBatchTx {
    tx: Transaction<'static, Postgres>,
    column_types: ColumnTypeCache,
}

impl PgBatchTx {
    /// Declared column types of `table`, cached for the store's lifetime.
    async fn column_types(&mut self, table: &str) -> BatchResult<Arc<ColumnTypes>> {
        let cached = self.column_types.get(table).map(|t| Arc::clone(t.value()));
        if let Some(types) = cached {
            return Ok(types);
        }

        let rows = sqlx::query(COLUMN_TYPES_SQL)
            .bind(quote_ident(table))
            .fetch_all(&mut *self.tx)
            .await?;
        let mut types = ColumnTypes::with_capacity(rows.len());
        for row in &rows {
            types.insert(row.try_get("column_name")?, row.try_get("data_type")?);
        }
        debug!(table, columns = types.len(), "Loaded column types");

        let types = Arc::new(types);
        self.column_types
            .insert(table.to_string(), Arc::clone(&types));
        Ok(types)
    }
}

#[async_trait]
impl BatchWriter for PgBatchTx {
    async fn upsert(&mut self, statement: &UpsertStatement) -> BatchResult<Vec<ColumnValue>> {
        if statement.rows.is_empty() {
            return Ok(Vec::new());
        }
        let types = self.column_types(&statement.table).await?;
        let mut builder = build_upsert(statement, &types);
        debug!(table = %statement.table, rows = statement.rows.len(), "Executing bulk upsert");

        match &statement.returning {
            Some(column) => {
                let rows = builder.build().fetch_all(&mut *self.tx).await?;
                rows.iter().map(|row| returned_value(row, column)).collect()
            }
            None => {
                builder.build().execute(&mut *self.tx).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn delete(&mut self, statement: &DeleteStatement) -> BatchResult<u64> {
        let types = self.column_types(&statement.table).await?;
        let mut builder = build_delete(statement, &types);
        let result = builder.build().execute(&mut *self.tx).await?;
        debug!(table = %statement.table, rows = result.rows_affected(), "Executed bulk delete");
        Ok(result.rows_affected())
    }

    async fn savepoint(&mut self, name: &str) -> BatchResult<()> {
        sqlx::query(&format!("SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> BatchResult<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> BatchResult<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    type Tx = PgBatchTx;

    async fn begin(&self) -> BatchResult<PgBatchTx> {
        let tx = self.pool.begin().await?;
        Ok(PgBatchTx {
            tx,
            column_types: Arc::clone(&self.column_types),
        })
    }

    async fn commit(&self, tx: PgBatchTx) -> BatchResult<()> {
        tx.tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: PgBatchTx) -> BatchResult<()> {
        tx.tx.rollback().await?;
        Ok(())
    }
}
