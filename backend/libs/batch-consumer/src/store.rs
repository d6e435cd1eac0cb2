//! Relational store interface used by the persistence engine.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::BatchResult;
use crate::record::ColumnValue;

/// Bulk `INSERT … ON CONFLICT (conflict_target) DO UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    /// One entry per column; `None` renders as `DEFAULT`
    pub rows: Vec<Vec<Option<ColumnValue>>>,
    pub conflict_target: Vec<String>,
    /// Columns overwritten from the incoming row on conflict
    pub update_columns: Vec<String>,
    /// Column returned for every row, in `rows` order
    pub returning: Option<String>,
}

/// Row filter for bulk deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, ColumnValue),
    /// `IS DISTINCT FROM`: null-safe inequality
    DistinctFrom(String, ColumnValue),
    In(String, Vec<ColumnValue>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate against a row using SQL semantics (`NULL = x` is never true).
    pub fn matches(&self, row: &BTreeMap<String, ColumnValue>) -> bool {
        let get = |column: &str| row.get(column).unwrap_or(&ColumnValue::Null);
        match self {
            Predicate::Eq(column, value) => {
                let current = get(column);
                !current.is_null() && !value.is_null() && current == value
            }
            Predicate::DistinctFrom(column, value) => get(column) != value,
            Predicate::In(column, values) => {
                let current = get(column);
                !current.is_null() && values.iter().any(|v| v == current)
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }

    /// Exact match on every column of `key`.
    pub fn key_match(key: &BTreeMap<String, ColumnValue>) -> Self {
        let mut clauses: Vec<Predicate> = key
            .iter()
            .map(|(column, value)| Predicate::Eq(column.clone(), value.clone()))
            .collect();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Predicate::And(clauses)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub predicate: Predicate,
}

/// Statements executed inside an open transaction.
#[async_trait]
pub trait BatchWriter: Send {
    /// Execute a bulk upsert and return the `returning` column per row.
    async fn upsert(&mut self, statement: &UpsertStatement) -> BatchResult<Vec<ColumnValue>>;

    /// Execute a bulk delete and return the number of rows removed.
    async fn delete(&mut self, statement: &DeleteStatement) -> BatchResult<u64>;

    async fn savepoint(&mut self, name: &str) -> BatchResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> BatchResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> BatchResult<()>;
}

/// Transactional relational store.
#[async_trait]
pub trait BatchStore: Send + Sync {
    type Tx: BatchWriter + 'static;

    async fn begin(&self) -> BatchResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> BatchResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> BatchResult<()>;
}
