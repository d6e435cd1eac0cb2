//! In-memory [`BatchStore`] with transaction and savepoint snapshots.
//!
//! Each transaction works on a private copy of the tables and publishes it on
//! commit, so a rolled-back attempt leaves nothing behind. Intended for tests
//! and single-writer tooling; concurrent transactions are last-commit-wins.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{BatchError, BatchResult};
use crate::record::ColumnValue;
use crate::store::{BatchStore, BatchWriter, DeleteStatement, UpsertStatement};

pub type Row = BTreeMap<String, ColumnValue>;
type Tables = BTreeMap<String, Vec<Row>>;

/// Failure injected into the next statement or commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reported as a persistence conflict (deadlock)
    Conflict,
    /// Reported as a serialization failure
    SerializationFailure,
    /// Reported as a plain store error
    Error(String),
}

impl Fault {
    fn into_error(self, during: &str) -> BatchError {
        match self {
            Fault::Conflict => {
                BatchError::PersistenceConflict(format!("deadlock detected during {during}"))
            }
            Fault::SerializationFailure => BatchError::SerializationFailure(format!(
                "could not serialize access during {during}"
            )),
            Fault::Error(message) => BatchError::Store(message),
        }
    }
}

/// Call counters, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub upserts: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    next_id: i64,
    statement_faults: VecDeque<Fault>,
    /// Faults keyed by 1-based statement number (upserts and deletes)
    scheduled_faults: BTreeMap<usize, Fault>,
    commit_faults: VecDeque<Fault>,
    stats: MemoryStats,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBatchStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` statements (upserts or deletes) with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        let mut state = lock(&self.state);
        state
            .statement_faults
            .extend(std::iter::repeat(Fault::Conflict).take(count));
    }

    pub fn inject_statement_fault(&self, fault: Fault) {
        lock(&self.state).statement_faults.push_back(fault);
    }

    /// Fail the `statement`-th statement executed from now on (1-based).
    pub fn inject_fault_at(&self, statement: usize, fault: Fault) {
        let mut state = lock(&self.state);
        let executed = state.stats.upserts + state.stats.deletes;
        state.scheduled_faults.insert(executed + statement, fault);
    }

    pub fn inject_commit_fault(&self, fault: Fault) {
        lock(&self.state).commit_faults.push_back(fault);
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.state)
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed a committed row directly.
    pub fn insert_row(&self, table: &str, row: Row) {
        lock(&self.state)
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn stats(&self) -> MemoryStats {
        lock(&self.state).stats.clone()
    }
}

pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    tables: Tables,
    savepoints: Vec<(String, Tables)>,
}

impl MemoryTx {
    /// Count the statement and return any fault due for it.
    fn begin_statement(&self, during: &str) -> BatchResult<()> {
        let mut state = lock(&self.state);
        match during {
            "delete" => state.stats.deletes += 1,
            _ => state.stats.upserts += 1,
        }
        let ordinal = state.stats.upserts + state.stats.deletes;
        let fault = match state.statement_faults.pop_front() {
            Some(fault) => Some(fault),
            None => state.scheduled_faults.remove(&ordinal),
        };
        match fault {
            Some(fault) => Err(fault.into_error(during)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BatchWriter for MemoryTx {
    async fn upsert(&mut self, statement: &UpsertStatement) -> BatchResult<Vec<ColumnValue>> {
        self.begin_statement("upsert")?;

        // Statements are atomic: work on a copy and publish it on success.
        let mut table = self
            .tables
            .get(&statement.table)
            .cloned()
            .unwrap_or_default();
        let mut touched: Vec<usize> = Vec::with_capacity(statement.rows.len());

        for values in &statement.rows {
            let mut incoming: Row = statement
                .columns
                .iter()
                .zip(values)
                .filter_map(|(column, value)| value.clone().map(|v| (column.clone(), v)))
                .collect();

            let key: Vec<ColumnValue> = statement
                .conflict_target
                .iter()
                .map(|c| incoming.get(c).cloned().unwrap_or(ColumnValue::Null))
                .collect();
            let existing = if key.is_empty() || key.iter().any(ColumnValue::is_null) {
                None
            } else {
                table.iter().position(|row| {
                    statement
                        .conflict_target
                        .iter()
                        .zip(&key)
                        .all(|(column, value)| row.get(column) == Some(value))
                })
            };

            let index = match existing {
                Some(index) => {
                    if touched.contains(&index) {
                        return Err(BatchError::Store(
                            "ON CONFLICT DO UPDATE command cannot affect row a second time"
                                .to_string(),
                        ));
                    }
                    for column in &statement.update_columns {
                        let value = incoming.remove(column).unwrap_or(ColumnValue::Null);
                        table[index].insert(column.clone(), value);
                    }
                    index
                }
                None => {
                    if let Some(returning) = &statement.returning {
                        if !incoming.contains_key(returning) {
                            let mut state = lock(&self.state);
                            state.next_id += 1;
                            incoming.insert(returning.clone(), ColumnValue::Int(state.next_id));
                        }
                    }
                    table.push(incoming);
                    table.len() - 1
                }
            };
            touched.push(index);
        }

        let returned = match &statement.returning {
            Some(column) => touched
                .iter()
                .map(|i| table[*i].get(column).cloned().unwrap_or(ColumnValue::Null))
                .collect(),
            None => Vec::new(),
        };
        self.tables.insert(statement.table.clone(), table);
        Ok(returned)
    }

    async fn delete(&mut self, statement: &DeleteStatement) -> BatchResult<u64> {
        self.begin_statement("delete")?;

        let Some(rows) = self.tables.get_mut(&statement.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !statement.predicate.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn savepoint(&mut self, name: &str) -> BatchResult<()> {
        self.savepoints.push((name.to_string(), self.tables.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> BatchResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| BatchError::Store(format!("savepoint \"{name}\" does not exist")))?;
        self.savepoints.truncate(position + 1);
        self.tables = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> BatchResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| BatchError::Store(format!("savepoint \"{name}\" does not exist")))?;
        self.savepoints.truncate(position);
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> BatchResult<MemoryTx> {
        let mut state = lock(&self.state);
        state.stats.begins += 1;
        Ok(MemoryTx {
            state: self.state.clone(),
            tables: state.tables.clone(),
            savepoints: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> BatchResult<()> {
        let mut state = lock(&self.state);
        if let Some(fault) = state.commit_faults.pop_front() {
            state.stats.rollbacks += 1;
            return Err(fault.into_error("commit"));
        }
        state.stats.commits += 1;
        state.tables = tx.tables;
        Ok(())
    }

    async fn rollback(&self, _tx: MemoryTx) -> BatchResult<()> {
        lock(&self.state).stats.rollbacks += 1;
        Ok(())
    }
}
