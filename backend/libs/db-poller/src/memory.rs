//! In-memory checkpoint store and source table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{CheckpointStore, PollInfo};
use crate::error::PollerResult;
use crate::source::{PolledRow, StateBasedSource, TimeBasedSource, TimeWindow};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    infos: Arc<Mutex<HashMap<String, PollInfo>>>,
    saves: Arc<Mutex<Vec<PollInfo>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, producer: &str) -> Option<PollInfo> {
        lock(&self.infos).get(producer).cloned()
    }

    pub fn put(&self, info: PollInfo) {
        lock(&self.infos).insert(info.producer.clone(), info);
    }

    /// Every checkpoint written, in order.
    pub fn saves(&self) -> Vec<PollInfo> {
        lock(&self.saves).clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_or_create(
        &self,
        producer: &str,
        initial: DateTime<Utc>,
    ) -> PollerResult<PollInfo> {
        Ok(lock(&self.infos)
            .entry(producer.to_string())
            .or_insert_with(|| PollInfo::new(producer, initial))
            .clone())
    }

    async fn save(&self, info: &PollInfo) -> PollerResult<()> {
        lock(&self.infos).insert(info.producer.clone(), info.clone());
        lock(&self.saves).push(info.clone());
        Ok(())
    }
}

/// A source row plus the columns the state-based mode maintains.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub row: PolledRow,
    pub state: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Table serving both polling modes. Pending rows are those with no state.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceTable {
    rows: Arc<Mutex<Vec<MemoryRow>>>,
    fetches: Arc<Mutex<usize>>,
}

impl MemorySourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, timestamp: DateTime<Utc>, data: serde_json::Value) {
        lock(&self.rows).push(MemoryRow {
            row: PolledRow {
                id,
                timestamp,
                data,
            },
            state: None,
            published_at: None,
        });
    }

    pub fn rows(&self) -> Vec<MemoryRow> {
        lock(&self.rows).clone()
    }

    /// Number of page queries served.
    pub fn fetches(&self) -> usize {
        *lock(&self.fetches)
    }

    fn page<F>(&self, limit: usize, filter: F) -> Vec<PolledRow>
    where
        F: Fn(&MemoryRow) -> bool,
    {
        *lock(&self.fetches) += 1;
        let mut rows: Vec<PolledRow> = lock(&self.rows)
            .iter()
            .filter(|r| filter(r))
            .map(|r| r.row.clone())
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        rows.truncate(limit);
        rows
    }
}

#[async_trait]
impl TimeBasedSource for MemorySourceTable {
    async fn fetch_page(&self, window: &TimeWindow, limit: usize) -> PollerResult<Vec<PolledRow>> {
        Ok(self.page(limit, |r| window.contains(r.row.timestamp, r.row.id)))
    }
}

#[async_trait]
impl StateBasedSource for MemorySourceTable {
    async fn fetch_pending(&self, limit: usize) -> PollerResult<Vec<PolledRow>> {
        Ok(self.page(limit, |r| r.state.is_none()))
    }

    async fn finalize(
        &self,
        ids: &[i64],
        state: Option<&str>,
        now: DateTime<Utc>,
    ) -> PollerResult<u64> {
        let mut updated = 0;
        for row in lock(&self.rows).iter_mut().filter(|r| ids.contains(&r.row.id)) {
            row.row.timestamp = now;
            row.published_at = Some(now);
            if let Some(state) = state {
                row.state = Some(state.to_string());
            }
            updated += 1;
        }
        Ok(updated)
    }
}
