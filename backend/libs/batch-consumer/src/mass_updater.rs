//! Bulk upsert and delete of record trees.
//!
//! Each table in a record list becomes one `INSERT … ON CONFLICT DO UPDATE`.
//! Generated parent ids are written into the children's foreign keys before
//! the children are upserted the same way. Contention errors are returned to
//! the caller untouched; retrying is the job of [`crate::DeadlockRetry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{BatchError, BatchResult};
use crate::record::{AssociationSpec, BatchRecord, BatchRecordList, ColumnValue, TableSpec};
use crate::store::{BatchWriter, DeleteStatement, Predicate, UpsertStatement};

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// Chooses the conflict columns of a table.
pub type KeyColumnsFn = Arc<dyn Fn(&TableSpec) -> Vec<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MassUpdater {
    key_columns: Option<KeyColumnsFn>,
    replace_associations: bool,
}

impl std::fmt::Debug for MassUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MassUpdater")
            .field("custom_key_columns", &self.key_columns.is_some())
            .field("replace_associations", &self.replace_associations)
            .finish()
    }
}

impl MassUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_columns(mut self, key_columns: KeyColumnsFn) -> Self {
        self.key_columns = Some(key_columns);
        self
    }

    /// Replace a parent's whole child set instead of merging into it.
    pub fn replace_associations(mut self, replace: bool) -> Self {
        self.replace_associations = replace;
        self
    }

    pub fn key_columns_for(&self, table: &TableSpec) -> Vec<String> {
        match &self.key_columns {
            Some(key_columns) => key_columns(table),
            None => table.conflict_columns(),
        }
    }

    /// Upsert every record (and its children). Returns the number of rows written.
    pub async fn mass_update<W: BatchWriter>(
        &self,
        tx: &mut W,
        records: &BatchRecordList,
    ) -> BatchResult<usize> {
        let mut written = 0;
        for (table, group) in records.by_table() {
            written += self.upsert_table(tx, table, group).await?;
        }
        Ok(written)
    }

    /// Delete the rows identified by `keys` with a single statement.
    pub async fn delete<W: BatchWriter>(
        &self,
        tx: &mut W,
        table: &TableSpec,
        keys: &[BTreeMap<String, ColumnValue>],
    ) -> BatchResult<u64> {
        let Some(predicate) = deletion_predicate(keys) else {
            return Ok(0);
        };
        let statement = DeleteStatement {
            table: table.name.clone(),
            predicate,
        };
        let deleted = tx.delete(&statement).await?;
        debug!(table = %table.name, keys = keys.len(), deleted, "Removed records");
        Ok(deleted)
    }

    fn upsert_table<'a, W: BatchWriter>(
        &'a self,
        tx: &'a mut W,
        table: Arc<TableSpec>,
        records: Vec<BatchRecord>,
    ) -> BoxFuture<'a, BatchResult<usize>> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(0);
            }
            let received = records.len();
            let mut records = dedup_by_key(records, &self.key_columns_for(&table));
            if records.len() < received {
                debug!(
                    table = %table.name,
                    dropped = received - records.len(),
                    "Dropped records superseded by a later one with the same key"
                );
            }

            let statement = self.upsert_statement(&table, &records)?;
            let ids = tx.upsert(&statement).await?;
            if ids.len() != records.len() {
                return Err(BatchError::Store(format!(
                    "upsert into {} returned {} ids for {} rows",
                    table.name,
                    ids.len(),
                    records.len()
                )));
            }
            debug!(table = %table.name, rows = records.len(), "Upserted records");
            let mut written = records.len();

            for association in &table.associations {
                let mut parents: Vec<(ColumnValue, Option<String>)> = Vec::new();
                let mut children: Vec<BatchRecord> = Vec::new();
                for (record, id) in records.iter_mut().zip(&ids) {
                    let Some(mut rows) = record.children.remove(&association.name) else {
                        continue;
                    };
                    for child in rows.iter_mut() {
                        child
                            .attributes
                            .insert(association.foreign_key.clone(), id.clone());
                    }
                    parents.push((id.clone(), record.bulk_import_id.clone()));
                    children.extend(rows);
                }
                if parents.is_empty() {
                    continue;
                }
                written += self
                    .write_children(&mut *tx, association, parents, children)
                    .await?;
            }
            Ok(written)
        })
    }

    async fn write_children<W: BatchWriter>(
        &self,
        tx: &mut W,
        association: &AssociationSpec,
        parents: Vec<(ColumnValue, Option<String>)>,
        children: Vec<BatchRecord>,
    ) -> BatchResult<usize> {
        let child_table = association.table.clone();
        if !self.replace_associations {
            return self.upsert_table(tx, child_table, children).await;
        }

        let fk = &association.foreign_key;
        let stamped = child_table.bulk_import_id_column.as_ref().filter(|_| {
            parents.iter().all(|(_, import_id)| import_id.is_some())
        });

        match stamped {
            // Upsert first, then drop children not carrying this import's id.
            Some(import_column) => {
                let written = self.upsert_table(tx, child_table.clone(), children).await?;
                let stale = Predicate::Or(
                    parents
                        .into_iter()
                        .map(|(id, import_id)| {
                            Predicate::And(vec![
                                Predicate::Eq(fk.clone(), id),
                                Predicate::DistinctFrom(
                                    import_column.clone(),
                                    import_id.map(ColumnValue::Text).unwrap_or(ColumnValue::Null),
                                ),
                            ])
                        })
                        .collect(),
                );
                tx.delete(&DeleteStatement {
                    table: child_table.name.clone(),
                    predicate: stale,
                })
                .await?;
                Ok(written)
            }
            None => {
                let ids = parents.into_iter().map(|(id, _)| id).collect();
                tx.delete(&DeleteStatement {
                    table: child_table.name.clone(),
                    predicate: Predicate::In(fk.clone(), ids),
                })
                .await?;
                self.upsert_table(tx, child_table, children).await
            }
        }
    }

    fn upsert_statement(
        &self,
        table: &TableSpec,
        records: &[BatchRecord],
    ) -> BatchResult<UpsertStatement> {
        let key_columns = self.key_columns_for(table);
        if key_columns.is_empty() {
            return Err(BatchError::Config(format!(
                "no key columns for table {}",
                table.name
            )));
        }

        let mut columns: BTreeSet<String> = records
            .iter()
            .flat_map(|r| r.attributes.keys().cloned())
            .collect();
        columns.insert(table.primary_key.clone());
        columns.extend(key_columns.iter().cloned());
        if table.timestamps {
            columns.insert(CREATED_AT.to_string());
            columns.insert(UPDATED_AT.to_string());
        }
        let columns: Vec<String> = columns.into_iter().collect();

        let now = ColumnValue::Timestamp(Utc::now());
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| match record.attributes.get(column) {
                        Some(value) => Some(value.clone()),
                        None if table.timestamps
                            && (column == CREATED_AT || column == UPDATED_AT) =>
                        {
                            Some(now.clone())
                        }
                        None => None,
                    })
                    .collect()
            })
            .collect();

        let mut update_columns: Vec<String> = columns
            .iter()
            .filter(|c| {
                !key_columns.contains(c) && **c != table.primary_key && c.as_str() != CREATED_AT
            })
            .cloned()
            .collect();
        // Touch a key column so every row is returned even when nothing else changes.
        if update_columns.is_empty() {
            update_columns.push(key_columns[0].clone());
        }

        Ok(UpsertStatement {
            table: table.name.clone(),
            columns,
            rows,
            conflict_target: key_columns,
            update_columns,
            returning: Some(table.primary_key.clone()),
        })
    }
}

/// Keep the last record for each conflict key, in order of those last
/// occurrences. Records with a missing or null key column never conflict and
/// are all kept.
fn dedup_by_key(records: Vec<BatchRecord>, key_columns: &[String]) -> Vec<BatchRecord> {
    if key_columns.is_empty() {
        return records;
    }
    let keys: Vec<Option<Vec<String>>> = records
        .iter()
        .map(|record| {
            key_columns
                .iter()
                .map(|column| match record.attributes.get(column) {
                    Some(value) if !value.is_null() => Some(format!("{value:?}")),
                    _ => None,
                })
                .collect()
        })
        .collect();
    let mut last: HashMap<&Vec<String>, usize> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            last.insert(key, index);
        }
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| match &keys[*index] {
            Some(key) => last.get(key) == Some(index),
            None => true,
        })
        .map(|(_, record)| record)
        .collect()
}

/// OR of exact-key matches; `IN (…)` when every key is the same single column.
pub fn deletion_predicate(keys: &[BTreeMap<String, ColumnValue>]) -> Option<Predicate> {
    if keys.is_empty() {
        return None;
    }
    let single_column = keys[0].keys().next().filter(|_| keys[0].len() == 1).cloned();
    if let Some(column) = single_column {
        if keys.iter().all(|k| k.len() == 1 && k.contains_key(&column)) {
            let values = keys.iter().filter_map(|k| k.get(&column).cloned()).collect();
            return Some(Predicate::In(column, values));
        }
    }
    Some(Predicate::Or(keys.iter().map(Predicate::key_match).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBatchStore;
    use crate::record::{Attribute, Attributes, IdGenerator};
    use crate::store::BatchStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn widgets() -> Arc<TableSpec> {
        Arc::new(
            TableSpec::new("widgets")
                .key_columns(["sku"])
                .with_timestamps()
                .bulk_import_id_column("import_id")
                .association(
                    "parts",
                    TableSpec::new("parts")
                        .key_columns(["widget_id", "code"])
                        .bulk_import_id_column("import_id"),
                    "widget_id",
                ),
        )
    }

    fn counter_ids() -> IdGenerator {
        let next = Arc::new(AtomicUsize::new(0));
        Arc::new(move || format!("import-{}", next.fetch_add(1, Ordering::SeqCst)))
    }

    fn widget(sku: &str, name: &str, parts: Option<&[&str]>, ids: &IdGenerator) -> BatchRecord {
        let mut attrs = Attributes::new();
        attrs.insert("sku".into(), Attribute::value(sku));
        attrs.insert("name".into(), Attribute::value(name));
        if let Some(parts) = parts {
            let rows = parts
                .iter()
                .map(|code| {
                    let mut part = Attributes::new();
                    part.insert("code".into(), Attribute::value(*code));
                    part
                })
                .collect();
            attrs.insert("parts".into(), Attribute::Children(rows));
        }
        BatchRecord::new(widgets(), attrs, Some(ids)).unwrap()
    }

    fn codes(store: &MemoryBatchStore) -> Vec<String> {
        let mut codes: Vec<String> = store
            .rows("parts")
            .iter()
            .map(|r| r["code"].to_string())
            .collect();
        codes.sort();
        codes
    }

    #[tokio::test]
    async fn test_upsert_backfills_parent_ids_into_children() {
        let store = MemoryBatchStore::new();
        let ids = counter_ids();
        let list = BatchRecordList::from(vec![
            widget("a", "A", Some(&["p1", "p2"]), &ids),
            widget("b", "B", None, &ids),
        ]);

        let mut tx = store.begin().await.unwrap();
        let written = MassUpdater::new().mass_update(&mut tx, &list).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(written, 4);
        let widgets = store.rows("widgets");
        assert_eq!(widgets.len(), 2);
        assert!(widgets[0].contains_key(CREATED_AT));
        let parent_id = widgets[0]["id"].clone();
        for part in store.rows("parts") {
            assert_eq!(part["widget_id"], parent_id);
            assert_eq!(part["import_id"], widgets[0]["import_id"]);
        }
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_rows_and_keeps_created_at() {
        let store = MemoryBatchStore::new();
        let ids = counter_ids();
        let updater = MassUpdater::new();

        let mut tx = store.begin().await.unwrap();
        updater
            .mass_update(&mut tx, &BatchRecordList::from(vec![widget("a", "first", None, &ids)]))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
        let created = store.rows("widgets")[0][CREATED_AT].clone();

        let mut tx = store.begin().await.unwrap();
        updater
            .mass_update(&mut tx, &BatchRecordList::from(vec![widget("a", "second", None, &ids)]))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let rows = store.rows("widgets");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], ColumnValue::from("second"));
        assert_eq!(rows[0][CREATED_AT], created);
    }

    #[tokio::test]
    async fn test_replace_associations_drops_stale_children() {
        let store = MemoryBatchStore::new();
        let ids = counter_ids();
        let updater = MassUpdater::new().replace_associations(true);

        for parts in [&["p1", "p2"][..], &["p2", "p3"][..]] {
            let mut tx = store.begin().await.unwrap();
            let list = BatchRecordList::from(vec![widget("a", "A", Some(parts), &ids)]);
            updater.mass_update(&mut tx, &list).await.unwrap();
            store.commit(tx).await.unwrap();
        }

        assert_eq!(codes(&store), vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn test_replace_without_import_column_deletes_first() {
        let store = MemoryBatchStore::new();
        let table = Arc::new(TableSpec::new("orders").key_columns(["number"]).association(
            "lines",
            TableSpec::new("lines"),
            "order_id",
        ));
        let order = |lines: &[&str]| {
            let mut attrs = Attributes::new();
            attrs.insert("number".into(), Attribute::value("o-1"));
            attrs.insert(
                "lines".into(),
                Attribute::Children(
                    lines
                        .iter()
                        .map(|l| {
                            let mut line = Attributes::new();
                            line.insert("sku".into(), Attribute::value(*l));
                            line
                        })
                        .collect(),
                ),
            );
            BatchRecord::new(table.clone(), attrs, None).unwrap()
        };
        let updater = MassUpdater::new().replace_associations(true);

        for lines in [&["x", "y"][..], &["z"][..]] {
            let mut tx = store.begin().await.unwrap();
            updater
                .mass_update(&mut tx, &BatchRecordList::from(vec![order(lines)]))
                .await
                .unwrap();
            store.commit(tx).await.unwrap();
        }

        let lines = store.rows("lines");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["sku"], ColumnValue::from("z"));
    }

    #[tokio::test]
    async fn test_delete_uses_single_statement() {
        let store = MemoryBatchStore::new();
        let ids = counter_ids();
        let updater = MassUpdater::new();
        let mut tx = store.begin().await.unwrap();
        let list = BatchRecordList::from(vec![
            widget("a", "A", None, &ids),
            widget("b", "B", None, &ids),
            widget("c", "C", None, &ids),
        ]);
        updater.mass_update(&mut tx, &list).await.unwrap();

        let keys: Vec<BTreeMap<String, ColumnValue>> = ["a", "c"]
            .iter()
            .map(|sku| BTreeMap::from([("sku".to_string(), ColumnValue::from(*sku))]))
            .collect();
        let deleted = updater.delete(&mut tx, &widgets(), &keys).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.stats().deletes, 1);
        assert_eq!(store.rows("widgets").len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_propagated() {
        let store = MemoryBatchStore::new();
        store.inject_conflicts(1);
        let ids = counter_ids();
        let mut tx = store.begin().await.unwrap();
        let err = MassUpdater::new()
            .mass_update(&mut tx, &BatchRecordList::from(vec![widget("a", "A", None, &ids)]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_duplicate_child_keys_write_last_occurrence() {
        let store = MemoryBatchStore::new();
        let ids = counter_ids();
        let parts: &[&str] = &["bolt", "bolt", "nut"];
        let list = BatchRecordList::from(vec![widget("a", "A", Some(parts), &ids)]);

        let mut tx = store.begin().await.unwrap();
        let written = MassUpdater::new().mass_update(&mut tx, &list).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(codes(&store), vec!["bolt".to_string(), "nut".to_string()]);
    }

    #[test]
    fn test_dedup_by_key_keeps_last_record_per_key() {
        let table = Arc::new(TableSpec::new("parts").key_columns(["code"]));
        let part = |code: Option<&str>, qty: i64| {
            let mut attrs = Attributes::new();
            if let Some(code) = code {
                attrs.insert("code".into(), Attribute::value(code));
            }
            attrs.insert("qty".into(), Attribute::value(qty));
            BatchRecord::new(table.clone(), attrs, None).unwrap()
        };
        let records = vec![
            part(Some("bolt"), 1),
            part(Some("nut"), 2),
            part(None, 3),
            part(Some("bolt"), 4),
            part(None, 5),
        ];

        let kept: Vec<ColumnValue> = dedup_by_key(records, &["code".to_string()])
            .into_iter()
            .map(|r| r.attributes["qty"].clone())
            .collect();
        assert_eq!(
            kept,
            vec![
                ColumnValue::Int(2),
                ColumnValue::Int(3),
                ColumnValue::Int(4),
                ColumnValue::Int(5)
            ]
        );
    }

    #[test]
    fn test_deletion_predicate_shapes() {
        assert_eq!(deletion_predicate(&[]), None);

        let single: Vec<_> = [1, 2]
            .iter()
            .map(|id| BTreeMap::from([("id".to_string(), ColumnValue::Int(*id))]))
            .collect();
        assert_eq!(
            deletion_predicate(&single),
            Some(Predicate::In(
                "id".into(),
                vec![ColumnValue::Int(1), ColumnValue::Int(2)]
            ))
        );

        let composite = vec![BTreeMap::from([
            ("a".to_string(), ColumnValue::Int(1)),
            ("b".to_string(), ColumnValue::Int(2)),
        ])];
        assert!(matches!(
            deletion_predicate(&composite),
            Some(Predicate::Or(ref parts)) if parts.len() == 1
        ));
    }

    #[test]
    fn test_custom_key_columns() {
        let updater = MassUpdater::new().with_key_columns(Arc::new(|t: &TableSpec| {
            vec![format!("{}_uid", t.name)]
        }));
        assert_eq!(updater.key_columns_for(&TableSpec::new("w")), vec!["w_uid".to_string()]);
    }
}
