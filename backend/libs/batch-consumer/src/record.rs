//! Rows to persist: column values, table descriptions, and record trees.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BatchError, BatchResult};
use crate::message::MessageKey;

/// A single column value bound into a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ColumnValue {
    /// Map a JSON value onto the closest column type. Arrays and objects stay JSON.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ColumnValue::Null,
            serde_json::Value::Bool(b) => ColumnValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ColumnValue::Int(i),
                None => ColumnValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => ColumnValue::Text(s),
            other => ColumnValue::Json(other),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Bool(v) => write!(f, "{v}"),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => write!(f, "{v}"),
            ColumnValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            ColumnValue::Uuid(v) => write!(f, "{v}"),
            ColumnValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            ColumnValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<MessageKey> for ColumnValue {
    fn from(key: MessageKey) -> Self {
        match key {
            MessageKey::Int(v) => ColumnValue::Int(v),
            MessageKey::Text(v) => ColumnValue::Text(v),
            MessageKey::Bytes(v) => ColumnValue::Bytes(v),
            MessageKey::Composite(fields) => ColumnValue::Json(serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::to_value(ColumnValue::from(v)).unwrap_or_default()))
                    .collect(),
            )),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<Uuid> for ColumnValue {
    fn from(v: Uuid) -> Self {
        ColumnValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(v: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(v)
    }
}

/// An attribute is either a column value or the attribute maps of child rows
/// for one association.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Value(ColumnValue),
    Children(Vec<Attributes>),
}

impl Attribute {
    pub fn value(value: impl Into<ColumnValue>) -> Self {
        Attribute::Value(value.into())
    }
}

impl From<ColumnValue> for Attribute {
    fn from(value: ColumnValue) -> Self {
        Attribute::Value(value)
    }
}

pub type Attributes = BTreeMap<String, Attribute>;

/// Produces bulk-import correlation ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Random UUIDv4 correlation ids.
pub fn uuid_id_generator() -> IdGenerator {
    Arc::new(|| Uuid::new_v4().to_string())
}

/// One-to-many association from a parent table to a child table.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationSpec {
    pub name: String,
    pub table: Arc<TableSpec>,
    /// Column on the child table holding the parent's primary key
    pub foreign_key: String,
}

/// Description of a target table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub primary_key: String,
    /// Conflict target for upserts; empty means "use the primary key"
    pub key_columns: Vec<String>,
    /// Known columns. When set, attributes outside this list are dropped.
    pub columns: Option<Vec<String>>,
    /// Maintain `created_at` / `updated_at`
    pub timestamps: bool,
    /// Column stamped with each record's bulk-import correlation id
    pub bulk_import_id_column: Option<String>,
    pub associations: Vec<AssociationSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            key_columns: Vec::new(),
            columns: None,
            timestamps: false,
            bulk_import_id_column: None,
            associations: Vec::new(),
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn bulk_import_id_column(mut self, column: impl Into<String>) -> Self {
        self.bulk_import_id_column = Some(column.into());
        self
    }

    pub fn association(
        mut self,
        name: impl Into<String>,
        table: TableSpec,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.push(AssociationSpec {
            name: name.into(),
            table: Arc::new(table),
            foreign_key: foreign_key.into(),
        });
        self
    }

    /// Conflict columns, falling back to the primary key.
    pub fn conflict_columns(&self) -> Vec<String> {
        if self.key_columns.is_empty() {
            vec![self.primary_key.clone()]
        } else {
            self.key_columns.clone()
        }
    }

    pub fn find_association(&self, name: &str) -> Option<&AssociationSpec> {
        self.associations.iter().find(|a| a.name == name)
    }

    fn accepts_column(&self, column: &str) -> bool {
        match &self.columns {
            Some(columns) => columns.iter().any(|c| c == column) || column == self.primary_key,
            None => true,
        }
    }
}

/// One row to upsert, with the child rows of its associations.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub table: Arc<TableSpec>,
    pub attributes: BTreeMap<String, ColumnValue>,
    /// Child records per association name. A present but empty entry still
    /// marks the association as supplied (relevant when replacing children).
    pub children: BTreeMap<String, Vec<BatchRecord>>,
    pub bulk_import_id: Option<String>,
}

impl BatchRecord {
    /// Build a record tree. Children share the parent's correlation id.
    pub fn new(
        table: Arc<TableSpec>,
        attributes: Attributes,
        id_generator: Option<&IdGenerator>,
    ) -> BatchResult<Self> {
        let bulk_import_id = match &table.bulk_import_id_column {
            Some(_) => id_generator.map(|generate| generate()),
            None => None,
        };
        Self::build(table, attributes, bulk_import_id)
    }

    fn build(
        table: Arc<TableSpec>,
        attributes: Attributes,
        bulk_import_id: Option<String>,
    ) -> BatchResult<Self> {
        let mut values = BTreeMap::new();
        let mut children = BTreeMap::new();

        for (name, attribute) in attributes {
            match attribute {
                Attribute::Value(value) => {
                    if table.accepts_column(&name) {
                        values.insert(name, value);
                    }
                }
                Attribute::Children(rows) => {
                    let association = table.find_association(&name).ok_or_else(|| {
                        BatchError::InvalidRecord(format!(
                            "table {} has no association named {}",
                            table.name, name
                        ))
                    })?;
                    let records = rows
                        .into_iter()
                        .map(|row| {
                            Self::build(association.table.clone(), row, bulk_import_id.clone())
                        })
                        .collect::<BatchResult<Vec<_>>>()?;
                    children.insert(name, records);
                }
            }
        }

        if let (Some(column), Some(id)) = (&table.bulk_import_id_column, &bulk_import_id) {
            values
                .entry(column.clone())
                .or_insert_with(|| ColumnValue::Text(id.clone()));
        }

        Ok(Self {
            table,
            attributes: values,
            children,
            bulk_import_id,
        })
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.attributes.get(column)
    }

    /// Values of `columns`, `Null` where absent.
    pub fn key(&self, columns: &[String]) -> Vec<ColumnValue> {
        columns
            .iter()
            .map(|c| self.attributes.get(c).cloned().unwrap_or(ColumnValue::Null))
            .collect()
    }
}

/// Ordered records, groupable by table so parents precede children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRecordList {
    records: Vec<BatchRecord>,
}

impl BatchRecordList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: BatchRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchRecord> {
        self.records.iter()
    }

    /// Records grouped by table name, tables in first-seen order.
    pub fn by_table(&self) -> Vec<(Arc<TableSpec>, Vec<BatchRecord>)> {
        let mut groups: Vec<(Arc<TableSpec>, Vec<BatchRecord>)> = Vec::new();
        for record in &self.records {
            match groups.iter_mut().find(|(t, _)| t.name == record.table.name) {
                Some((_, group)) => group.push(record.clone()),
                None => groups.push((record.table.clone(), vec![record.clone()])),
            }
        }
        groups
    }
}

impl From<Vec<BatchRecord>> for BatchRecordList {
    fn from(records: Vec<BatchRecord>) -> Self {
        Self { records }
    }
}

impl IntoIterator for BatchRecordList {
    type Item = BatchRecord;
    type IntoIter = std::vec::IntoIter<BatchRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
