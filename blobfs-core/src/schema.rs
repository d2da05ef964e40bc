//! Code-defined table schemas
//!
//! Each entity describes its row shape as a static list of columns. The
//! metadata store builds every INSERT/UPDATE/SELECT from these descriptions,
//! so mapping an entity to a row is a table lookup rather than per-entity SQL.
//!
//! Every table has an implicit `id INTEGER PRIMARY KEY AUTOINCREMENT` column
//! that is not listed in `TableSchema::columns`.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::model::{
    AccessToken, Blob, Container, FileMetadata, FileVersion, Folder, ReplicationFolderSetting,
    StorageNode,
};

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Integer(v.timestamp_micros())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Boolean,
    Text,
    Uuid,
    /// Microseconds since the Unix epoch
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub unique: bool,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        nullable: false,
        unique: false,
    }
}

const fn nullable(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        nullable: true,
        unique: false,
    }
}

const fn unique(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        nullable: false,
        unique: true,
    }
}

#[derive(Debug)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: &'static [Column],
    /// Secondary indexes, each a list of column names
    pub indexes: &'static [&'static [&'static str]],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A row read back from the store, including the `id` column
#[derive(Debug, Clone)]
pub struct Row {
    pub id: i64,
    names: Vec<&'static str>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(id: i64, schema: &TableSchema, values: Vec<Value>) -> Self {
        Self {
            id,
            names: schema.columns.iter().map(|c| c.name).collect(),
            values,
        }
    }

    fn value(&self, name: &str) -> Result<&Value> {
        self.names
            .iter()
            .position(|n| *n == name)
            .and_then(|ix| self.values.get(ix))
            .ok_or_else(|| StorageError::Database(format!("Row has no column '{}'", name)))
    }

    pub fn opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.value(name)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            Value::Text(t) => Err(StorageError::Database(format!(
                "Column '{}' holds text '{}', expected integer",
                name, t
            ))),
        }
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.opt_i64(name)?
            .ok_or_else(|| StorageError::Database(format!("Column '{}' is NULL", name)))
    }

    pub fn u64(&self, name: &str) -> Result<u64> {
        Ok(self.i64(name)? as u64)
    }

    pub fn opt_u64(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.opt_i64(name)?.map(|v| v as u64))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        Ok(self.i64(name)? != 0)
    }

    pub fn opt_string(&self, name: &str) -> Result<Option<String>> {
        match self.value(name)? {
            Value::Null => Ok(None),
            Value::Text(t) => Ok(Some(t.clone())),
            Value::Integer(v) => Ok(Some(v.to_string())),
        }
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.opt_string(name)?
            .ok_or_else(|| StorageError::Database(format!("Column '{}' is NULL", name)))
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid> {
        let text = self.string(name)?;
        Uuid::parse_str(&text)
            .map_err(|e| StorageError::Database(format!("Column '{}' holds bad uuid: {}", name, e)))
    }

    pub fn opt_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.opt_i64(name)? {
            None => Ok(None),
            Some(micros) => Utc
                .timestamp_micros(micros)
                .single()
                .map(Some)
                .ok_or_else(|| {
                    StorageError::Database(format!("Column '{}' holds bad timestamp", name))
                }),
        }
    }

    pub fn time(&self, name: &str) -> Result<DateTime<Utc>> {
        self.opt_time(name)?
            .ok_or_else(|| StorageError::Database(format!("Column '{}' is NULL", name)))
    }
}

/// Comparison used in a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl Op {
    pub fn sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Condition {
    Compare {
        column: &'static str,
        op: Op,
        value: Value,
    },
    In {
        column: &'static str,
        values: Vec<Value>,
    },
    IsNull(&'static str),
    /// At least one of the nested conditions holds
    Any(Vec<Condition>),
}

/// Selection condition: conjunction of conditions plus ordering and limit
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Vec<(&'static str, bool)>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: i64) -> Self {
        Self::new().eq("id", id)
    }

    pub fn compare(mut self, column: &'static str, op: Op, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Compare {
            column,
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.compare(column, Op::Eq, value)
    }

    pub fn gt(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.compare(column, Op::Gt, value)
    }

    pub fn lt(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.compare(column, Op::Lt, value)
    }

    pub fn is_in<V: Into<Value>>(mut self, column: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        self.conditions.push(Condition::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn is_null(mut self, column: &'static str) -> Self {
        self.conditions.push(Condition::IsNull(column));
        self
    }

    pub fn any(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions.push(Condition::Any(conditions));
        self
    }

    pub fn order_by(mut self, column: &'static str) -> Self {
        self.order_by.push((column, true));
        self
    }

    pub fn order_by_desc(mut self, column: &'static str) -> Self {
        self.order_by.push((column, false));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// An entity with a code-defined row mapping
pub trait Entity: Sized {
    const SCHEMA: &'static TableSchema;

    fn id(&self) -> i64;

    /// Cell values in `SCHEMA.columns` order
    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row) -> Result<Self>;
}

use ColumnType::{Boolean, Integer, Text, Timestamp};

pub static STORAGE_NODES: TableSchema = TableSchema {
    table: "storage_nodes",
    columns: &[
        unique("unique_id", ColumnType::Uuid),
        col("name", Text),
        nullable("url", Text),
        col("is_local", Boolean),
        col("time_registered", Timestamp),
        nullable("last_contact", Timestamp),
        nullable("last_attempt", Timestamp),
    ],
    indexes: &[],
};

impl Entity for StorageNode {
    const SCHEMA: &'static TableSchema = &STORAGE_NODES;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.unique_id.into(),
            self.name.clone().into(),
            self.url.clone().into(),
            self.is_local.into(),
            self.time_registered.into(),
            self.last_contact.into(),
            self.last_attempt.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unique_id: row.uuid("unique_id")?,
            name: row.string("name")?,
            url: row.opt_string("url")?,
            is_local: row.bool("is_local")?,
            time_registered: row.time("time_registered")?,
            last_contact: row.opt_time("last_contact")?,
            last_attempt: row.opt_time("last_attempt")?,
        })
    }
}

pub static FOLDERS: TableSchema = TableSchema {
    table: "folders",
    columns: &[
        unique("unique_id", ColumnType::Uuid),
        unique("url", Text),
        col("name", Text),
        nullable("parent_id", Integer),
    ],
    indexes: &[&["parent_id"]],
};

impl Entity for Folder {
    const SCHEMA: &'static TableSchema = &FOLDERS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.unique_id.into(),
            self.url.clone().into(),
            self.name.clone().into(),
            self.parent_id.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unique_id: row.uuid("unique_id")?,
            url: row.string("url")?,
            name: row.string("name")?,
            parent_id: row.opt_i64("parent_id")?,
        })
    }
}

pub static CONTAINERS: TableSchema = TableSchema {
    table: "containers",
    columns: &[
        col("folder_id", Integer),
        unique("path", Text),
        unique("name", Text),
        col("closed", Boolean),
    ],
    indexes: &[&["folder_id"]],
};

impl Entity for Container {
    const SCHEMA: &'static TableSchema = &CONTAINERS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.folder_id.into(),
            self.path.clone().into(),
            self.name.clone().into(),
            self.closed.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            folder_id: row.i64("folder_id")?,
            path: row.string("path")?,
            name: row.string("name")?,
            closed: row.bool("closed")?,
        })
    }
}

pub static BLOBS: TableSchema = TableSchema {
    table: "blobs",
    columns: &[
        col("container_id", Integer),
        unique("name", Text),
        col("closed", Boolean),
        col("integrity_position", Integer),
    ],
    indexes: &[&["container_id", "closed"]],
};

impl Entity for Blob {
    const SCHEMA: &'static TableSchema = &BLOBS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.container_id.into(),
            self.name.clone().into(),
            self.closed.into(),
            self.integrity_position.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            container_id: row.i64("container_id")?,
            name: row.string("name")?,
            closed: row.bool("closed")?,
            integrity_position: row.u64("integrity_position")?,
        })
    }
}

/// Base description of the file tables; the store instantiates it once per
/// shard (`files_00`, `files_01`, ...)
pub static FILES: TableSchema = TableSchema {
    table: "files",
    columns: &[
        unique("unique_id", ColumnType::Uuid),
        col("current_version_id", ColumnType::Uuid),
        col("name", Text),
        col("folder_id", Integer),
        col("time_created", Timestamp),
        col("time_modified", Timestamp),
        col("size", Integer),
        col("deleted", Boolean),
    ],
    indexes: &[&["folder_id", "name"], &["folder_id", "deleted", "time_modified"]],
};

impl Entity for FileMetadata {
    const SCHEMA: &'static TableSchema = &FILES;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.unique_id.into(),
            self.current_version_id.into(),
            self.name.clone().into(),
            self.folder_id.into(),
            self.time_created.into(),
            self.time_modified.into(),
            self.size.into(),
            self.deleted.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unique_id: row.uuid("unique_id")?,
            current_version_id: row.uuid("current_version_id")?,
            name: row.string("name")?,
            folder_id: row.i64("folder_id")?,
            time_created: row.time("time_created")?,
            time_modified: row.time("time_modified")?,
            size: row.u64("size")?,
            deleted: row.bool("deleted")?,
        })
    }
}

pub static FILE_VERSIONS: TableSchema = TableSchema {
    table: "file_versions",
    columns: &[
        unique("unique_id", ColumnType::Uuid),
        col("file_id", ColumnType::Uuid),
        col("folder_id", Integer),
        col("name", Text),
        col("size", Integer),
        col("time_created", Timestamp),
        col("time_stored", Timestamp),
        col("created_storage_id", ColumnType::Uuid),
        col("modified_by", Text),
        nullable("blob_id", Integer),
        nullable("blob_start", Integer),
        nullable("blob_end", Integer),
    ],
    indexes: &[&["file_id", "time_created"], &["folder_id", "time_stored"]],
};

impl Entity for FileVersion {
    const SCHEMA: &'static TableSchema = &FILE_VERSIONS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.unique_id.into(),
            self.file_id.into(),
            self.folder_id.into(),
            self.name.clone().into(),
            self.size.into(),
            self.time_created.into(),
            self.time_stored.into(),
            self.created_storage_id.into(),
            self.modified_by.clone().into(),
            self.blob_id.into(),
            self.blob_start.into(),
            self.blob_end.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unique_id: row.uuid("unique_id")?,
            file_id: row.uuid("file_id")?,
            folder_id: row.i64("folder_id")?,
            name: row.string("name")?,
            size: row.u64("size")?,
            time_created: row.time("time_created")?,
            time_stored: row.time("time_stored")?,
            created_storage_id: row.uuid("created_storage_id")?,
            modified_by: row.string("modified_by")?,
            blob_id: row.opt_i64("blob_id")?,
            blob_start: row.opt_u64("blob_start")?,
            blob_end: row.opt_u64("blob_end")?,
        })
    }
}

pub static REPLICATION_FOLDERS: TableSchema = TableSchema {
    table: "replication_folders",
    columns: &[
        col("folder_id", Integer),
        col("source_node_id", Integer),
        col("target_node_id", Integer),
        col("recursive", Boolean),
        col("soft_delete", Boolean),
        col("last_sync_time", Timestamp),
        col("is_own", Boolean),
    ],
    indexes: &[&["folder_id", "source_node_id", "target_node_id"]],
};

impl Entity for ReplicationFolderSetting {
    const SCHEMA: &'static TableSchema = &REPLICATION_FOLDERS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.folder_id.into(),
            self.source_node_id.into(),
            self.target_node_id.into(),
            self.recursive.into(),
            self.soft_delete.into(),
            self.last_sync_time.into(),
            self.is_own.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            folder_id: row.i64("folder_id")?,
            source_node_id: row.i64("source_node_id")?,
            target_node_id: row.i64("target_node_id")?,
            recursive: row.bool("recursive")?,
            soft_delete: row.bool("soft_delete")?,
            last_sync_time: row.time("last_sync_time")?,
            is_own: row.bool("is_own")?,
        })
    }
}

pub static ACCESS_TOKENS: TableSchema = TableSchema {
    table: "access_tokens",
    columns: &[
        unique("unique_id", ColumnType::Uuid),
        col("expires", Timestamp),
        nullable("security_id", Text),
    ],
    indexes: &[&["expires"]],
};

impl Entity for AccessToken {
    const SCHEMA: &'static TableSchema = &ACCESS_TOKENS;

    fn id(&self) -> i64 {
        self.id
    }

    fn values(&self) -> Vec<Value> {
        vec![
            self.unique_id.into(),
            self.expires.into(),
            self.security_id.clone().into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unique_id: row.uuid("unique_id")?,
            expires: row.time("expires")?,
            security_id: row.opt_string("security_id")?,
        })
    }
}

/// Every fixed table, in creation order. File tables are created per shard.
pub static FIXED_TABLES: &[&TableSchema] = &[
    &STORAGE_NODES,
    &FOLDERS,
    &CONTAINERS,
    &BLOBS,
    &FILE_VERSIONS,
    &REPLICATION_FOLDERS,
    &ACCESS_TOKENS,
];
