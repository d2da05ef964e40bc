//! SQLite-backed metadata store
//!
//! All statements are generated from the [`TableSchema`] descriptions in
//! [`crate::schema`]. One connection in WAL mode guarded by a mutex gives the
//! read-after-write consistency the engine relies on.
//!
//! A one-row `change_clock` table hands out the storage stamps of versions
//! and deletions. Stamps are strictly increasing across every process that
//! shares the database, because they are drawn inside the write transaction
//! that records the change.
//!
//! File rows are spread over `shard_count` tables (`files_00`, `files_01`,
//! ...) chosen by [`shard_of`]. Lookups by file id go to a single table;
//! lookups by folder and name check every table.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::metadata::{ChangeSet, CommittedVersion, CurrentPolicy, MetadataRepository};
use crate::model::{
    AccessToken, Blob, Container, FileMetadata, FileVersion, Folder, ReplicationFolderSetting,
    StorageNode, folder_within, shard_of,
};
use crate::schema::{
    ColumnType, Condition, Entity, FILES, FIXED_TABLES, Filter, Op, Row, TableSchema, Value,
};

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer | ColumnType::Boolean | ColumnType::Timestamp => "INTEGER",
        ColumnType::Text | ColumnType::Uuid => "TEXT",
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Text(t) => SqlValue::Text(t.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(v),
        SqlValue::Real(v) => Value::Integer(v as i64),
        SqlValue::Text(t) => Value::Text(t),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn create_table(conn: &Connection, table: &str, schema: &TableSchema) -> Result<()> {
    let mut defs = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    for column in schema.columns {
        let mut def = format!("{} {}", column.name, sql_type(column.ty));
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        if column.unique {
            def.push_str(" UNIQUE");
        }
        defs.push(def);
    }
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        table,
        defs.join(", ")
    ))?;
    for (ix, index) in schema.indexes.iter().enumerate() {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({});",
            table,
            ix,
            table,
            index.join(", ")
        ))?;
    }
    Ok(())
}

fn condition_sql(condition: &Condition, params: &mut Vec<SqlValue>) -> String {
    match condition {
        Condition::Compare { column, op, value } => {
            params.push(to_sql(value));
            format!("{} {} ?{}", column, op.sql(), params.len())
        }
        Condition::In { column, values } => {
            if values.is_empty() {
                return "0".to_string();
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| {
                    params.push(to_sql(v));
                    format!("?{}", params.len())
                })
                .collect();
            format!("{} IN ({})", column, placeholders.join(", "))
        }
        Condition::IsNull(column) => format!("{} IS NULL", column),
        Condition::Any(conditions) => {
            if conditions.is_empty() {
                return "0".to_string();
            }
            let parts: Vec<String> = conditions
                .iter()
                .map(|c| condition_sql(c, params))
                .collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

fn filter_sql(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    let mut sql = String::new();
    if !filter.conditions.is_empty() {
        let parts: Vec<String> = filter
            .conditions
            .iter()
            .map(|c| condition_sql(c, params))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&parts.join(" AND "));
    }
    if !filter.order_by.is_empty() {
        let parts: Vec<String> = filter
            .order_by
            .iter()
            .map(|(col, asc)| format!("{} {}", col, if *asc { "ASC" } else { "DESC" }))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&parts.join(", "));
    }
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

fn insert_row<E: Entity>(conn: &Connection, table: &str, entity: &E) -> Result<i64> {
    let schema = E::SCHEMA;
    let names: Vec<&str> = schema.columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        placeholders.join(", ")
    );
    let params: Vec<SqlValue> = entity.values().iter().map(to_sql).collect();
    conn.execute(&sql, params_from_iter(params.iter()))?;
    Ok(conn.last_insert_rowid())
}

fn update_row<E: Entity>(conn: &Connection, table: &str, entity: &E) -> Result<()> {
    let schema = E::SCHEMA;
    let sets: Vec<String> = schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", c.name, i + 1))
        .collect();
    let mut params: Vec<SqlValue> = entity.values().iter().map(to_sql).collect();
    params.push(SqlValue::Integer(entity.id()));
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table,
        sets.join(", "),
        params.len()
    );
    let changed = conn.execute(&sql, params_from_iter(params.iter()))?;
    if changed == 0 {
        return Err(StorageError::NotFound(format!(
            "{} row {}",
            table,
            entity.id()
        )));
    }
    Ok(())
}

fn select_rows<E: Entity>(conn: &Connection, table: &str, filter: &Filter) -> Result<Vec<E>> {
    let schema = E::SCHEMA;
    let names: Vec<&str> = schema.columns.iter().map(|c| c.name).collect();
    let mut params = Vec::new();
    let sql = format!(
        "SELECT id, {} FROM {}{}",
        names.join(", "),
        table,
        filter_sql(filter, &mut params)
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(params.iter()), |r| {
            let id: i64 = r.get(0)?;
            let mut values = Vec::with_capacity(names.len());
            for ix in 0..names.len() {
                values.push(from_sql(r.get::<_, SqlValue>(ix + 1)?));
            }
            Ok((id, values))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(id, values)| E::from_row(&Row::new(id, schema, values)))
        .collect()
}

fn select_one<E: Entity>(conn: &Connection, table: &str, filter: Filter) -> Result<Option<E>> {
    Ok(select_rows(conn, table, &filter.limit(1))?.into_iter().next())
}

fn delete_rows(conn: &Connection, table: &str, filter: &Filter) -> Result<usize> {
    let mut params = Vec::new();
    let sql = format!("DELETE FROM {}{}", table, filter_sql(filter, &mut params));
    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
}

fn file_table(shard: u32) -> String {
    format!("{}_{:02}", FILES.table, shard)
}

/// Seeded from the newest stored version so stamps keep increasing across
/// upgrades of an existing database
const CHANGE_CLOCK_DDL: &str = "
    CREATE TABLE IF NOT EXISTS change_clock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_stamp INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO change_clock (id, last_stamp)
        SELECT 1, COALESCE(MAX(time_stored), 0) FROM file_versions;
";

/// Wait this long for another process's write transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Next storage stamp: now, or one microsecond past the last stamp handed
/// out, whichever is later. Must run inside a write transaction.
fn next_stamp(conn: &Connection) -> Result<DateTime<Utc>> {
    let last: i64 = conn.query_row(
        "SELECT last_stamp FROM change_clock WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    let stamp = Utc::now().timestamp_micros().max(last + 1);
    conn.execute(
        "UPDATE change_clock SET last_stamp = ?1 WHERE id = 1",
        [stamp],
    )?;
    Utc.timestamp_micros(stamp)
        .single()
        .ok_or_else(|| StorageError::Database(format!("change stamp {} out of range", stamp)))
}

fn file_by_name_in(
    conn: &Connection,
    shard_count: u32,
    folder_id: i64,
    name: &str,
) -> Result<Option<FileMetadata>> {
    for shard in 0..shard_count {
        let found: Option<FileMetadata> = select_one(
            conn,
            &file_table(shard),
            Filter::new().eq("folder_id", folder_id).eq("name", name),
        )?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// SQLite implementation of [`MetadataRepository`]
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
    shard_count: u32,
}

impl SqliteMetadataStore {
    /// Open (or create) the store at `path`. The local storage node row is
    /// created on first open with a fresh unique id and renamed to
    /// `node_name` on later opens if the name changed.
    pub fn open(path: &Path, shard_count: u32, node_name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", "-64000")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        info!("Opened metadata store at {:?}", path);
        Self::init(conn, shard_count, node_name)
    }

    pub fn open_in_memory(shard_count: u32, node_name: &str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, shard_count, node_name)
    }

    fn init(conn: Connection, shard_count: u32, node_name: &str) -> Result<Self> {
        if shard_count == 0 {
            return Err(StorageError::Config("shard count must be at least 1".into()));
        }
        for schema in FIXED_TABLES {
            create_table(&conn, schema.table, schema)?;
        }
        for shard in 0..shard_count {
            create_table(&conn, &file_table(shard), &FILES)?;
        }
        conn.execute_batch(CHANGE_CLOCK_DDL)?;

        let existing: Option<StorageNode> = select_one(
            &conn,
            "storage_nodes",
            Filter::new().eq("is_local", true),
        )?;
        match existing {
            Some(mut node) if node.name != node_name => {
                node.name = node_name.to_string();
                update_row(&conn, "storage_nodes", &node)?;
            }
            Some(_) => {}
            None => {
                let mut node = StorageNode::new(Uuid::new_v4(), node_name, None);
                node.is_local = true;
                let id = insert_row(&conn, "storage_nodes", &node)?;
                info!(id, unique_id = %node.unique_id, "Registered local storage node");
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            shard_count,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("metadata connection lock poisoned".into()))
    }

    fn file_table_for(&self, file_id: &Uuid) -> String {
        file_table(shard_of(file_id, self.shard_count))
    }
}

impl MetadataRepository for SqliteMetadataStore {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn local_node(&self) -> Result<StorageNode> {
        select_one(
            &*self.conn()?,
            "storage_nodes",
            Filter::new().eq("is_local", true),
        )?
        .ok_or_else(|| StorageError::NotFound("local storage node".into()))
    }

    fn node(&self, id: i64) -> Result<Option<StorageNode>> {
        select_one(&*self.conn()?, "storage_nodes", Filter::by_id(id))
    }

    fn node_by_unique_id(&self, unique_id: &Uuid) -> Result<Option<StorageNode>> {
        select_one(
            &*self.conn()?,
            "storage_nodes",
            Filter::new().eq("unique_id", *unique_id),
        )
    }

    fn nodes(&self) -> Result<Vec<StorageNode>> {
        select_rows(&*self.conn()?, "storage_nodes", &Filter::new().order_by("id"))
    }

    fn insert_node(&self, node: &StorageNode) -> Result<i64> {
        insert_row(&*self.conn()?, "storage_nodes", node)
    }

    fn update_node(&self, node: &StorageNode) -> Result<()> {
        update_row(&*self.conn()?, "storage_nodes", node)
    }

    fn folder(&self, id: i64) -> Result<Option<Folder>> {
        select_one(&*self.conn()?, "folders", Filter::by_id(id))
    }

    fn folder_by_url(&self, url: &str) -> Result<Option<Folder>> {
        select_one(&*self.conn()?, "folders", Filter::new().eq("url", url))
    }

    fn folders_under(&self, url: &str) -> Result<Vec<Folder>> {
        let all: Vec<Folder> =
            select_rows(&*self.conn()?, "folders", &Filter::new().order_by("url"))?;
        Ok(all
            .into_iter()
            .filter(|f| folder_within(&f.url, url, true))
            .collect())
    }

    fn insert_folder(&self, folder: &Folder) -> Result<i64> {
        insert_row(&*self.conn()?, "folders", folder)
    }

    fn container(&self, id: i64) -> Result<Option<Container>> {
        select_one(&*self.conn()?, "containers", Filter::by_id(id))
    }

    fn container_by_name(&self, name: &str) -> Result<Option<Container>> {
        select_one(&*self.conn()?, "containers", Filter::new().eq("name", name))
    }

    fn container_by_path(&self, path: &str) -> Result<Option<Container>> {
        select_one(&*self.conn()?, "containers", Filter::new().eq("path", path))
    }

    fn containers(&self) -> Result<Vec<Container>> {
        select_rows(&*self.conn()?, "containers", &Filter::new().order_by("id"))
    }

    fn insert_container(&self, container: &Container) -> Result<i64> {
        insert_row(&*self.conn()?, "containers", container)
    }

    fn update_container(&self, container: &Container) -> Result<()> {
        update_row(&*self.conn()?, "containers", container)
    }

    fn blob(&self, id: i64) -> Result<Option<Blob>> {
        select_one(&*self.conn()?, "blobs", Filter::by_id(id))
    }

    fn blobs_in_container(&self, container_id: i64, include_closed: bool) -> Result<Vec<Blob>> {
        let mut filter = Filter::new().eq("container_id", container_id);
        if !include_closed {
            filter = filter.eq("closed", false);
        }
        select_rows(&*self.conn()?, "blobs", &filter.order_by_desc("id"))
    }

    fn insert_blob(&self, blob: &Blob) -> Result<i64> {
        insert_row(&*self.conn()?, "blobs", blob)
    }

    fn update_blob(&self, blob: &Blob) -> Result<()> {
        update_row(&*self.conn()?, "blobs", blob)
    }

    fn advance_integrity_position(&self, blob_id: i64, position: u64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE blobs SET integrity_position = ?1 WHERE id = ?2 AND integrity_position < ?1",
            rusqlite::params![position as i64, blob_id],
        )?;
        if changed == 0 {
            debug!(blob_id, position, "Integrity position already at or past target");
        }
        Ok(())
    }

    fn file(&self, unique_id: &Uuid) -> Result<Option<FileMetadata>> {
        select_one(
            &*self.conn()?,
            &self.file_table_for(unique_id),
            Filter::new().eq("unique_id", *unique_id),
        )
    }

    fn file_by_name(&self, folder_id: i64, name: &str) -> Result<Option<FileMetadata>> {
        file_by_name_in(&*self.conn()?, self.shard_count, folder_id, name)
    }

    fn files_in_folder(&self, folder_id: i64) -> Result<Vec<FileMetadata>> {
        let conn = self.conn()?;
        let mut files = Vec::new();
        for shard in 0..self.shard_count {
            files.extend(select_rows::<FileMetadata>(
                &conn,
                &file_table(shard),
                &Filter::new().eq("folder_id", folder_id),
            )?);
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn mark_file_deleted(&self, file_id: &Uuid) -> Result<Option<FileMetadata>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let table = self.file_table_for(file_id);
        let existing: Option<FileMetadata> =
            select_one(&tx, &table, Filter::new().eq("unique_id", *file_id))?;
        let Some(mut file) = existing.filter(|f| !f.deleted) else {
            return Ok(None);
        };
        file.deleted = true;
        file.time_modified = next_stamp(&tx)?;
        update_row(&tx, &table, &file)?;
        tx.commit()?;
        Ok(Some(file))
    }

    fn version(&self, unique_id: &Uuid) -> Result<Option<FileVersion>> {
        select_one(
            &*self.conn()?,
            "file_versions",
            Filter::new().eq("unique_id", *unique_id),
        )
    }

    fn versions_of_file(&self, file_id: &Uuid) -> Result<Vec<FileVersion>> {
        select_rows(
            &*self.conn()?,
            "file_versions",
            &Filter::new()
                .eq("file_id", *file_id)
                .order_by("time_created")
                .order_by("id"),
        )
    }

    fn commit_version(&self, version: &FileVersion, policy: CurrentPolicy) -> Result<CommittedVersion> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut version = version.clone();
        version.time_stored = next_stamp(&tx)?;
        version.id = insert_row(&tx, "file_versions", &version)?;

        let table = self.file_table_for(&version.file_id);
        let existing: Option<FileMetadata> =
            select_one(&tx, &table, Filter::new().eq("unique_id", version.file_id))?;
        let (file, created_file, became_current) = match existing {
            None => {
                if policy == CurrentPolicy::Always {
                    if let Some(other) =
                        file_by_name_in(&tx, self.shard_count, version.folder_id, &version.name)?
                    {
                        return Err(StorageError::Busy(format!(
                            "{} was created concurrently as file {}",
                            version.name, other.unique_id
                        )));
                    }
                }
                let mut file = FileMetadata {
                    id: 0,
                    unique_id: version.file_id,
                    current_version_id: version.unique_id,
                    name: version.name.clone(),
                    folder_id: version.folder_id,
                    time_created: version.time_created,
                    time_modified: version.time_stored,
                    size: version.size,
                    deleted: false,
                };
                file.id = insert_row(&tx, &table, &file)?;
                (file, true, true)
            }
            Some(mut file) => {
                let advance = match policy {
                    CurrentPolicy::Always => true,
                    CurrentPolicy::IfNotOlder => {
                        let current: Option<FileVersion> = select_one(
                            &tx,
                            "file_versions",
                            Filter::new().eq("unique_id", file.current_version_id),
                        )?;
                        current.is_none_or(|c| version.time_created >= c.time_created)
                    }
                };
                if advance {
                    file.current_version_id = version.unique_id;
                    file.size = version.size;
                    file.time_modified = version.time_stored;
                    file.deleted = false;
                    update_row(&tx, &table, &file)?;
                }
                (file, false, advance)
            }
        };
        tx.commit()?;
        Ok(CommittedVersion {
            version,
            file,
            created_file,
            became_current,
        })
    }

    fn changes_since(
        &self,
        folder_ids: &[i64],
        since: DateTime<Utc>,
        exclude_creator: Option<&Uuid>,
    ) -> Result<ChangeSet> {
        let mut conn = self.conn()?;
        // One read transaction, so both lists come from the same snapshot
        let tx = conn.transaction()?;

        let mut filter = Filter::new()
            .is_in("folder_id", folder_ids.iter().copied())
            .gt("time_stored", since);
        if let Some(creator) = exclude_creator {
            filter = filter.compare("created_storage_id", Op::Ne, *creator);
        }
        let versions = select_rows(
            &tx,
            "file_versions",
            &filter.order_by("time_stored").order_by("id"),
        )?;

        let deleted = Filter::new()
            .is_in("folder_id", folder_ids.iter().copied())
            .eq("deleted", true)
            .gt("time_modified", since);
        let mut deletions = Vec::new();
        for shard in 0..self.shard_count {
            deletions.extend(select_rows::<FileMetadata>(&tx, &file_table(shard), &deleted)?);
        }
        deletions.sort_by_key(|f| f.time_modified);
        tx.commit()?;
        Ok(ChangeSet { versions, deletions })
    }

    fn replication_settings(&self, own: Option<bool>) -> Result<Vec<ReplicationFolderSetting>> {
        let mut filter = Filter::new();
        if let Some(own) = own {
            filter = filter.eq("is_own", own);
        }
        select_rows(&*self.conn()?, "replication_folders", &filter.order_by("id"))
    }

    fn find_replication_setting(
        &self,
        folder_id: i64,
        source_node_id: i64,
        target_node_id: i64,
    ) -> Result<Option<ReplicationFolderSetting>> {
        select_one(
            &*self.conn()?,
            "replication_folders",
            Filter::new()
                .eq("folder_id", folder_id)
                .eq("source_node_id", source_node_id)
                .eq("target_node_id", target_node_id),
        )
    }

    fn insert_replication_setting(&self, setting: &ReplicationFolderSetting) -> Result<i64> {
        insert_row(&*self.conn()?, "replication_folders", setting)
    }

    fn update_replication_setting(&self, setting: &ReplicationFolderSetting) -> Result<()> {
        update_row(&*self.conn()?, "replication_folders", setting)
    }

    fn insert_access_token(&self, token: &AccessToken) -> Result<i64> {
        insert_row(&*self.conn()?, "access_tokens", token)
    }

    fn access_token(&self, unique_id: &Uuid) -> Result<Option<AccessToken>> {
        select_one(
            &*self.conn()?,
            "access_tokens",
            Filter::new().eq("unique_id", *unique_id),
        )
    }

    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        delete_rows(
            &*self.conn()?,
            "access_tokens",
            &Filter::new().compare("expires", crate::schema::Op::Le, now),
        )
    }
}

#[cfg(test)]
impl SqliteMetadataStore {
    /// Make every update of a file row named `name` fail
    pub(crate) fn refuse_file_updates(&self, name: &str) {
        let conn = self.conn().unwrap();
        for shard in 0..self.shard_count {
            let table = file_table(shard);
            conn.execute_batch(&format!(
                "CREATE TRIGGER refuse_{table} BEFORE UPDATE ON {table} \
                 WHEN OLD.name = '{name}' BEGIN SELECT RAISE(ABORT, 'refused'); END;"
            ))
            .unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::open_in_memory(10, "node-a").unwrap()
    }

    fn folder(store: &SqliteMetadataStore, url: &str) -> Folder {
        let mut folder = Folder {
            id: 0,
            unique_id: Uuid::new_v4(),
            url: url.to_string(),
            name: url.rsplit('/').next().unwrap_or_default().to_string(),
            parent_id: None,
        };
        folder.id = store.insert_folder(&folder).unwrap();
        folder
    }

    fn version(file_id: Uuid, folder_id: i64, creator: Uuid, stored: DateTime<Utc>) -> FileVersion {
        FileVersion {
            id: 0,
            unique_id: Uuid::new_v4(),
            file_id,
            folder_id,
            name: "a.txt".into(),
            size: 5,
            time_created: stored,
            time_stored: stored,
            created_storage_id: creator,
            modified_by: "tester".into(),
            blob_id: Some(1),
            blob_start: Some(0),
            blob_end: Some(100),
        }
    }

    #[test]
    fn test_local_node_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.sqlite");
        let first = SqliteMetadataStore::open(&path, 10, "node-a")
            .unwrap()
            .local_node()
            .unwrap();
        let reopened = SqliteMetadataStore::open(&path, 10, "node-renamed").unwrap();
        let second = reopened.local_node().unwrap();
        assert_eq!(first.unique_id, second.unique_id);
        assert_eq!(second.name, "node-renamed");
        assert_eq!(reopened.nodes().unwrap().len(), 1);
    }

    #[test]
    fn test_file_rows_land_in_their_shard() {
        let store = store();
        let docs = folder(&store, "/docs");
        let v = version(Uuid::new_v4(), docs.id, Uuid::new_v4(), Utc::now());
        let committed = store.commit_version(&v, CurrentPolicy::Always).unwrap();
        assert!(committed.created_file);
        assert!(committed.became_current);

        let table = file_table(shard_of(&v.file_id, 10));
        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap();
        drop(conn);
        assert_eq!(count, 1);

        let file = store.file(&v.file_id).unwrap().unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.current_version_id, v.unique_id);
        let by_name = store.file_by_name(docs.id, "a.txt").unwrap().unwrap();
        assert_eq!(by_name.unique_id, v.file_id);
        assert!(store.file_by_name(docs.id, "b.txt").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let store = store();
        let docs = folder(&store, "/docs");
        let v = version(Uuid::new_v4(), docs.id, Uuid::new_v4(), Utc::now());
        store.commit_version(&v, CurrentPolicy::IfNotOlder).unwrap();
        match store.commit_version(&v, CurrentPolicy::IfNotOlder) {
            Err(StorageError::Duplicate(_)) => {}
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(store.versions_of_file(&v.file_id).unwrap().len(), 1);
    }

    #[test]
    fn test_older_replica_does_not_become_current() {
        let store = store();
        let docs = folder(&store, "/docs");
        let file_id = Uuid::new_v4();
        let t0 = Utc::now();
        let newer = version(file_id, docs.id, Uuid::new_v4(), t0);
        let older = version(file_id, docs.id, Uuid::new_v4(), t0 - Duration::minutes(5));
        store.commit_version(&newer, CurrentPolicy::IfNotOlder).unwrap();
        let committed = store.commit_version(&older, CurrentPolicy::IfNotOlder).unwrap();
        assert!(!committed.created_file);
        assert!(!committed.became_current);
        let file = store.file(&file_id).unwrap().unwrap();
        assert_eq!(file.current_version_id, newer.unique_id);
    }

    #[test]
    fn test_local_write_racing_a_new_name_is_busy() {
        let store = store();
        let docs = folder(&store, "/docs");
        let now = Utc::now();
        let first = version(Uuid::new_v4(), docs.id, Uuid::new_v4(), now);
        let second = version(Uuid::new_v4(), docs.id, Uuid::new_v4(), now);
        store.commit_version(&first, CurrentPolicy::Always).unwrap();
        assert!(matches!(
            store.commit_version(&second, CurrentPolicy::Always),
            Err(StorageError::Busy(_))
        ));
        // The failed commit leaves nothing behind
        assert!(store.version(&second.unique_id).unwrap().is_none());

        // Replicated files may share a name
        store.commit_version(&second, CurrentPolicy::IfNotOlder).unwrap();
        assert_eq!(store.files_in_folder(docs.id).unwrap().len(), 2);
    }

    #[test]
    fn test_storage_stamps_strictly_increase() {
        let store = store();
        let docs = folder(&store, "/docs");
        let now = Utc::now();
        let mut last = DateTime::<Utc>::MIN_UTC;
        for _ in 0..50 {
            let v = version(Uuid::new_v4(), docs.id, Uuid::new_v4(), now);
            let committed = store.commit_version(&v, CurrentPolicy::IfNotOlder).unwrap();
            assert!(committed.version.time_stored > last);
            last = committed.version.time_stored;
        }
        let deleted = store
            .mark_file_deleted(&store.files_in_folder(docs.id).unwrap()[0].unique_id)
            .unwrap()
            .unwrap();
        assert!(deleted.time_modified > last);
    }

    #[test]
    fn test_stamp_clock_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.sqlite");
        let store = SqliteMetadataStore::open(&path, 4, "node-a").unwrap();
        let docs = folder(&store, "/docs").id;
        // A creation time in the future pushes the stamp past the wall clock
        let future = Utc::now() + Duration::hours(1);
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "UPDATE change_clock SET last_stamp = ?1",
                [future.timestamp_micros()],
            )
            .unwrap();
        }
        drop(store);

        let store = SqliteMetadataStore::open(&path, 4, "node-a").unwrap();
        let v = version(Uuid::new_v4(), docs, Uuid::new_v4(), Utc::now());
        let committed = store.commit_version(&v, CurrentPolicy::Always).unwrap();
        assert!(committed.version.time_stored > future);
    }

    #[test]
    fn test_integrity_position_only_moves_forward() {
        let store = store();
        let blob = Blob {
            id: 0,
            container_id: 1,
            name: "x.blob".into(),
            closed: false,
            integrity_position: 0,
        };
        let id = store.insert_blob(&blob).unwrap();
        store.advance_integrity_position(id, 500).unwrap();
        store.advance_integrity_position(id, 200).unwrap();
        assert_eq!(store.blob(id).unwrap().unwrap().integrity_position, 500);
    }

    #[test]
    fn test_changes_since_excludes_requester() {
        let store = store();
        let docs = folder(&store, "/docs");
        let other = folder(&store, "/other");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let t0 = Utc::now() - Duration::minutes(10);
        let mut stamps = Vec::new();
        for (folder_id, creator) in [(docs.id, a), (docs.id, b), (docs.id, a), (other.id, a)] {
            let v = version(Uuid::new_v4(), folder_id, creator, t0);
            stamps.push(
                store
                    .commit_version(&v, CurrentPolicy::IfNotOlder)
                    .unwrap()
                    .version
                    .time_stored,
            );
        }

        let changes = store.changes_since(&[docs.id], t0, None).unwrap();
        assert_eq!(changes.versions.len(), 3);
        assert!(changes.deletions.is_empty());
        assert!(changes.versions[0].time_stored < changes.versions[1].time_stored);

        let after_first = store.changes_since(&[docs.id], stamps[0], None).unwrap();
        assert_eq!(after_first.versions.len(), 2);

        let excluding_b = store.changes_since(&[docs.id], t0, Some(&b)).unwrap();
        assert_eq!(excluding_b.versions.len(), 2);
        assert!(excluding_b.versions.iter().all(|v| v.created_storage_id == a));

        let gone = store.file_by_name(docs.id, "a.txt").unwrap().unwrap();
        store.mark_file_deleted(&gone.unique_id).unwrap().unwrap();
        assert!(store.mark_file_deleted(&gone.unique_id).unwrap().is_none());
        let changes = store.changes_since(&[docs.id], stamps[3], None).unwrap();
        assert!(changes.versions.is_empty());
        assert_eq!(changes.deletions.len(), 1);
        assert_eq!(changes.deletions[0].unique_id, gone.unique_id);

        assert!(store.changes_since(&[], t0, None).unwrap().versions.is_empty());
    }

    #[test]
    fn test_folders_under() {
        let store = store();
        folder(&store, "/docs");
        folder(&store, "/docs/a");
        folder(&store, "/docsx");
        let under: Vec<String> = store
            .folders_under("/docs")
            .unwrap()
            .into_iter()
            .map(|f| f.url)
            .collect();
        assert_eq!(under, vec!["/docs".to_string(), "/docs/a".to_string()]);
    }

    #[test]
    fn test_purge_expired_tokens() {
        let store = store();
        let now = Utc::now();
        for offset in [-2i64, -1, 1] {
            store
                .insert_access_token(&AccessToken {
                    id: 0,
                    unique_id: Uuid::new_v4(),
                    expires: now + Duration::hours(offset),
                    security_id: None,
                })
                .unwrap();
        }
        assert_eq!(store.purge_expired_tokens(now).unwrap(), 2);
        assert_eq!(store.purge_expired_tokens(now).unwrap(), 0);
    }

    #[test]
    fn test_update_missing_row_is_not_found() {
        let store = store();
        let container = Container {
            id: 42,
            folder_id: 1,
            path: "/tmp/c".into(),
            name: "c".into(),
            closed: false,
        };
        assert!(matches!(
            store.update_container(&container),
            Err(StorageError::NotFound(_))
        ));
    }
}
