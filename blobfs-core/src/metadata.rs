//! Metadata repository contract
//!
//! The narrow CRUD surface the storage engine needs from its metadata store.
//! Implementations must give read-after-write consistency and atomic
//! single-row insert/update. Committing a version and flagging a deletion
//! are the two multi-row operations; both run in one transaction and take
//! their timestamp from a change clock that only moves forward.
//!
//! Optional lookups return `Ok(None)` when the row is absent.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AccessToken, Blob, Container, FileMetadata, FileVersion, Folder, ReplicationFolderSetting,
    StorageNode,
};

/// Whether a newly committed version becomes its file's current version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentPolicy {
    /// Local writes always do
    Always,
    /// Replicated writes only when created no earlier than the current one
    IfNotOlder,
}

/// Outcome of [`MetadataRepository::commit_version`]
#[derive(Debug, Clone)]
pub struct CommittedVersion {
    /// The stored row, with its id and storage stamp
    pub version: FileVersion,
    /// The file row after the commit
    pub file: FileMetadata,
    pub created_file: bool,
    pub became_current: bool,
}

/// Versions and deletions of a change listing, read from one snapshot
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Ordered by storage stamp
    pub versions: Vec<FileVersion>,
    /// Ordered by deletion stamp
    pub deletions: Vec<FileMetadata>,
}

pub trait MetadataRepository: Send + Sync {
    /// Number of file tables files are spread across
    fn shard_count(&self) -> u32;

    // Storage nodes
    fn local_node(&self) -> Result<StorageNode>;
    fn node(&self, id: i64) -> Result<Option<StorageNode>>;
    fn node_by_unique_id(&self, unique_id: &Uuid) -> Result<Option<StorageNode>>;
    fn nodes(&self) -> Result<Vec<StorageNode>>;
    fn insert_node(&self, node: &StorageNode) -> Result<i64>;
    fn update_node(&self, node: &StorageNode) -> Result<()>;

    // Folders
    fn folder(&self, id: i64) -> Result<Option<Folder>>;
    fn folder_by_url(&self, url: &str) -> Result<Option<Folder>>;
    /// The folder at `url` (if any) and every folder below it
    fn folders_under(&self, url: &str) -> Result<Vec<Folder>>;
    fn insert_folder(&self, folder: &Folder) -> Result<i64>;

    // Containers
    fn container(&self, id: i64) -> Result<Option<Container>>;
    fn container_by_name(&self, name: &str) -> Result<Option<Container>>;
    fn container_by_path(&self, path: &str) -> Result<Option<Container>>;
    fn containers(&self) -> Result<Vec<Container>>;
    fn insert_container(&self, container: &Container) -> Result<i64>;
    fn update_container(&self, container: &Container) -> Result<()>;

    // Blobs
    fn blob(&self, id: i64) -> Result<Option<Blob>>;
    /// Blobs of a container, newest first
    fn blobs_in_container(&self, container_id: i64, include_closed: bool) -> Result<Vec<Blob>>;
    fn insert_blob(&self, blob: &Blob) -> Result<i64>;
    fn update_blob(&self, blob: &Blob) -> Result<()>;
    /// Move a blob's integrity position forward; never moves it back
    fn advance_integrity_position(&self, blob_id: i64, position: u64) -> Result<()>;

    // Files
    fn file(&self, unique_id: &Uuid) -> Result<Option<FileMetadata>>;
    fn file_by_name(&self, folder_id: i64, name: &str) -> Result<Option<FileMetadata>>;
    fn files_in_folder(&self, folder_id: i64) -> Result<Vec<FileMetadata>>;
    /// Flag a file deleted, stamping `time_modified` from the change clock.
    /// `None` when the file is missing or already deleted.
    fn mark_file_deleted(&self, file_id: &Uuid) -> Result<Option<FileMetadata>>;

    // Versions
    fn version(&self, unique_id: &Uuid) -> Result<Option<FileVersion>>;
    /// Versions of a file ordered by creation time
    fn versions_of_file(&self, file_id: &Uuid) -> Result<Vec<FileVersion>>;
    /// Record `version` and point its file at it, in one transaction.
    ///
    /// `time_stored` is taken from the change clock inside the transaction,
    /// so it is later than every change already committed and a listing
    /// never misses a version that commits after the listing ran. The file
    /// row is read fresh inside the transaction and created from the version
    /// when missing. Fails with `Duplicate` when the version id exists, and
    /// with `Busy` when a local write finds that another file of the same
    /// name appeared in the folder since the caller looked.
    fn commit_version(&self, version: &FileVersion, policy: CurrentPolicy) -> Result<CommittedVersion>;
    /// Versions stored and files deleted after `since` in any of
    /// `folder_ids`, optionally leaving out versions created by one node
    fn changes_since(
        &self,
        folder_ids: &[i64],
        since: DateTime<Utc>,
        exclude_creator: Option<&Uuid>,
    ) -> Result<ChangeSet>;

    // Replication settings
    /// All settings, or only own (`Some(true)`) / learned (`Some(false)`) ones
    fn replication_settings(&self, own: Option<bool>) -> Result<Vec<ReplicationFolderSetting>>;
    fn find_replication_setting(
        &self,
        folder_id: i64,
        source_node_id: i64,
        target_node_id: i64,
    ) -> Result<Option<ReplicationFolderSetting>>;
    fn insert_replication_setting(&self, setting: &ReplicationFolderSetting) -> Result<i64>;
    fn update_replication_setting(&self, setting: &ReplicationFolderSetting) -> Result<()>;

    // Access tokens
    fn insert_access_token(&self, token: &AccessToken) -> Result<i64>;
    fn access_token(&self, unique_id: &Uuid) -> Result<Option<AccessToken>>;
    /// Delete every token expiring at or before `now`; returns the count
    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize>;
}
