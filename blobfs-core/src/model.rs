//! Entity model for blobfs
//!
//! Folders, containers, blobs, files, versions, storage nodes, replication
//! settings and access tokens. Every entity carries a local integer id
//! (assigned by the metadata store on insert, `0` before that) and, where it
//! has to be recognisable across nodes, a globally unique id.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Number of file tables a folder's files are spread across
pub const DEFAULT_SHARD_COUNT: u32 = 10;

/// Shard a file's metadata row lives in.
///
/// Pure and stateless: the same id always maps to the same shard for a given
/// shard count, on every node.
pub fn shard_of(file_id: &Uuid, shard_count: u32) -> u32 {
    (file_id.as_u128() % u128::from(shard_count.max(1))) as u32
}

/// Current time at the precision the metadata store keeps (microseconds)
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Normalize a slash-delimited folder URL: leading slash, no trailing slash,
/// no empty segments. The root folder is `/`.
pub fn normalize_folder_url(url: &str) -> Result<String> {
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments {
        if *segment == "." || *segment == ".." {
            return Err(StorageError::Config(format!(
                "Folder URL '{}' contains a relative segment",
                url
            )));
        }
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent URL of a normalized folder URL (`None` for the root)
pub fn parent_folder_url(url: &str) -> Option<String> {
    if url == "/" {
        return None;
    }
    match url.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(ix) => Some(url[..ix].to_string()),
        None => None,
    }
}

/// Whether `url` is `root` itself or (when `recursive`) lies below it
pub fn folder_within(url: &str, root: &str, recursive: bool) -> bool {
    if url == root {
        return true;
    }
    if !recursive {
        return false;
    }
    if root == "/" {
        return true;
    }
    url.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

/// A storage node: this process or a peer it knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: i64,
    pub unique_id: Uuid,
    pub name: String,
    /// Base URL the node serves replication requests on
    pub url: Option<String>,
    pub is_local: bool,
    pub time_registered: DateTime<Utc>,
    /// Last successful exchange with this node
    pub last_contact: Option<DateTime<Utc>>,
    /// Last attempt to reach this node, successful or not
    pub last_attempt: Option<DateTime<Utc>>,
}

impl StorageNode {
    pub fn new(unique_id: Uuid, name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            id: 0,
            unique_id,
            name: name.into(),
            url,
            is_local: false,
            time_registered: timestamp_now(),
            last_contact: None,
            last_attempt: None,
        }
    }
}

/// Logical namespace node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub unique_id: Uuid,
    pub url: String,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// Directory-backed group of blobs bound to one folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: i64,
    pub folder_id: i64,
    pub path: String,
    pub name: String,
    pub closed: bool,
}

impl Container {
    pub fn dir(&self) -> &Path {
        Path::new(&self.path)
    }
}

/// One physical append-only data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub id: i64,
    pub container_id: i64,
    pub name: String,
    pub closed: bool,
    /// Every byte below this offset belongs to a fully flushed write
    pub integrity_position: u64,
}

impl Blob {
    pub fn path_in(&self, container: &Container) -> PathBuf {
        container.dir().join(&self.name)
    }
}

/// Logical file identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: i64,
    pub unique_id: Uuid,
    pub current_version_id: Uuid,
    pub name: String,
    pub folder_id: i64,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
    pub size: u64,
    pub deleted: bool,
}

/// Byte range of one packed entry inside a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRange {
    pub blob_id: i64,
    pub start: u64,
    pub end: u64,
}

impl BlobRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Immutable snapshot of a file's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: i64,
    pub unique_id: Uuid,
    pub file_id: Uuid,
    pub folder_id: i64,
    pub name: String,
    pub size: u64,
    /// When the version was created on its originating node
    pub time_created: DateTime<Utc>,
    /// When the version row was recorded on this node
    pub time_stored: DateTime<Utc>,
    /// Unique id of the node that created the version
    pub created_storage_id: Uuid,
    pub modified_by: String,
    pub blob_id: Option<i64>,
    pub blob_start: Option<u64>,
    pub blob_end: Option<u64>,
}

impl FileVersion {
    pub fn blob_range(&self) -> Option<BlobRange> {
        match (self.blob_id, self.blob_start, self.blob_end) {
            (Some(blob_id), Some(start), Some(end)) => Some(BlobRange { blob_id, start, end }),
            _ => None,
        }
    }
}

/// A (folder, source node) replication relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFolderSetting {
    pub id: i64,
    pub folder_id: i64,
    /// Node the folder's contents are pulled from
    pub source_node_id: i64,
    /// Node doing the pulling
    pub target_node_id: i64,
    pub recursive: bool,
    pub soft_delete: bool,
    /// Watermark: storage time of the last change applied from the source
    pub last_sync_time: DateTime<Utc>,
    /// `true` when this node itself pulls; `false` for relationships learned
    /// from peers
    pub is_own: bool,
}

/// Operation-scoped credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: i64,
    pub unique_id: Uuid,
    pub expires: DateTime<Utc>,
    pub security_id: Option<String>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}
