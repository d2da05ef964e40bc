//! File and version manager
//!
//! The only component that turns a logical file or version into bytes. Writes
//! go through the container lifecycle and the pack format; each write records
//! a new immutable version and moves the file's current pointer.
//!
//! Writes to the same folder and name are serialized in-process, so two
//! uploads of a new name cannot both create a file row.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::lifecycle::StreamGuard;
use crate::metadata::{CurrentPolicy, MetadataRepository};
use crate::model::{
    BlobRange, FileMetadata, FileVersion, Folder, normalize_folder_url, timestamp_now,
};

type NameKey = (i64, String);
use crate::pack::{EngineHeader, EntryLayout, EntryReader, PackHeader};
use crate::registry::ContainerRegistry;

/// Provenance of a version applied by replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedVersion {
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub time_created: DateTime<Utc>,
    /// Node that originally created the version
    pub created_storage_id: Uuid,
    pub modified_by: String,
}

/// Where a write comes from
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOrigin {
    Local { modified_by: String },
    Replicated(ReplicatedVersion),
}

/// Content stream of one version. Holds the container's streaming permit,
/// when one was needed, until dropped.
pub struct VersionStream {
    layout: EntryLayout,
    reader: EntryReader<BufReader<File>>,
    _guard: Option<StreamGuard>,
}

impl VersionStream {
    pub fn layout(&self) -> &EntryLayout {
        &self.layout
    }

    pub fn content_length(&self) -> u64 {
        self.layout.content_length
    }

    /// Read the remaining content into memory
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(self.layout.content_length as usize);
        self.reader.read_to_end(&mut content)?;
        Ok(content)
    }
}

impl Read for VersionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

pub struct FileManager {
    metadata: Arc<dyn MetadataRepository>,
    containers: Arc<ContainerRegistry>,
    local_node_id: Uuid,
    /// Writers currently working on a (folder id, name)
    name_locks: Mutex<HashMap<NameKey, Weak<Mutex<()>>>>,
}

impl FileManager {
    pub fn new(containers: Arc<ContainerRegistry>) -> Result<Self> {
        let metadata = containers.metadata().clone();
        let local_node_id = metadata.local_node()?.unique_id;
        Ok(Self {
            metadata,
            containers,
            local_node_id,
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    fn name_lock(&self, folder_id: i64, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .name_locks
            .lock()
            .map_err(|_| StorageError::Database("file name locks poisoned".into()))?;
        locks.retain(|_, lock| lock.strong_count() > 0);
        let key = (folder_id, name.to_string());
        if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        Ok(lock)
    }

    pub fn local_node_id(&self) -> Uuid {
        self.local_node_id
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataRepository> {
        &self.metadata
    }

    pub fn containers(&self) -> &Arc<ContainerRegistry> {
        &self.containers
    }

    /// Read-only view for delivery and listing
    pub fn reader(self: &Arc<Self>) -> FileReader {
        FileReader {
            inner: self.clone(),
        }
    }

    pub fn ensure_folder(&self, url: &str) -> Result<Folder> {
        self.containers.ensure_folder(url)
    }

    pub fn folder(&self, url: &str) -> Result<Option<Folder>> {
        self.metadata.folder_by_url(&normalize_folder_url(url)?)
    }

    /// Live (not deleted) file by folder and name
    pub fn file(&self, folder_url: &str, name: &str) -> Result<Option<FileMetadata>> {
        let Some(folder) = self.folder(folder_url)? else {
            return Ok(None);
        };
        Ok(self
            .metadata
            .file_by_name(folder.id, name)?
            .filter(|f| !f.deleted))
    }

    /// Live (not deleted) file by id
    pub fn file_by_id(&self, file_id: &Uuid) -> Result<Option<FileMetadata>> {
        Ok(self.metadata.file(file_id)?.filter(|f| !f.deleted))
    }

    pub fn version(&self, version_id: &Uuid) -> Result<Option<FileVersion>> {
        self.metadata.version(version_id)
    }

    /// Versions of a file ordered by creation time
    pub fn versions(&self, file_id: &Uuid) -> Result<Vec<FileVersion>> {
        self.metadata.versions_of_file(file_id)
    }

    pub fn files_in_folder(&self, folder_url: &str) -> Result<Vec<FileMetadata>> {
        let Some(folder) = self.folder(folder_url)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .metadata
            .files_in_folder(folder.id)?
            .into_iter()
            .filter(|f| !f.deleted)
            .collect())
    }

    /// Store `content` as a new version of `folder_url`/`name`.
    ///
    /// Local writes always become the file's current version. Replicated
    /// writes do so only when they are at least as new as the current
    /// version; older ones are kept for history. Re-applying a replicated
    /// version that already exists returns the stored version.
    pub fn write_file(
        &self,
        folder_url: &str,
        name: &str,
        content: &mut dyn Read,
        content_length: u64,
        origin: WriteOrigin,
    ) -> Result<FileVersion> {
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::Config(format!("invalid file name '{}'", name)));
        }
        let folder = self.ensure_folder(folder_url)?;

        if let WriteOrigin::Replicated(rv) = &origin {
            if let Some(existing) = self.metadata.version(&rv.version_id)? {
                debug!(version_id = %rv.version_id, "Replicated version already present");
                return Ok(existing);
            }
        }

        let manager = self.containers.for_folder(&folder)?.ok_or_else(|| {
            StorageError::Config(format!("no container configured for folder {}", folder.url))
        })?;

        let lock = self.name_lock(folder.id, name)?;
        let _held = lock
            .lock()
            .map_err(|_| StorageError::Database(format!("name lock of {} poisoned", name)))?;

        let (file_id, version_id, time_created, created_storage_id, modified_by, policy) = match &origin {
            WriteOrigin::Local { modified_by } => (
                self.metadata
                    .file_by_name(folder.id, name)?
                    .map(|f| f.unique_id)
                    .unwrap_or_else(Uuid::new_v4),
                Uuid::new_v4(),
                timestamp_now(),
                self.local_node_id,
                modified_by.clone(),
                CurrentPolicy::Always,
            ),
            WriteOrigin::Replicated(rv) => (
                rv.file_id,
                rv.version_id,
                rv.time_created.trunc_subsecs(6),
                rv.created_storage_id,
                rv.modified_by.clone(),
                CurrentPolicy::IfNotOlder,
            ),
        };

        let mut header = PackHeader {
            file_name: name.to_string(),
            folder_url: folder.url.clone(),
            file_id,
            version_id,
            time_created,
            modified_by: modified_by.clone(),
            created_storage_id,
            engine: EngineHeader::default(),
        };
        let range = manager.append(&mut header, content, content_length)?;

        // time_stored is stamped by the store when the row is committed
        let version = FileVersion {
            id: 0,
            unique_id: version_id,
            file_id,
            folder_id: folder.id,
            name: name.to_string(),
            size: content_length,
            time_created,
            time_stored: time_created,
            created_storage_id,
            modified_by,
            blob_id: Some(range.blob_id),
            blob_start: Some(range.start),
            blob_end: Some(range.end),
        };
        let committed = match self.metadata.commit_version(&version, policy) {
            Ok(committed) => committed,
            Err(StorageError::Duplicate(_)) => {
                // A concurrent apply recorded it first; our bytes are orphaned
                return self.metadata.version(&version_id)?.ok_or_else(|| {
                    StorageError::NotFound(format!("version {}", version_id))
                });
            }
            Err(e) => return Err(e),
        };

        if committed.created_file {
            info!(
                file_id = %file_id,
                version_id = %version_id,
                folder = %folder.url,
                "Created file {}",
                name
            );
        } else if committed.became_current {
            info!(file_id = %file_id, version_id = %version_id, "New current version of {}", name);
        } else {
            info!(
                file_id = %file_id,
                version_id = %version_id,
                "Recorded older replicated version of {} without moving current",
                name
            );
        }
        Ok(committed.version)
    }

    /// Stream the current version of a live file
    pub fn read_file(&self, file: &FileMetadata) -> Result<Option<VersionStream>> {
        if file.deleted {
            return Ok(None);
        }
        match self.metadata.version(&file.current_version_id)? {
            Some(version) => self.read_version(&version).map(Some),
            None => Ok(None),
        }
    }

    fn version_range(&self, version: &FileVersion) -> Result<BlobRange> {
        version.blob_range().ok_or_else(|| {
            StorageError::NotFound(format!("content of version {}", version.unique_id))
        })
    }

    fn check_layout(&self, version: &FileVersion, range: &BlobRange, layout: &EntryLayout) -> Result<()> {
        if layout.header.version_id != version.unique_id || layout.content_length != version.size {
            return Err(StorageError::corruption(
                range.blob_id,
                range.start,
                format!(
                    "entry holds version {} ({} bytes), expected {} ({} bytes)",
                    layout.header.version_id,
                    layout.content_length,
                    version.unique_id,
                    version.size
                ),
            ));
        }
        Ok(())
    }

    /// Stream a version's content without taking a streaming permit
    pub fn read_version(&self, version: &FileVersion) -> Result<VersionStream> {
        let range = self.version_range(version)?;
        let blob = self
            .metadata
            .blob(range.blob_id)?
            .ok_or_else(|| StorageError::corruption(range.blob_id, range.start, "blob row missing"))?;
        let handle = self.containers.manager(blob.container_id)?.blob_handle(blob.id)?;
        let (layout, reader) = handle.open_entry(&range)?;
        self.check_layout(version, &range, &layout)?;
        Ok(VersionStream {
            layout,
            reader,
            _guard: None,
        })
    }

    /// Stream a version's content for a long-lived download. Streams against
    /// an active blob wait for one of the container's streaming permits.
    pub async fn open_version_stream(&self, version: &FileVersion) -> Result<VersionStream> {
        let range = self.version_range(version)?;
        let blob = self
            .metadata
            .blob(range.blob_id)?
            .ok_or_else(|| StorageError::corruption(range.blob_id, range.start, "blob row missing"))?;
        let manager = self.containers.manager(blob.container_id)?;
        let guard = manager.open_stream(blob.id).await?;
        let (layout, reader) = guard.handle().open_entry(&range)?;
        self.check_layout(version, &range, &layout)?;
        Ok(VersionStream {
            layout,
            reader,
            _guard: Some(guard),
        })
    }

    /// Flag a file deleted. Bytes stay where they are.
    pub fn delete_file(&self, file: &FileMetadata) -> Result<Option<FileMetadata>> {
        let deleted = self.metadata.mark_file_deleted(&file.unique_id)?;
        if let Some(current) = &deleted {
            info!(file_id = %current.unique_id, "Deleted file {}", current.name);
        }
        Ok(deleted)
    }
}

/// Read-only view of the file manager
#[derive(Clone)]
pub struct FileReader {
    inner: Arc<FileManager>,
}

impl FileReader {
    pub fn local_node_id(&self) -> Uuid {
        self.inner.local_node_id()
    }

    pub fn folder(&self, url: &str) -> Result<Option<Folder>> {
        self.inner.folder(url)
    }

    pub fn file(&self, folder_url: &str, name: &str) -> Result<Option<FileMetadata>> {
        self.inner.file(folder_url, name)
    }

    pub fn file_by_id(&self, file_id: &Uuid) -> Result<Option<FileMetadata>> {
        self.inner.file_by_id(file_id)
    }

    pub fn version(&self, version_id: &Uuid) -> Result<Option<FileVersion>> {
        self.inner.version(version_id)
    }

    pub fn versions(&self, file_id: &Uuid) -> Result<Vec<FileVersion>> {
        self.inner.versions(file_id)
    }

    pub fn files_in_folder(&self, folder_url: &str) -> Result<Vec<FileMetadata>> {
        self.inner.files_in_folder(folder_url)
    }

    pub fn read_file(&self, file: &FileMetadata) -> Result<Option<VersionStream>> {
        self.inner.read_file(file)
    }

    pub fn read_version(&self, version: &FileVersion) -> Result<VersionStream> {
        self.inner.read_version(version)
    }

    pub async fn open_version_stream(&self, version: &FileVersion) -> Result<VersionStream> {
        self.inner.open_version_stream(version).await
    }
}
