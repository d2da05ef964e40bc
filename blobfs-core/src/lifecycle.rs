//! Container and blob lifecycle
//!
//! A [`ContainerManager`] decides which blob of a container absorbs each new
//! write. It keeps a bounded active set of writable blobs, rotates blobs that
//! are full, throttles long-running streams against active blobs and closes
//! the whole container when it is retired.
//!
//! Per blob: `Open(active)` -> `Open(inactive)` -> `Closed`. Evicted blobs
//! still serve reads; only active blobs take writes.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::BlobHandle;
use crate::error::{Result, StorageError};
use crate::metadata::MetadataRepository;
use crate::model::{Blob, BlobRange, Container};
use crate::pack::{self, PackHeader};

/// Default upper bound on a blob's size (100 GiB)
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 107_374_182_400;

/// Default number of writable blobs per container
pub const DEFAULT_MAX_ACTIVE_BLOBS: usize = 5;

/// Default fraction of active blobs that may be pinned by streams
pub const DEFAULT_STREAMING_FRACTION: f64 = 0.5;

/// Default wait for a streaming permit
pub const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Header size assumed when picking a blob before the header is encoded
const HEADER_ESTIMATE: u64 = 512;

const APPEND_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub max_blob_size: u64,
    pub max_active_blobs: usize,
    pub streaming_fraction: f64,
    pub streaming_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_active_blobs: DEFAULT_MAX_ACTIVE_BLOBS,
            streaming_fraction: DEFAULT_STREAMING_FRACTION,
            streaming_timeout: DEFAULT_STREAMING_TIMEOUT,
        }
    }
}

impl LifecycleSettings {
    /// Number of active blobs that may be streamed from at once
    pub fn streaming_permits(&self) -> usize {
        let permits = (self.max_active_blobs as f64 * self.streaming_fraction).floor() as usize;
        permits.max(1)
    }
}

#[derive(Default)]
struct ActiveSet {
    /// Oldest first
    blobs: VecDeque<i64>,
    cursor: usize,
}

/// Shared by every stream on one active blob. The first stream on a blob
/// takes one of the container's permits; it goes back when the last stream
/// on that blob is dropped.
struct StreamPin {
    _permit: OwnedSemaphorePermit,
}

/// Held while a stream reads from a blob
pub struct StreamGuard {
    handle: Arc<BlobHandle>,
    pin: Option<Arc<StreamPin>>,
}

impl StreamGuard {
    pub fn handle(&self) -> &Arc<BlobHandle> {
        &self.handle
    }

    /// Whether the stream counts against the container's streaming limit
    pub fn is_throttled(&self) -> bool {
        self.pin.is_some()
    }
}

pub struct ContainerManager {
    container: Mutex<Container>,
    metadata: Arc<dyn MetadataRepository>,
    settings: LifecycleSettings,
    active: Mutex<ActiveSet>,
    handles: Mutex<HashMap<i64, Arc<BlobHandle>>>,
    streaming: Arc<Semaphore>,
    pins: Mutex<HashMap<i64, Weak<StreamPin>>>,
    closed: AtomicBool,
}

fn poisoned(what: &str) -> StorageError {
    StorageError::Database(format!("{} lock poisoned", what))
}

impl ContainerManager {
    /// Build the manager for a persisted container and load its active set
    pub fn open(
        container: Container,
        metadata: Arc<dyn MetadataRepository>,
        settings: LifecycleSettings,
    ) -> Result<Self> {
        if !container.closed {
            std::fs::create_dir_all(container.dir())?;
        }
        let closed = container.closed;
        let manager = Self {
            streaming: Arc::new(Semaphore::new(settings.streaming_permits())),
            container: Mutex::new(container),
            metadata,
            settings,
            active: Mutex::new(ActiveSet::default()),
            handles: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(closed),
        };
        manager.refresh_active_set()?;
        Ok(manager)
    }

    pub fn container(&self) -> Result<Container> {
        Ok(self.container.lock().map_err(|_| poisoned("container"))?.clone())
    }

    pub fn container_id(&self) -> Result<i64> {
        Ok(self.container()?.id)
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn active(&self) -> Result<MutexGuard<'_, ActiveSet>> {
        self.active.lock().map_err(|_| poisoned("active set"))
    }

    /// Ids of the active blobs, oldest first
    pub fn active_blob_ids(&self) -> Result<Vec<i64>> {
        Ok(self.active()?.blobs.iter().copied().collect())
    }

    /// Cached handle for one of this container's blobs
    pub fn blob_handle(&self, blob_id: i64) -> Result<Arc<BlobHandle>> {
        if let Some(handle) = self.cached_handle(blob_id)? {
            return Ok(handle);
        }
        let container = self.container()?;
        let blob = self
            .metadata
            .blob(blob_id)?
            .filter(|b| b.container_id == container.id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("blob {} in container {}", blob_id, container.name))
            })?;
        self.cache_handle(&container, &blob)
    }

    fn cached_handle(&self, blob_id: i64) -> Result<Option<Arc<BlobHandle>>> {
        let handles = self.handles.lock().map_err(|_| poisoned("blob handles"))?;
        Ok(handles.get(&blob_id).cloned())
    }

    fn cache_handle(&self, container: &Container, blob: &Blob) -> Result<Arc<BlobHandle>> {
        let mut handles = self.handles.lock().map_err(|_| poisoned("blob handles"))?;
        if let Some(handle) = handles.get(&blob.id) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(BlobHandle::open(blob, blob.path_in(container))?);
        handles.insert(blob.id, handle.clone());
        Ok(handle)
    }

    fn close_blob(&self, handle: &BlobHandle) -> Result<()> {
        handle.mark_closed();
        if let Some(mut blob) = self.metadata.blob(handle.blob_id())? {
            if !blob.closed {
                blob.closed = true;
                blob.integrity_position = blob.integrity_position.max(handle.integrity_position());
                self.metadata.update_blob(&blob)?;
                info!(blob_id = blob.id, "Closed blob");
            }
        }
        Ok(())
    }

    /// Return an active blob that can take `required` more bytes, creating a
    /// new one when none qualifies. Blobs that cannot take the write are
    /// closed on the way.
    pub fn ensure_writable_blob(&self, required: u64) -> Result<Arc<BlobHandle>> {
        self.select_blob(required, &[])
    }

    /// Round-robin over the active set. A blob with an append in flight is
    /// only picked when the set is at its ceiling; below it a fresh blob is
    /// created instead, so one slow upload does not hold up the others.
    fn select_blob(&self, required: u64, exclude: &[i64]) -> Result<Arc<BlobHandle>> {
        if self.is_closed() {
            return Err(StorageError::ContainerClosed(self.container()?.name));
        }
        let max = self.settings.max_blob_size;
        let mut active = self.active()?;

        let count = active.blobs.len();
        let mut retired = Vec::new();
        let mut chosen = None;
        let mut busy = None;
        for step in 0..count {
            let ix = (active.cursor + step) % count;
            let handle = self.blob_handle(active.blobs[ix])?;
            if handle.is_closed() {
                retired.push(handle.blob_id());
                continue;
            }
            let length = handle.len();
            if length > 0 && length + required > max {
                self.close_blob(&handle)?;
                retired.push(handle.blob_id());
                continue;
            }
            if exclude.contains(&handle.blob_id()) {
                continue;
            }
            if handle.is_writing() {
                if busy.is_none() {
                    busy = Some(handle);
                }
                continue;
            }
            chosen = Some(handle);
            break;
        }
        active.blobs.retain(|id| !retired.contains(id));

        let at_ceiling = active.blobs.len() >= self.settings.max_active_blobs;
        let picked = match (chosen, busy) {
            (Some(handle), _) => Some(handle),
            (None, Some(handle)) if at_ceiling => Some(handle),
            _ => None,
        };
        if let Some(handle) = picked {
            active.cursor = active
                .blobs
                .iter()
                .position(|id| *id == handle.blob_id())
                .map_or(0, |ix| ix + 1);
            return Ok(handle);
        }

        let handle = self.create_blob()?;
        active.blobs.push_back(handle.blob_id());
        while active.blobs.len() > self.settings.max_active_blobs {
            if let Some(evicted) = active.blobs.pop_front() {
                debug!(blob_id = evicted, "Evicted blob from active set");
            }
        }
        active.cursor = 0;
        Ok(handle)
    }

    fn create_blob(&self) -> Result<Arc<BlobHandle>> {
        let container = self.container()?;
        let mut blob = Blob {
            id: 0,
            container_id: container.id,
            name: format!("{}.blob", Uuid::new_v4()),
            closed: false,
            integrity_position: 0,
        };
        blob.id = self.metadata.insert_blob(&blob)?;
        let handle = Arc::new(BlobHandle::open(&blob, blob.path_in(&container))?);
        self.handles
            .lock()
            .map_err(|_| poisoned("blob handles"))?
            .insert(blob.id, handle.clone());
        info!(
            blob_id = blob.id,
            container = %container.name,
            "Created blob {}",
            blob.name
        );
        Ok(handle)
    }

    /// Append one entry to a writable blob. A blob that turns out to be full
    /// or closed once its write lock is held is closed and the next one tried.
    pub fn append(
        &self,
        header: &mut PackHeader,
        content: &mut dyn Read,
        content_length: u64,
    ) -> Result<BlobRange> {
        let required = pack::entry_len(HEADER_ESTIMATE, content_length);
        let mut exclude = Vec::new();
        for _ in 0..APPEND_ATTEMPTS {
            let handle = self.select_blob(required, &exclude)?;
            if let Some(range) = handle.append(
                header,
                content,
                content_length,
                self.settings.max_blob_size,
                self.metadata.as_ref(),
            )? {
                return Ok(range);
            }
            self.close_blob(&handle)?;
            exclude.push(handle.blob_id());
        }
        Err(StorageError::Busy(format!(
            "no writable blob after {} attempts",
            APPEND_ATTEMPTS
        )))
    }

    /// Close every blob and then the container itself. Idempotent; there is
    /// no way back.
    pub fn close(&self) -> Result<()> {
        let mut active = self.active()?;
        let mut container = self.container.lock().map_err(|_| poisoned("container"))?;
        for blob in self.metadata.blobs_in_container(container.id, false)? {
            let handle = self.cache_handle(&container, &blob)?;
            self.close_blob(&handle)?;
        }
        active.blobs.clear();
        active.cursor = 0;
        if !container.closed {
            container.closed = true;
            self.metadata.update_container(&container)?;
            info!(container = %container.name, "Closed container");
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Re-read the container's open blobs from metadata; the newest
    /// `max_active_blobs` become the active set
    pub fn refresh_active_set(&self) -> Result<()> {
        let container_id = self.container_id()?;
        let open = self.metadata.blobs_in_container(container_id, false)?;
        let open_ids: Vec<i64> = open.iter().map(|b| b.id).collect();

        {
            let handles = self.handles.lock().map_err(|_| poisoned("blob handles"))?;
            for (id, handle) in handles.iter() {
                if !open_ids.contains(id) {
                    handle.mark_closed();
                }
            }
            for blob in &open {
                if let Some(handle) = handles.get(&blob.id) {
                    handle.observe_integrity(blob.integrity_position);
                }
            }
        }

        let mut active = self.active()?;
        if self.is_closed() {
            active.blobs.clear();
            return Ok(());
        }
        active.blobs = open
            .iter()
            .take(self.settings.max_active_blobs)
            .rev()
            .map(|b| b.id)
            .collect();
        active.cursor = 0;
        debug!(
            container_id,
            active = active.blobs.len(),
            "Refreshed active blob set"
        );
        Ok(())
    }

    fn pins(&self) -> Result<MutexGuard<'_, HashMap<i64, Weak<StreamPin>>>> {
        self.pins.lock().map_err(|_| poisoned("stream pins"))
    }

    /// Open a read stream on a blob. Streams on an active blob share that
    /// blob's pin; only pinning a new blob needs one of the container's
    /// permits. Waiting longer than the configured timeout fails with a
    /// retryable `Busy`.
    pub async fn open_stream(&self, blob_id: i64) -> Result<StreamGuard> {
        let handle = self.blob_handle(blob_id)?;
        let is_active = self.active()?.blobs.contains(&blob_id);
        if !is_active {
            return Ok(StreamGuard { handle, pin: None });
        }
        if let Some(pin) = self.pins()?.get(&blob_id).and_then(Weak::upgrade) {
            return Ok(StreamGuard {
                handle,
                pin: Some(pin),
            });
        }

        let acquire = self.streaming.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.settings.streaming_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StorageError::Busy("streaming semaphore closed".into())),
            Err(_) => {
                warn!(blob_id, "Timed out waiting for a streaming permit");
                return Err(StorageError::Busy(format!(
                    "all streaming permits busy for blob {}",
                    blob_id
                )));
            }
        };

        let mut pins = self.pins()?;
        pins.retain(|_, pin| pin.strong_count() > 0);
        // Another stream may have pinned the blob while we waited
        let pin = match pins.get(&blob_id).and_then(Weak::upgrade) {
            Some(pin) => pin,
            None => {
                let pin = Arc::new(StreamPin { _permit: permit });
                pins.insert(blob_id, Arc::downgrade(&pin));
                debug!(blob_id, "Pinned blob for streaming");
                pin
            }
        };
        Ok(StreamGuard {
            handle,
            pin: Some(pin),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Folder;
    use crate::pack::EngineHeader;
    use crate::sqlite_store::SqliteMetadataStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn header() -> PackHeader {
        PackHeader {
            file_name: "f.bin".into(),
            folder_url: "/docs".into(),
            file_id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            time_created: Utc::now(),
            modified_by: "tester".into(),
            created_storage_id: Uuid::new_v4(),
            engine: EngineHeader::default(),
        }
    }

    fn manager(dir: &TempDir, settings: LifecycleSettings) -> (Arc<SqliteMetadataStore>, ContainerManager) {
        let store = Arc::new(SqliteMetadataStore::open_in_memory(10, "node").unwrap());
        let folder_id = store
            .insert_folder(&Folder {
                id: 0,
                unique_id: Uuid::new_v4(),
                url: "/docs".into(),
                name: "docs".into(),
                parent_id: None,
            })
            .unwrap();
        let mut container = Container {
            id: 0,
            folder_id,
            path: dir.path().join("c1").to_string_lossy().into_owned(),
            name: "c1".into(),
            closed: false,
        };
        container.id = store.insert_container(&container).unwrap();
        let manager = ContainerManager::open(container, store.clone(), settings).unwrap();
        (store, manager)
    }

    fn write(manager: &ContainerManager, content: &[u8]) -> BlobRange {
        manager
            .append(&mut header(), &mut &content[..], content.len() as u64)
            .unwrap()
    }

    #[test]
    fn test_streaming_permits() {
        assert_eq!(LifecycleSettings::default().streaming_permits(), 2);
        let one = LifecycleSettings {
            max_active_blobs: 1,
            ..LifecycleSettings::default()
        };
        assert_eq!(one.streaming_permits(), 1);
    }

    #[test]
    fn test_rotation_at_size_boundary() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_blob_size: 2048,
            max_active_blobs: 1,
            ..LifecycleSettings::default()
        };
        let (store, manager) = manager(&dir, settings);
        let first = write(&manager, &[1u8; 1000]);
        let second = write(&manager, &[2u8; 1000]);
        assert_ne!(first.blob_id, second.blob_id);
        assert_eq!(second.start, 0);
        // The full blob is closed, leaves the active set and stays readable
        assert!(store.blob(first.blob_id).unwrap().unwrap().closed);
        assert_eq!(manager.active_blob_ids().unwrap(), vec![second.blob_id]);
        let handle = manager.blob_handle(first.blob_id).unwrap();
        assert!(handle.is_closed());
        assert!(handle.open_entry(&first).is_ok());
    }

    #[test]
    fn test_blob_at_limit_is_closed() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_blob_size: 100,
            max_active_blobs: 3,
            ..LifecycleSettings::default()
        };
        let (store, manager) = manager(&dir, settings);
        let first = write(&manager, b"abc");
        let second = write(&manager, b"def");
        assert_ne!(first.blob_id, second.blob_id);
        assert!(store.blob(first.blob_id).unwrap().unwrap().closed);
        assert!(manager.blob_handle(first.blob_id).unwrap().is_closed());
    }

    #[test]
    fn test_oversized_file_gets_dedicated_blob() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_blob_size: 256,
            max_active_blobs: 2,
            ..LifecycleSettings::default()
        };
        let (_store, manager) = manager(&dir, settings);
        let range = write(&manager, &[9u8; 4096]);
        assert_eq!(range.start, 0);
        assert!(range.len() > 4096);
    }

    #[test]
    fn test_busy_blob_grows_active_set() {
        let dir = TempDir::new().unwrap();
        let (_store, manager) = manager(&dir, LifecycleSettings::default());
        let first = write(&manager, b"first");
        let handle = manager.blob_handle(first.blob_id).unwrap();

        let in_flight = handle.pending_write();
        let second = write(&manager, b"second");
        assert_ne!(second.blob_id, first.blob_id);
        assert_eq!(manager.active_blob_ids().unwrap(), vec![first.blob_id, second.blob_id]);
        drop(in_flight);

        // Idle again: round robin comes back to it
        let third = write(&manager, b"third");
        assert_eq!(third.blob_id, first.blob_id);
    }

    #[test]
    fn test_busy_blob_is_shared_at_ceiling() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_active_blobs: 1,
            ..LifecycleSettings::default()
        };
        let (store, manager) = manager(&dir, settings);
        let first = write(&manager, b"first");
        let handle = manager.blob_handle(first.blob_id).unwrap();

        let _in_flight = handle.pending_write();
        let second = write(&manager, b"second");
        assert_eq!(second.blob_id, first.blob_id);
        assert_eq!(second.start, first.end);
        let container_id = manager.container_id().unwrap();
        assert_eq!(store.blobs_in_container(container_id, true).unwrap().len(), 1);
    }

    #[test]
    fn test_round_robin_spreads_writes() {
        let dir = TempDir::new().unwrap();
        let (store, manager) = manager(&dir, LifecycleSettings::default());
        let container_id = manager.container_id().unwrap();
        for _ in 0..3 {
            let blob = Blob {
                id: 0,
                container_id,
                name: format!("{}.blob", Uuid::new_v4()),
                closed: false,
                integrity_position: 0,
            };
            store.insert_blob(&blob).unwrap();
        }
        manager.refresh_active_set().unwrap();
        assert_eq!(manager.active_blob_ids().unwrap().len(), 3);

        let mut used = std::collections::HashSet::new();
        for _ in 0..3 {
            used.insert(write(&manager, b"data").blob_id);
        }
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn test_close_is_idempotent_and_permanent() {
        let dir = TempDir::new().unwrap();
        let (store, manager) = manager(&dir, LifecycleSettings::default());
        let range = write(&manager, b"hello");
        manager.close().unwrap();
        manager.close().unwrap();

        assert!(store.blob(range.blob_id).unwrap().unwrap().closed);
        let container = store.container(manager.container_id().unwrap()).unwrap().unwrap();
        assert!(container.closed);
        assert!(matches!(
            manager.append(&mut header(), &mut &b"x"[..], 1),
            Err(StorageError::ContainerClosed(_))
        ));
        // Closed blobs stay readable
        let handle = manager.blob_handle(range.blob_id).unwrap();
        assert!(handle.open_entry(&range).is_ok());
    }

    #[test]
    fn test_refresh_picks_up_external_blobs() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_active_blobs: 2,
            ..LifecycleSettings::default()
        };
        let (store, manager) = manager(&dir, settings);
        let container_id = manager.container_id().unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .insert_blob(&Blob {
                        id: 0,
                        container_id,
                        name: format!("{}.blob", Uuid::new_v4()),
                        closed: false,
                        integrity_position: 0,
                    })
                    .unwrap(),
            );
        }
        manager.refresh_active_set().unwrap();
        assert_eq!(manager.active_blob_ids().unwrap(), vec![ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn test_streams_on_one_blob_share_a_permit() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            streaming_timeout: Duration::from_millis(50),
            ..LifecycleSettings::default()
        };
        let (_store, manager) = manager(&dir, settings);
        let range = write(&manager, b"hello");

        let mut streams = Vec::new();
        for _ in 0..6 {
            let guard = manager.open_stream(range.blob_id).await.unwrap();
            assert!(guard.is_throttled());
            streams.push(guard);
        }
        assert_eq!(manager.streaming.available_permits(), 1);
        drop(streams);
        assert_eq!(manager.streaming.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_new_blob_past_streaming_limit_is_busy() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_active_blobs: 2,
            streaming_timeout: Duration::from_millis(50),
            ..LifecycleSettings::default()
        };
        let (store, manager) = manager(&dir, settings);
        let container_id = manager.container_id().unwrap();
        for _ in 0..2 {
            store
                .insert_blob(&Blob {
                    id: 0,
                    container_id,
                    name: format!("{}.blob", Uuid::new_v4()),
                    closed: false,
                    integrity_position: 0,
                })
                .unwrap();
        }
        manager.refresh_active_set().unwrap();
        let a = write(&manager, b"on a");
        let b = write(&manager, b"on b");
        assert_ne!(a.blob_id, b.blob_id);

        let first = manager.open_stream(a.blob_id).await.unwrap();
        let second = manager.open_stream(a.blob_id).await.unwrap();
        match manager.open_stream(b.blob_id).await {
            Err(e) => assert!(e.is_retryable()),
            Ok(_) => panic!("a second pinned blob should be busy"),
        }
        drop(first);
        assert!(manager.open_stream(b.blob_id).await.is_err());
        drop(second);
        assert!(manager.open_stream(b.blob_id).await.unwrap().is_throttled());
    }

    #[tokio::test]
    async fn test_inactive_blob_streams_unthrottled() {
        let dir = TempDir::new().unwrap();
        let settings = LifecycleSettings {
            max_blob_size: 2048,
            max_active_blobs: 1,
            ..LifecycleSettings::default()
        };
        let (_store, manager) = manager(&dir, settings);
        let first = write(&manager, &[1u8; 1000]);
        write(&manager, &[2u8; 1000]);
        let guard = manager.open_stream(first.blob_id).await.unwrap();
        assert!(!guard.is_throttled());
    }
}
