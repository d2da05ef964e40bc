//! Per-blob append and read handle
//!
//! Appends are serialized twice: by an in-process mutex and by an exclusive
//! advisory lock on the blob file, so writers in other processes sharing the
//! container queue up behind it too. Under both locks the writer re-reads the
//! physical length, writes the entry at the end, fsyncs, and only then
//! advances the integrity position. The position never passes a write that
//! is still in flight.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::{Result, StorageError};
use crate::metadata::MetadataRepository;
use crate::model::{Blob, BlobRange};
use crate::pack::{self, EntryLayout, EntryReader, PackHeader};

pub struct BlobHandle {
    blob_id: i64,
    path: PathBuf,
    writer: Mutex<File>,
    /// Physical length as of this process's last append or refresh
    length: AtomicU64,
    /// Appends queued on or holding the write lock
    writers: AtomicUsize,
    integrity: AtomicU64,
    closed: AtomicBool,
}

/// Marks a write in progress on a blob while alive
pub(crate) struct PendingWrite<'a>(&'a AtomicUsize);

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BlobHandle {
    /// Open the backing file of `blob`, creating it if it does not exist yet
    pub fn open(blob: &Blob, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let length = file.metadata()?.len();
        if blob.integrity_position > length {
            error!(
                blob_id = blob.id,
                integrity = blob.integrity_position,
                length,
                "Blob is shorter than its integrity position"
            );
        }
        Ok(Self {
            blob_id: blob.id,
            path,
            writer: Mutex::new(file),
            length: AtomicU64::new(length),
            writers: AtomicUsize::new(0),
            integrity: AtomicU64::new(blob.integrity_position),
            closed: AtomicBool::new(blob.closed),
        })
    }

    pub fn blob_id(&self) -> i64 {
        self.blob_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn integrity_position(&self) -> u64 {
        self.integrity.load(Ordering::Acquire)
    }

    /// Pick up an integrity position advanced by another process
    pub fn observe_integrity(&self, position: u64) {
        self.integrity.fetch_max(position, Ordering::AcqRel);
        self.length.fetch_max(position, Ordering::AcqRel);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Last known physical length. Never waits for a running append; the
    /// append itself re-reads the length under the write lock.
    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an append is running or queued on this blob
    pub fn is_writing(&self) -> bool {
        self.writers.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pending_write(&self) -> PendingWrite<'_> {
        self.writers.fetch_add(1, Ordering::AcqRel);
        PendingWrite(&self.writers)
    }

    fn lock(&self) -> Result<MutexGuard<'_, File>> {
        self.writer.lock().map_err(|_| {
            StorageError::Database(format!("write lock of blob {} poisoned", self.blob_id))
        })
    }

    /// Append one entry.
    ///
    /// Returns `Ok(None)` without touching the file when the blob is closed or
    /// the entry would push a non-empty blob past `max_size`.
    pub fn append(
        &self,
        header: &mut PackHeader,
        content: &mut dyn Read,
        content_length: u64,
        max_size: u64,
        metadata: &dyn MetadataRepository,
    ) -> Result<Option<BlobRange>> {
        let _pending = self.pending_write();
        let file = self.lock()?;
        if self.is_closed() {
            return Ok(None);
        }

        file.lock()?;
        let result = self.append_locked(&file, header, content, content_length, max_size, metadata);
        if let Err(e) = file.unlock() {
            warn!(blob_id = self.blob_id, "Failed to release blob file lock: {}", e);
        }
        result
    }

    fn append_locked(
        &self,
        file: &File,
        header: &mut PackHeader,
        content: &mut dyn Read,
        content_length: u64,
        max_size: u64,
        metadata: &dyn MetadataRepository,
    ) -> Result<Option<BlobRange>> {
        // Another process may have closed the blob or appended to it
        if metadata.blob(self.blob_id)?.is_some_and(|b| b.closed) {
            self.mark_closed();
            return Ok(None);
        }
        let start = file.metadata()?.len();
        self.length.store(start, Ordering::Release);

        let header_bytes = header.encode(start, content_length)?;
        let total = pack::entry_len(header_bytes.len() as u64, content_length);
        if start > 0 && start + total > max_size {
            debug!(
                blob_id = self.blob_id,
                start, total, max_size, "Entry does not fit in blob"
            );
            return Ok(None);
        }

        let written = {
            let mut out = BufWriter::new(file);
            let result = pack::write_entry(&mut out, &header_bytes, content, content_length)
                .and_then(|n| out.flush().map(|_| n).map_err(StorageError::from));
            drop(out);
            match result {
                Ok(n) => n,
                Err(e) => {
                    // Whatever reached the file is orphaned; nothing points at it
                    let orphaned_to = file.metadata().map(|m| m.len()).unwrap_or(start);
                    self.length.store(orphaned_to, Ordering::Release);
                    warn!(
                        blob_id = self.blob_id,
                        start,
                        orphaned_to,
                        "Blob append failed: {}",
                        e
                    );
                    return Err(e);
                }
            }
        };
        file.sync_data()?;

        let end = start + written;
        self.length.store(end, Ordering::Release);
        metadata.advance_integrity_position(self.blob_id, end)?;
        self.integrity.fetch_max(end, Ordering::AcqRel);

        debug!(blob_id = self.blob_id, start, end, "Appended entry");
        Ok(Some(BlobRange {
            blob_id: self.blob_id,
            start,
            end,
        }))
    }

    /// Check a recorded range against the blob's integrity position and
    /// physical length
    pub fn check_range(&self, range: &BlobRange) -> Result<()> {
        let integrity = self.integrity_position();
        let physical = std::fs::metadata(&self.path)?.len();
        if range.start > range.end || range.end > integrity || integrity > physical {
            return Err(StorageError::corruption(
                self.blob_id,
                range.start,
                format!(
                    "range {}..{} not covered (integrity {}, length {})",
                    range.start, range.end, integrity, physical
                ),
            ));
        }
        Ok(())
    }

    /// Open a verifying content stream for the entry at `range`
    pub fn open_entry(
        &self,
        range: &BlobRange,
    ) -> Result<(EntryLayout, EntryReader<BufReader<File>>)> {
        self.check_range(range)?;
        let (layout, reader) = pack::open_entry(&self.path, range.start, self.blob_id)?;
        if layout.end != range.end {
            return Err(StorageError::corruption(
                self.blob_id,
                range.start,
                format!("entry ends at {}, metadata says {}", layout.end, range.end),
            ));
        }
        Ok((layout, reader))
    }
}
