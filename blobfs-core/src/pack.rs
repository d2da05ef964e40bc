//! Blob pack format
//!
//! Byte layout of one stored file inside a blob:
//!
//! ```text
//! [ marker "BFSH" : 4 ][ header version u32 LE : 4 ]
//! [ header length u32 LE : 4 ][ header JSON : header length ]
//! [ content length u64 LE : 8 ][ content : content length ]
//! [ SHA-256(header JSON || content) : 32 ]
//! ```
//!
//! The header repeats the content's absolute start offset and length so an
//! entry can be verified from the blob alone. Reading needs only the blob path
//! and the entry's start offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Marker opening every entry
pub const ENTRY_MARKER: &[u8; 4] = b"BFSH";

/// Current header version
pub const HEADER_VERSION: u32 = 1;

/// Marker + header version + header length
pub const PREFIX_LEN: u64 = 12;

/// Content length field
pub const CONTENT_LEN_FIELD: u64 = 8;

/// Trailing SHA-256
pub const HASH_LEN: u64 = 32;

/// Upper bound on a header; anything larger is treated as garbage
pub const MAX_HEADER_LEN: u32 = 1 << 20;

const COPY_BUF: usize = 64 * 1024;

/// Total on-disk size of an entry
pub fn entry_len(header_len: u64, content_len: u64) -> u64 {
    PREFIX_LEN + header_len + CONTENT_LEN_FIELD + content_len + HASH_LEN
}

/// Engine-facing part of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineHeader {
    /// Absolute offset of the content inside the blob
    pub content_start: u64,
    pub content_length: u64,
}

/// Self-describing entry header (version 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackHeader {
    pub file_name: String,
    pub folder_url: String,
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub time_created: DateTime<Utc>,
    pub modified_by: String,
    pub created_storage_id: Uuid,
    pub engine: EngineHeader,
}

impl PackHeader {
    /// Serialize the header for an entry starting at `entry_start`.
    ///
    /// `content_start` depends on the header's own length, so encoding repeats
    /// until the offset stops changing.
    pub fn encode(&mut self, entry_start: u64, content_length: u64) -> Result<Vec<u8>> {
        self.engine.content_length = content_length;
        for _ in 0..8 {
            let bytes = serde_json::to_vec(self)?;
            let content_start = entry_start + PREFIX_LEN + bytes.len() as u64 + CONTENT_LEN_FIELD;
            if content_start == self.engine.content_start {
                if bytes.len() as u64 > u64::from(MAX_HEADER_LEN) {
                    return Err(StorageError::Serialization(format!(
                        "Pack header of {} bytes exceeds limit",
                        bytes.len()
                    )));
                }
                return Ok(bytes);
            }
            self.engine.content_start = content_start;
        }
        Err(StorageError::Serialization(
            "Pack header length did not converge".into(),
        ))
    }
}

/// Write one entry: prefix, header, content streamed from `content`, hash.
///
/// Exactly `content_length` bytes must come out of `content`; a short or long
/// stream fails the write. Returns the number of bytes written.
pub fn write_entry<W: Write, R: Read + ?Sized>(
    out: &mut W,
    header: &[u8],
    content: &mut R,
    content_length: u64,
) -> Result<u64> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| StorageError::Serialization("pack header too large".into()))?;

    out.write_all(ENTRY_MARKER)?;
    out.write_all(&HEADER_VERSION.to_le_bytes())?;
    out.write_all(&header_len.to_le_bytes())?;
    out.write_all(header)?;
    out.write_all(&content_length.to_le_bytes())?;

    let mut hasher = Sha256::new();
    hasher.update(header);

    let mut buf = vec![0u8; COPY_BUF];
    let mut remaining = content_length;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF as u64) as usize;
        let n = content.read(&mut buf[..want])?;
        if n == 0 {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "content ended {} bytes short of declared length {}",
                    remaining, content_length
                ),
            )));
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    if content.read(&mut buf[..1])? != 0 {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("content longer than declared length {}", content_length),
        )));
    }

    out.write_all(&hasher.finalize())?;
    Ok(entry_len(header.len() as u64, content_length))
}

/// Location and header of one entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryLayout {
    pub start: u64,
    pub header: PackHeader,
    pub header_len: u64,
    pub content_start: u64,
    pub content_length: u64,
    /// Offset just past the trailing hash
    pub end: u64,
}

fn read_array<R: Read, const N: usize>(
    reader: &mut R,
    blob_id: i64,
    offset: u64,
    what: &str,
) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| {
        StorageError::corruption(blob_id, offset, format!("cannot read {}: {}", what, e))
    })?;
    Ok(buf)
}

/// Read and validate the framing of the entry at `start`. Returns the layout
/// and the raw header bytes; `reader` is left positioned at the content.
pub fn read_entry_layout<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    blob_id: i64,
) -> Result<(EntryLayout, Vec<u8>)> {
    reader.seek(SeekFrom::Start(start))?;

    let marker: [u8; 4] = read_array(reader, blob_id, start, "entry marker")?;
    if &marker != ENTRY_MARKER {
        return Err(StorageError::corruption(blob_id, start, "bad entry marker"));
    }
    let version = u32::from_le_bytes(read_array(reader, blob_id, start, "header version")?);
    if version != HEADER_VERSION {
        return Err(StorageError::corruption(
            blob_id,
            start,
            format!("unsupported header version {}", version),
        ));
    }
    let header_len = u32::from_le_bytes(read_array(reader, blob_id, start, "header length")?);
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(StorageError::corruption(
            blob_id,
            start,
            format!("implausible header length {}", header_len),
        ));
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_bytes).map_err(|e| {
        StorageError::corruption(blob_id, start, format!("truncated header: {}", e))
    })?;
    let header: PackHeader = serde_json::from_slice(&header_bytes).map_err(|e| {
        StorageError::corruption(blob_id, start, format!("unparseable header: {}", e))
    })?;

    let content_length =
        u64::from_le_bytes(read_array(reader, blob_id, start, "content length")?);
    let header_len = u64::from(header_len);
    let content_start = start + PREFIX_LEN + header_len + CONTENT_LEN_FIELD;

    if header.engine.content_start != content_start {
        return Err(StorageError::corruption(
            blob_id,
            start,
            format!(
                "header claims content at {}, framing puts it at {}",
                header.engine.content_start, content_start
            ),
        ));
    }
    if header.engine.content_length != content_length {
        return Err(StorageError::corruption(
            blob_id,
            start,
            format!(
                "header claims {} content bytes, framing says {}",
                header.engine.content_length, content_length
            ),
        ));
    }

    let layout = EntryLayout {
        start,
        header,
        header_len,
        content_start,
        content_length,
        end: start + entry_len(header_len, content_length),
    };
    Ok((layout, header_bytes))
}

/// Content stream of one entry that verifies the trailing hash once the last
/// content byte has been read. A mismatch fails the final read with a
/// corruption error.
pub struct EntryReader<R: Read> {
    inner: R,
    hasher: Sha256,
    remaining: u64,
    hash_offset: u64,
    blob_id: i64,
    verified: bool,
}

impl<R: Read> EntryReader<R> {
    /// `inner` must be positioned at the entry's content
    pub fn new(inner: R, layout: &EntryLayout, header_bytes: &[u8], blob_id: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(header_bytes);
        Self {
            inner,
            hasher,
            remaining: layout.content_length,
            hash_offset: layout.content_start + layout.content_length,
            blob_id,
            verified: false,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn verify(&mut self) -> io::Result<()> {
        let mut stored = [0u8; HASH_LEN as usize];
        self.inner.read_exact(&mut stored).map_err(|e| {
            io::Error::from(StorageError::corruption(
                self.blob_id,
                self.hash_offset,
                format!("missing entry hash: {}", e),
            ))
        })?;
        let computed = std::mem::take(&mut self.hasher).finalize();
        if computed.as_slice() != &stored[..] {
            return Err(StorageError::corruption(
                self.blob_id,
                self.hash_offset,
                "entry hash mismatch",
            )
            .into());
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for EntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            if !self.verified {
                self.verify()?;
            }
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(StorageError::corruption(
                self.blob_id,
                self.hash_offset - self.remaining,
                "entry content truncated",
            )
            .into());
        }
        self.hasher.update(&buf[..n]);
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.verify()?;
        }
        Ok(n)
    }
}

/// Open the entry at `start` in the blob at `path` for streaming
pub fn open_entry(
    path: &Path,
    start: u64,
    blob_id: i64,
) -> Result<(EntryLayout, EntryReader<BufReader<File>>)> {
    let mut file = BufReader::new(File::open(path)?);
    let (layout, header_bytes) = read_entry_layout(&mut file, start, blob_id)?;
    let reader = EntryReader::new(file, &layout, &header_bytes, blob_id);
    Ok((layout, reader))
}

/// Read a whole entry's content into memory, verifying its hash
pub fn read_entry(path: &Path, start: u64, blob_id: i64) -> Result<(EntryLayout, Vec<u8>)> {
    let (layout, mut reader) = open_entry(path, start, blob_id)?;
    let mut content = Vec::with_capacity(layout.content_length as usize);
    reader.read_to_end(&mut content)?;
    Ok((layout, content))
}

/// Walk every entry of a blob from offset 0 up to `limit`, verifying each.
/// Fails on the first entry that does not verify or crosses `limit`.
pub fn scan_entries(path: &Path, limit: u64, blob_id: i64) -> Result<Vec<EntryLayout>> {
    let mut file = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut offset = 0u64;
    while offset < limit {
        let (layout, header_bytes) = read_entry_layout(&mut file, offset, blob_id)?;
        if layout.end > limit {
            return Err(StorageError::corruption(
                blob_id,
                offset,
                format!("entry ends at {} past limit {}", layout.end, limit),
            ));
        }
        let mut reader = EntryReader::new(&mut file, &layout, &header_bytes, blob_id);
        io::copy(&mut reader, &mut io::sink())?;
        offset = layout.end;
        entries.push(layout);
    }
    Ok(entries)
}
