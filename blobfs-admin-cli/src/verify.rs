//! Offline blob verification.
//!
//! Walks every entry below each blob's integrity position, checks framing
//! and content hashes, and cross-checks entries against the version rows
//! that point into the blob.

use anyhow::Result;
use blobfs_core::pack::scan_entries;
use blobfs_core::{Blob, Container, MetadataRepository};
use std::fmt;

/// Outcome of a verification run
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub containers: u64,
    pub blobs: u64,
    pub entries: u64,
    pub bytes: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {}", warning)?;
        }
        for error in &self.errors {
            writeln!(f, "  ERROR: {}", error)?;
        }
        writeln!(
            f,
            "Verified {} container(s), {} blob(s), {} entries, {} bytes",
            self.containers, self.blobs, self.entries, self.bytes
        )?;
        writeln!(
            f,
            "{} error(s), {} warning(s): {}",
            self.errors.len(),
            self.warnings.len(),
            if self.ok() { "OK" } else { "FAILED" }
        )
    }
}

/// Verify every container, or only the one named `only`
pub fn verify_containers(metadata: &dyn MetadataRepository, only: Option<&str>) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for container in metadata.containers()? {
        if only.is_some_and(|name| name != container.name) {
            continue;
        }
        report.containers += 1;
        for blob in metadata.blobs_in_container(container.id, true)? {
            verify_blob(metadata, &container, &blob, &mut report)?;
        }
    }
    Ok(report)
}

fn verify_blob(
    metadata: &dyn MetadataRepository,
    container: &Container,
    blob: &Blob,
    report: &mut VerifyReport,
) -> Result<()> {
    report.blobs += 1;
    let path = blob.path_in(container);
    let label = format!("{}/{}", container.name, blob.name);

    let on_disk = match std::fs::metadata(&path) {
        Ok(m) => m.len(),
        Err(e) => {
            report.errors.push(format!("{}: cannot stat {}: {}", label, path.display(), e));
            return Ok(());
        }
    };
    if on_disk < blob.integrity_position {
        report.errors.push(format!(
            "{}: {} bytes on disk, integrity position is {}",
            label, on_disk, blob.integrity_position
        ));
        return Ok(());
    }
    if on_disk > blob.integrity_position {
        report.warnings.push(format!(
            "{}: {} bytes past the integrity position",
            label,
            on_disk - blob.integrity_position
        ));
    }

    let entries = match scan_entries(&path, blob.integrity_position, blob.id) {
        Ok(entries) => entries,
        Err(e) => {
            report.errors.push(format!("{}: {}", label, e));
            return Ok(());
        }
    };

    for entry in entries {
        report.entries += 1;
        report.bytes += entry.content_length;
        let version_id = entry.header.version_id;
        match metadata.version(&version_id)? {
            None => report.warnings.push(format!(
                "{}: entry at {} holds unknown version {}",
                label, entry.start, version_id
            )),
            Some(version) => {
                let range = (version.blob_id, version.blob_start, version.blob_end);
                if range == (Some(blob.id), Some(entry.start), Some(entry.end)) {
                    continue;
                }
                if version.blob_id == Some(blob.id) {
                    report.errors.push(format!(
                        "{}: version {} points at {:?}..{:?}, entry spans {}..{}",
                        label, version_id, version.blob_start, version.blob_end, entry.start, entry.end
                    ));
                } else {
                    // Duplicate copy of a version stored elsewhere
                    report.warnings.push(format!(
                        "{}: entry at {} duplicates version {}",
                        label, entry.start, version_id
                    ));
                }
            }
        }
    }
    Ok(())
}
