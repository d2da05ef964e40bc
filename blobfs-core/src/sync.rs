//! Replication engine.
//!
//! Pull-based: each node pulls the folders it is configured to replicate from
//! their source nodes. A pull for one (folder, source) pair lists the changes
//! the source stored after the pair's watermark, fetches and applies them in
//! storage order, and moves the watermark past what was applied.
//!
//! Schema exchange runs alongside so every node learns, weakly, who pulls
//! what from whom.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::files::{FileManager, ReplicatedVersion, WriteOrigin};
use crate::metadata::MetadataRepository;
use crate::model::{ReplicationFolderSetting, StorageNode, normalize_folder_url, timestamp_now};
use crate::registry::ensure_folder;
use crate::repl_log::{ReplicationLog, ReplicationLogEntry, SkippedVersion};
use crate::replication::{
    CAPABILITIES, ChangesRequest, Compression, NodeInfo, PROTOCOL_VERSION, PeerAddress, Relation,
    RelationEntry, RelationKey, ReplicationChange, ReplicationFile, ReplicationFileMetadata,
    ReplicationSchema, ReplicationTransport, content_sha256, group_entries, merge_weak,
};

/// A folder this node pulls, as declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullConfig {
    pub folder: String,
    pub source_name: String,
    /// Expected identity of the source; a peer answering with another id is
    /// rejected
    pub source_id: Uuid,
    pub source_url: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub soft_delete: bool,
}

fn default_true() -> bool {
    true
}

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Pull interval for reachable peers
    pub fine_interval: StdDuration,
    /// Schema exchange interval; unreachable peers are only pulled this often
    pub coarse_interval: StdDuration,
    /// A peer without a successful contact for this long is unreachable
    pub unreachable_after: chrono::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            fine_interval: StdDuration::from_secs(60),
            coarse_interval: StdDuration::from_secs(30 * 60),
            unreachable_after: chrono::Duration::days(30),
        }
    }
}

/// Outcome of one pull batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    pub folder_url: String,
    pub source_id: Uuid,
    pub from_watermark: DateTime<Utc>,
    pub to_watermark: DateTime<Utc>,
    pub applied: u64,
    pub present: u64,
    pub deleted: u64,
    pub skipped: Vec<SkippedVersion>,
    pub bytes_transferred: u64,
    pub cancelled: bool,
}

pub struct ReplicationEngine {
    files: Arc<FileManager>,
    metadata: Arc<dyn MetadataRepository>,
    transport: Arc<dyn ReplicationTransport>,
    log: Option<ReplicationLog>,
    settings: SchedulerSettings,
}

impl ReplicationEngine {
    pub fn new(
        files: Arc<FileManager>,
        transport: Arc<dyn ReplicationTransport>,
        log: Option<ReplicationLog>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            metadata: files.metadata().clone(),
            files,
            transport,
            log,
            settings,
        }
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn node_info(&self) -> Result<NodeInfo> {
        let local = self.metadata.local_node()?;
        Ok(NodeInfo {
            node_id: local.unique_id,
            node_name: local.name,
            protocol_version: PROTOCOL_VERSION,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Record the local node's public URL so it travels with the schema
    pub fn set_public_url(&self, url: Option<String>) -> Result<()> {
        let mut local = self.metadata.local_node()?;
        if local.url != url {
            local.url = url;
            self.metadata.update_node(&local)?;
        }
        Ok(())
    }

    /// Known node by unique id, registered or refreshed with the given name
    /// and URL
    fn ensure_node(&self, unique_id: Uuid, name: &str, url: Option<&str>) -> Result<StorageNode> {
        match self.metadata.node_by_unique_id(&unique_id)? {
            Some(mut node) => {
                let url_changed = url.is_some_and(|u| node.url.as_deref() != Some(u));
                if node.name != name || url_changed {
                    node.name = name.to_string();
                    if let Some(u) = url {
                        node.url = Some(u.to_string());
                    }
                    self.metadata.update_node(&node)?;
                }
                Ok(node)
            }
            None => {
                let mut node = StorageNode::new(unique_id, name, url.map(str::to_string));
                node.id = self.metadata.insert_node(&node)?;
                debug!(node = %unique_id, "Registered storage node {}", name);
                Ok(node)
            }
        }
    }

    /// Known node by unique id; names heard through gossip never overwrite
    /// what the node reported about itself
    fn known_node(&self, unique_id: Uuid, name: &str) -> Result<StorageNode> {
        match self.metadata.node_by_unique_id(&unique_id)? {
            Some(node) => Ok(node),
            None => self.ensure_node(unique_id, name, None),
        }
    }

    fn mark_attempt(&self, node_id: &Uuid, success: bool) -> Result<()> {
        if let Some(mut node) = self.metadata.node_by_unique_id(node_id)? {
            let now = timestamp_now();
            node.last_attempt = Some(now);
            if success {
                node.last_contact = Some(now);
            }
            self.metadata.update_node(&node)?;
        }
        Ok(())
    }

    /// Write the configured pulls as this node's own settings.
    ///
    /// Existing settings keep their watermark. Own settings no longer
    /// configured stop being pulled but keep their watermark should they come
    /// back.
    pub fn configure(&self, pulls: &[PullConfig]) -> Result<Vec<ReplicationFolderSetting>> {
        let local = self.metadata.local_node()?;
        let mut configured = Vec::new();
        for pull in pulls {
            if pull.source_id == local.unique_id {
                return Err(StorageError::Config(format!(
                    "Folder {} is configured to replicate from this node itself",
                    pull.folder
                )));
            }
            let source = self.ensure_node(pull.source_id, &pull.source_name, Some(&pull.source_url))?;
            let folder = ensure_folder(self.metadata.as_ref(), &pull.folder)?;
            let setting = match self
                .metadata
                .find_replication_setting(folder.id, source.id, local.id)?
            {
                Some(mut setting) => {
                    setting.recursive = pull.recursive;
                    setting.soft_delete = pull.soft_delete;
                    setting.is_own = true;
                    self.metadata.update_replication_setting(&setting)?;
                    setting
                }
                None => {
                    let mut setting = ReplicationFolderSetting {
                        id: 0,
                        folder_id: folder.id,
                        source_node_id: source.id,
                        target_node_id: local.id,
                        recursive: pull.recursive,
                        soft_delete: pull.soft_delete,
                        last_sync_time: DateTime::<Utc>::default(),
                        is_own: true,
                    };
                    setting.id = self.metadata.insert_replication_setting(&setting)?;
                    info!(folder = %folder.url, source = %source.name, "Configured replication");
                    setting
                }
            };
            configured.push(setting.id);
        }

        let mut own = Vec::new();
        for mut setting in self.metadata.replication_settings(Some(true))? {
            if configured.contains(&setting.id) {
                own.push(setting);
            } else {
                setting.is_own = false;
                self.metadata.update_replication_setting(&setting)?;
                info!(setting = setting.id, "Replication setting removed from configuration");
            }
        }
        Ok(own)
    }

    fn relation_entry(
        &self,
        setting: &ReplicationFolderSetting,
        nodes: &HashMap<i64, StorageNode>,
    ) -> Result<Option<RelationEntry>> {
        let (Some(folder), Some(source), Some(puller)) = (
            self.metadata.folder(setting.folder_id)?,
            nodes.get(&setting.source_node_id),
            nodes.get(&setting.target_node_id),
        ) else {
            return Ok(None);
        };
        Ok(Some(RelationEntry {
            key: RelationKey {
                puller: puller.unique_id,
                source: source.unique_id,
                folder_url: folder.url,
            },
            puller_name: puller.name.clone(),
            source_name: source.name.clone(),
            relation: Relation::PullsFrom,
            recursive: setting.recursive,
            soft_delete: setting.soft_delete,
        }))
    }

    /// This node's view of the topology: own pulls strong, learned ones weak
    pub fn local_schema(&self) -> Result<ReplicationSchema> {
        let local = self.metadata.local_node()?;
        let nodes: HashMap<i64, StorageNode> = self
            .metadata
            .nodes()?
            .into_iter()
            .map(|n| (n.id, n))
            .collect();
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        for setting in self.metadata.replication_settings(None)? {
            let Some(entry) = self.relation_entry(&setting, &nodes)? else {
                continue;
            };
            if setting.target_node_id == local.id {
                if setting.is_own {
                    strong.push(entry);
                }
            } else {
                weak.push(entry);
            }
        }
        let mut schema = ReplicationSchema::new(local.unique_id, local.name, local.url);
        schema.strong_items = group_entries(strong);
        schema.weak_items = group_entries(weak);
        Ok(schema)
    }

    fn store_weak(&self, entries: Vec<RelationEntry>) -> Result<()> {
        for entry in entries {
            let puller = self.known_node(entry.key.puller, &entry.puller_name)?;
            let source = self.known_node(entry.key.source, &entry.source_name)?;
            let folder = ensure_folder(self.metadata.as_ref(), &entry.key.folder_url)?;
            match self
                .metadata
                .find_replication_setting(folder.id, source.id, puller.id)?
            {
                Some(setting) if setting.is_own => {}
                Some(mut setting) => {
                    if setting.recursive != entry.recursive || setting.soft_delete != entry.soft_delete {
                        setting.recursive = entry.recursive;
                        setting.soft_delete = entry.soft_delete;
                        self.metadata.update_replication_setting(&setting)?;
                    }
                }
                None => {
                    let setting = ReplicationFolderSetting {
                        id: 0,
                        folder_id: folder.id,
                        source_node_id: source.id,
                        target_node_id: puller.id,
                        recursive: entry.recursive,
                        soft_delete: entry.soft_delete,
                        last_sync_time: DateTime::<Utc>::default(),
                        is_own: false,
                    };
                    self.metadata.insert_replication_setting(&setting)?;
                    debug!(
                        folder = %folder.url,
                        puller = %puller.name,
                        source = %source.name,
                        "Learned replication relationship"
                    );
                }
            }
        }
        Ok(())
    }

    fn merge_incoming(&self, incoming: &ReplicationSchema) -> Result<()> {
        let local = self.local_schema()?;
        let weak = merge_weak(&local, incoming);
        let entries = ReplicationSchema {
            weak_items: weak,
            ..local
        }
        .weak_entries();
        self.store_weak(entries)
    }

    /// Remote side of a schema exchange: remember the caller, merge what it
    /// knows, answer with our schema
    pub fn accept_schema(&self, incoming: &ReplicationSchema) -> Result<ReplicationSchema> {
        let local = self.metadata.local_node()?;
        if incoming.node_id == local.unique_id {
            return Err(StorageError::Config(format!(
                "Schema exchange from a node claiming this node's id {}",
                local.unique_id
            )));
        }
        self.ensure_node(incoming.node_id, &incoming.node_name, incoming.url.as_deref())?;
        self.mark_attempt(&incoming.node_id, true)?;
        self.merge_incoming(incoming)?;
        self.local_schema()
    }

    /// Local side of a schema exchange with one peer
    pub async fn exchange_with(&self, peer: &PeerAddress) -> Result<ReplicationSchema> {
        let schema = self.local_schema()?;
        let remote = match self.transport.exchange_schema(peer, &schema).await {
            Ok(remote) => remote,
            Err(e) => {
                self.mark_attempt(&peer.node_id, false)?;
                return Err(e);
            }
        };
        if remote.node_id != peer.node_id {
            self.mark_attempt(&peer.node_id, false)?;
            return Err(StorageError::Config(format!(
                "Peer at {} reports node id {}, expected {}",
                peer.url, remote.node_id, peer.node_id
            )));
        }
        self.merge_incoming(&remote)?;
        self.mark_attempt(&peer.node_id, true)?;
        info!(peer = %peer.name, "Exchanged replication schema");
        Ok(remote)
    }

    /// Exchange schemas with every known peer that has a URL
    pub async fn exchange_all(&self) -> Result<usize> {
        let local = self.metadata.local_node()?;
        let mut exchanged = 0;
        for node in self.metadata.nodes()? {
            if node.id == local.id {
                continue;
            }
            let Some(url) = node.url.clone() else {
                continue;
            };
            let peer = PeerAddress {
                node_id: node.unique_id,
                name: node.name.clone(),
                url,
            };
            match self.exchange_with(&peer).await {
                Ok(_) => exchanged += 1,
                Err(e) => warn!(peer = %peer.name, error = %e, "Schema exchange failed"),
            }
        }
        Ok(exchanged)
    }

    /// Remote side of a change listing
    pub fn list_changes(&self, request: &ChangesRequest) -> Result<Vec<ReplicationChange>> {
        let url = normalize_folder_url(&request.folder_url)?;
        let folders = if request.recursive {
            self.metadata.folders_under(&url)?
        } else {
            self.metadata.folder_by_url(&url)?.into_iter().collect()
        };
        if folders.is_empty() {
            return Ok(Vec::new());
        }
        let urls: HashMap<i64, String> = folders.iter().map(|f| (f.id, f.url.clone())).collect();
        let ids: Vec<i64> = folders.iter().map(|f| f.id).collect();

        let listed = self
            .metadata
            .changes_since(&ids, request.since, Some(&request.requester))?;
        let mut changes: Vec<ReplicationChange> = Vec::new();
        for version in listed.versions {
            let Some(folder_url) = urls.get(&version.folder_id) else {
                continue;
            };
            changes.push(ReplicationChange::Version {
                file_id: version.file_id,
                version_id: version.unique_id,
                folder_url: folder_url.clone(),
                time_stored: version.time_stored,
            });
        }
        for file in listed.deletions {
            let Some(folder_url) = urls.get(&file.folder_id) else {
                continue;
            };
            changes.push(ReplicationChange::Deletion {
                file_id: file.unique_id,
                folder_url: folder_url.clone(),
                time_deleted: file.time_modified,
            });
        }
        // Stable: versions of one instant stay ahead of deletions of it
        changes.sort_by_key(|c| c.cursor());
        Ok(changes)
    }

    /// Remote side of a file fetch
    pub fn fetch_file(&self, folder_url: &str, file_id: Uuid, version_id: Uuid) -> Result<ReplicationFile> {
        let not_found = || StorageError::NotFound(format!("version {} of file {}", version_id, file_id));
        let version = self.metadata.version(&version_id)?.ok_or_else(not_found)?;
        if version.file_id != file_id {
            return Err(not_found());
        }
        let folder = self.metadata.folder(version.folder_id)?.ok_or_else(not_found)?;
        if folder.url != normalize_folder_url(folder_url)? {
            return Err(not_found());
        }
        let content = self.files.read_version(&version)?.into_bytes()?;
        let local = self.metadata.local_node()?;
        Ok(ReplicationFile {
            metadata: ReplicationFileMetadata {
                source_node_id: local.unique_id,
                file_id,
                version_id,
                folder_url: folder.url,
                name: version.name,
                size: version.size,
                time_created: version.time_created,
                created_storage_id: version.created_storage_id,
                modified_by: version.modified_by,
                sha256: content_sha256(&content),
                compression: Compression::None,
            },
            content,
        })
    }

    async fn apply_version(&self, file: ReplicationFile) -> Result<()> {
        let files = self.files.clone();
        let meta = file.metadata;
        let content = file.content;
        tokio::task::spawn_blocking(move || {
            let origin = WriteOrigin::Replicated(ReplicatedVersion {
                file_id: meta.file_id,
                version_id: meta.version_id,
                time_created: meta.time_created,
                created_storage_id: meta.created_storage_id,
                modified_by: meta.modified_by,
            });
            files.write_file(
                &meta.folder_url,
                &meta.name,
                &mut content.as_slice(),
                content.len() as u64,
                origin,
            )
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    fn apply_deletion(&self, file_id: &Uuid, time_deleted: DateTime<Utc>) -> Result<bool> {
        let Some(file) = self.metadata.file(file_id)? else {
            return Ok(false);
        };
        if file.deleted {
            return Ok(false);
        }
        // A version written after the deletion wins over it
        if let Some(current) = self.metadata.version(&file.current_version_id)? {
            if current.time_created > time_deleted {
                debug!(file_id = %file_id, "Ignoring deletion older than current version");
                return Ok(false);
            }
        }
        Ok(self.files.delete_file(&file)?.is_some())
    }

    /// Pull one (folder, source) pair.
    ///
    /// Changes are applied in the source's storage order. A transport failure
    /// stops the batch; the watermark then covers only what was applied
    /// before it. Versions the source cannot serve or whose content fails
    /// verification are skipped and logged. Cancellation is checked between
    /// changes.
    pub async fn pull_pair(
        &self,
        setting: &ReplicationFolderSetting,
        cancel: &watch::Receiver<bool>,
    ) -> Result<PullReport> {
        let started = Instant::now();
        let folder = self
            .metadata
            .folder(setting.folder_id)?
            .ok_or_else(|| StorageError::NotFound(format!("folder {}", setting.folder_id)))?;
        let source = self
            .metadata
            .node(setting.source_node_id)?
            .ok_or_else(|| StorageError::NotFound(format!("node {}", setting.source_node_id)))?;
        let url = source.url.clone().ok_or_else(|| {
            StorageError::Config(format!("Source node {} has no URL", source.name))
        })?;
        let peer = PeerAddress {
            node_id: source.unique_id,
            name: source.name.clone(),
            url,
        };
        let local = self.metadata.local_node()?;

        let mut report = PullReport {
            folder_url: folder.url.clone(),
            source_id: source.unique_id,
            from_watermark: setting.last_sync_time,
            to_watermark: setting.last_sync_time,
            ..Default::default()
        };

        let request = ChangesRequest {
            requester: local.unique_id,
            folder_url: folder.url.clone(),
            since: setting.last_sync_time,
            recursive: setting.recursive,
        };
        let changes = match self.transport.get_replication_files(&peer, &request).await {
            Ok(changes) => changes,
            Err(e) => {
                self.mark_attempt(&peer.node_id, false)?;
                self.finish(setting, &source, &report, started, Some(&e));
                return Err(e);
            }
        };
        self.mark_attempt(&peer.node_id, true)?;
        debug!(folder = %folder.url, source = %source.name, changes = changes.len(), "Listed changes");

        // Highest cursor fully processed, and the cursor of the change being
        // worked on; the watermark may only move to instants strictly before
        // an unfinished change
        let mut done: Option<DateTime<Utc>> = None;
        let mut stopped_at: Option<DateTime<Utc>> = None;
        let mut failure: Option<StorageError> = None;

        for change in changes {
            if *cancel.borrow() {
                report.cancelled = true;
                stopped_at = Some(change.cursor());
                break;
            }
            match &change {
                ReplicationChange::Version {
                    file_id,
                    version_id,
                    folder_url,
                    ..
                } => {
                    let present = match self.metadata.version(version_id) {
                        Ok(found) => found.is_some(),
                        Err(e) => {
                            stopped_at = Some(change.cursor());
                            failure = Some(e);
                            break;
                        }
                    };
                    if present {
                        report.present += 1;
                    } else {
                        match self
                            .transport
                            .get_replication_file(&peer, folder_url, *file_id, *version_id)
                            .await
                        {
                            Ok(file) => {
                                report.bytes_transferred += file.content.len() as u64;
                                if let Err(e) = file.verify() {
                                    error!(
                                        file_id = %file_id,
                                        version_id = %version_id,
                                        source = %source.name,
                                        error = %e,
                                        "Skipping corrupt replicated file"
                                    );
                                    report.skipped.push(SkippedVersion {
                                        file_id: *file_id,
                                        version_id: *version_id,
                                        reason: e.to_string(),
                                    });
                                } else if let Err(e) = self.apply_version(file).await {
                                    stopped_at = Some(change.cursor());
                                    failure = Some(e);
                                    break;
                                } else {
                                    report.applied += 1;
                                }
                            }
                            Err(e) if e.is_retryable() => {
                                stopped_at = Some(change.cursor());
                                failure = Some(e);
                                break;
                            }
                            Err(e) => {
                                error!(
                                    file_id = %file_id,
                                    version_id = %version_id,
                                    source = %source.name,
                                    error = %e,
                                    "Source could not serve version"
                                );
                                report.skipped.push(SkippedVersion {
                                    file_id: *file_id,
                                    version_id: *version_id,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
                ReplicationChange::Deletion {
                    file_id,
                    time_deleted,
                    ..
                } => {
                    if setting.soft_delete {
                        match self.apply_deletion(file_id, *time_deleted) {
                            Ok(true) => report.deleted += 1,
                            Ok(false) => {}
                            Err(e) => {
                                stopped_at = Some(change.cursor());
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                }
            }
            done = Some(done.map_or(change.cursor(), |d| d.max(change.cursor())));
        }

        let candidate = match (done, stopped_at) {
            (Some(d), Some(stop)) if d >= stop => {
                // Back off to just before the unfinished instant
                Some(stop - chrono::Duration::microseconds(1))
            }
            (d, _) => d,
        };
        if let Some(candidate) = candidate {
            report.to_watermark = report.from_watermark.max(candidate);
        }
        if report.to_watermark > setting.last_sync_time {
            let mut updated = setting.clone();
            updated.last_sync_time = report.to_watermark;
            if let Err(e) = self.metadata.update_replication_setting(&updated) {
                report.to_watermark = setting.last_sync_time;
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        self.finish(setting, &source, &report, started, failure.as_ref());
        match failure {
            Some(e) => Err(e),
            None => {
                info!(
                    folder = %folder.url,
                    source = %source.name,
                    applied = report.applied,
                    present = report.present,
                    deleted = report.deleted,
                    skipped = report.skipped.len(),
                    "Pull complete"
                );
                Ok(report)
            }
        }
    }

    fn finish(
        &self,
        setting: &ReplicationFolderSetting,
        source: &StorageNode,
        report: &PullReport,
        started: Instant,
        failure: Option<&StorageError>,
    ) {
        if let Some(e) = failure {
            warn!(
                setting = setting.id,
                source = %source.name,
                error = %e,
                "Pull stopped; watermark kept at {}",
                report.to_watermark
            );
        }
        let Some(log) = &self.log else {
            return;
        };
        let entry = ReplicationLogEntry {
            timestamp: Utc::now(),
            folder_url: report.folder_url.clone(),
            source_id: source.unique_id,
            source_name: source.name.clone(),
            from_watermark: report.from_watermark,
            to_watermark: report.to_watermark,
            applied: report.applied,
            present: report.present,
            deleted: report.deleted,
            skipped: report.skipped.clone(),
            bytes_transferred: report.bytes_transferred,
            duration_ms: started.elapsed().as_millis() as u64,
            success: failure.is_none(),
            error: failure.map(|e| e.to_string()),
        };
        if let Err(e) = log.append(&entry) {
            warn!(error = %e, "Failed to write replication log entry");
        }
    }

    /// A peer that was tried but not reached within `unreachable_after`
    pub fn is_unreachable(&self, node: &StorageNode, now: DateTime<Utc>) -> bool {
        if node.last_attempt.is_none() {
            return false;
        }
        let reference = node.last_contact.unwrap_or(node.time_registered);
        now - reference > self.settings.unreachable_after
    }

    /// Pull every own (folder, source) pair concurrently. Unreachable peers
    /// are only included when `include_unreachable` is set.
    pub async fn run_cycle(
        self: &Arc<Self>,
        cancel: &watch::Receiver<bool>,
        include_unreachable: bool,
    ) -> Result<Vec<Result<PullReport>>> {
        let local = self.metadata.local_node()?;
        let now = timestamp_now();
        let mut tasks = JoinSet::new();
        for setting in self.metadata.replication_settings(Some(true))? {
            if setting.target_node_id != local.id {
                continue;
            }
            let Some(source) = self.metadata.node(setting.source_node_id)? else {
                continue;
            };
            if !include_unreachable && self.is_unreachable(&source, now) {
                debug!(source = %source.name, "Skipping unreachable peer until the coarse interval");
                continue;
            }
            let engine = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { engine.pull_pair(&setting, &cancel).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(error = %e, "Replication task failed");
                    results.push(Err(StorageError::Io(std::io::Error::other(e))));
                }
            }
        }
        Ok(results)
    }

    /// Scheduler loop: pulls at the fine interval, schema exchange plus a
    /// pull including unreachable peers at the coarse interval. Returns when
    /// `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut fine = tokio::time::interval(self.settings.fine_interval);
        let mut coarse = tokio::time::interval(self.settings.coarse_interval);
        fine.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        coarse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            fine_secs = self.settings.fine_interval.as_secs(),
            coarse_secs = self.settings.coarse_interval.as_secs(),
            "Replication scheduler started"
        );

        loop {
            let include_unreachable = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = coarse.tick() => {
                    if let Err(e) = self.exchange_all().await {
                        warn!(error = %e, "Schema exchange round failed");
                    }
                    true
                }
                _ = fine.tick() => false,
            };
            match self.run_cycle(&shutdown, include_unreachable).await {
                Ok(results) => {
                    let failed = results.iter().filter(|r| r.is_err()).count();
                    if failed > 0 {
                        warn!(failed, total = results.len(), "Replication cycle had failures");
                    }
                }
                Err(e) => warn!(error = %e, "Replication cycle failed"),
            }
        }
        info!("Replication scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::registry::{ContainerConfig, ContainerRegistry};
    use crate::sqlite_store::SqliteMetadataStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Transport for tests that never reach a peer
    struct Offline;

    #[async_trait]
    impl ReplicationTransport for Offline {
        async fn exchange_schema(&self, _: &PeerAddress, _: &ReplicationSchema) -> Result<ReplicationSchema> {
            Err(StorageError::Transport("offline".into()))
        }
        async fn get_replication_files(&self, _: &PeerAddress, _: &ChangesRequest) -> Result<Vec<ReplicationChange>> {
            Err(StorageError::Transport("offline".into()))
        }
        async fn get_replication_file(&self, _: &PeerAddress, _: &str, _: Uuid, _: Uuid) -> Result<ReplicationFile> {
            Err(StorageError::Transport("offline".into()))
        }
    }

    /// Transport whose source lists a fixed set of changes
    #[derive(Default)]
    struct Listing(std::sync::Mutex<Vec<ReplicationChange>>);

    #[async_trait]
    impl ReplicationTransport for Listing {
        async fn exchange_schema(&self, _: &PeerAddress, _: &ReplicationSchema) -> Result<ReplicationSchema> {
            Err(StorageError::Transport("offline".into()))
        }
        async fn get_replication_files(&self, _: &PeerAddress, _: &ChangesRequest) -> Result<Vec<ReplicationChange>> {
            Ok(self.0.lock().unwrap().clone())
        }
        async fn get_replication_file(&self, _: &PeerAddress, _: &str, _: Uuid, _: Uuid) -> Result<ReplicationFile> {
            Err(StorageError::Transport("offline".into()))
        }
    }

    fn engine(dir: &TempDir, name: &str) -> ReplicationEngine {
        engine_with(dir, name, Arc::new(Offline)).0
    }

    fn engine_with(
        dir: &TempDir,
        name: &str,
        transport: Arc<dyn ReplicationTransport>,
    ) -> (ReplicationEngine, Arc<SqliteMetadataStore>) {
        let store = Arc::new(SqliteMetadataStore::open_in_memory(10, name).unwrap());
        let registry = Arc::new(ContainerRegistry::new(store.clone(), LifecycleSettings::default()));
        registry
            .reconcile(&[ContainerConfig {
                name: "main".into(),
                path: dir.path().join(name).to_string_lossy().into_owned(),
                folder: "/".into(),
            }])
            .unwrap();
        let files = Arc::new(FileManager::new(registry).unwrap());
        let engine = ReplicationEngine::new(
            files,
            transport,
            Some(ReplicationLog::new(dir.path())),
            SchedulerSettings::default(),
        );
        (engine, store)
    }

    fn pull(folder: &str, source: Uuid) -> PullConfig {
        PullConfig {
            folder: folder.into(),
            source_name: "src".into(),
            source_id: source,
            source_url: "http://src:8080".into(),
            recursive: true,
            soft_delete: false,
        }
    }

    #[test]
    fn test_configure_is_idempotent_and_keeps_watermark() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "b");
        let source = Uuid::new_v4();
        let settings = engine.configure(&[pull("/docs", source)]).unwrap();
        assert_eq!(settings.len(), 1);

        let mut s = settings[0].clone();
        s.last_sync_time = timestamp_now();
        engine.metadata.update_replication_setting(&s).unwrap();

        let again = engine.configure(&[pull("/docs", source)]).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, s.id);
        assert_eq!(again[0].last_sync_time, s.last_sync_time);
    }

    #[test]
    fn test_configure_rejects_self() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "b");
        let me = engine.metadata.local_node().unwrap().unique_id;
        assert!(matches!(
            engine.configure(&[pull("/docs", me)]),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_unconfigured_pull_is_demoted() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "b");
        let source = Uuid::new_v4();
        engine
            .configure(&[pull("/docs", source), pull("/media", source)])
            .unwrap();
        let own = engine.configure(&[pull("/docs", source)]).unwrap();
        assert_eq!(own.len(), 1);
        let schema = engine.local_schema().unwrap();
        assert_eq!(schema.strong_entries().len(), 1);
        // Demoted own settings are not gossiped as weak claims about ourselves
        assert!(schema.weak_items.is_empty());
    }

    #[test]
    fn test_local_schema_groups_by_source() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "b");
        let source = Uuid::new_v4();
        engine
            .configure(&[pull("/docs", source), pull("/media", source)])
            .unwrap();
        let schema = engine.local_schema().unwrap();
        assert_eq!(schema.strong_items.len(), 1);
        assert_eq!(schema.strong_items[0].peer_id, source);
        assert_eq!(schema.strong_items[0].folders.len(), 2);
    }

    #[test]
    fn test_accept_schema_learns_weak_and_answers() {
        let dir = TempDir::new().unwrap();
        let a = engine(&dir, "a");
        let b = engine(&dir, "b");
        let a_id = a.metadata.local_node().unwrap().unique_id;
        b.configure(&[pull("/docs", a_id)]).unwrap();

        let b_schema = b.local_schema().unwrap();
        let answer = a.accept_schema(&b_schema).unwrap();
        assert_eq!(answer.node_id, a_id);

        // a now weakly knows that b pulls /docs from a
        let key = RelationKey {
            puller: b_schema.node_id,
            source: a_id,
            folder_url: "/docs".into(),
        };
        assert_eq!(answer.knowledge(&key), crate::replication::KnowledgeState::WeaklyKnown);
        let b_node = a.metadata.node_by_unique_id(&b_schema.node_id).unwrap().unwrap();
        assert!(b_node.last_contact.is_some());
    }

    #[test]
    fn test_list_changes_excludes_requester_and_filters_folders() {
        let dir = TempDir::new().unwrap();
        let a = engine(&dir, "a");
        let local = |content: &[u8], folder: &str, name: &str| {
            a.files
                .write_file(
                    folder,
                    name,
                    &mut &content[..],
                    content.len() as u64,
                    WriteOrigin::Local {
                        modified_by: "alice".into(),
                    },
                )
                .unwrap()
        };
        let top = local(b"1", "/docs", "a.txt");
        let nested = local(b"2", "/docs/sub", "b.txt");
        local(b"3", "/media", "c.txt");
        let requester = Uuid::new_v4();
        let foreign = a
            .files
            .write_file(
                "/docs",
                "d.txt",
                &mut &b"4"[..],
                1,
                WriteOrigin::Replicated(ReplicatedVersion {
                    file_id: Uuid::new_v4(),
                    version_id: Uuid::new_v4(),
                    time_created: timestamp_now(),
                    created_storage_id: requester,
                    modified_by: "bob".into(),
                }),
            )
            .unwrap();

        let request = |recursive| ChangesRequest {
            requester,
            folder_url: "/docs".into(),
            since: DateTime::<Utc>::default(),
            recursive,
        };
        let ids = |changes: Vec<ReplicationChange>| -> Vec<Uuid> {
            changes
                .into_iter()
                .filter_map(|c| match c {
                    ReplicationChange::Version { version_id, .. } => Some(version_id),
                    _ => None,
                })
                .collect()
        };
        let flat = ids(a.list_changes(&request(false)).unwrap());
        assert_eq!(flat, vec![top.unique_id]);
        let deep = ids(a.list_changes(&request(true)).unwrap());
        assert_eq!(deep, vec![top.unique_id, nested.unique_id]);
        assert!(!deep.contains(&foreign.unique_id));

        let since_top = ChangesRequest {
            since: top.time_stored,
            ..request(true)
        };
        assert_eq!(ids(a.list_changes(&since_top).unwrap()), vec![nested.unique_id]);
    }

    #[test]
    fn test_fetch_file_checks_folder() {
        let dir = TempDir::new().unwrap();
        let a = engine(&dir, "a");
        let v = a
            .files
            .write_file(
                "/docs",
                "a.txt",
                &mut &b"hello"[..],
                5,
                WriteOrigin::Local {
                    modified_by: "alice".into(),
                },
            )
            .unwrap();
        let file = a.fetch_file("/docs", v.file_id, v.unique_id).unwrap();
        assert_eq!(file.content, b"hello");
        assert!(file.verify().is_ok());
        assert!(matches!(
            a.fetch_file("/media", v.file_id, v.unique_id),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            a.fetch_file("/docs", Uuid::new_v4(), v.unique_id),
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_watermark_and_logs() {
        let dir = TempDir::new().unwrap();
        let b = engine(&dir, "b");
        let settings = b.configure(&[pull("/docs", Uuid::new_v4())]).unwrap();
        let (_tx, rx) = watch::channel(false);
        let result = b.pull_pair(&settings[0], &rx).await;
        assert!(matches!(result, Err(StorageError::Transport(_))));

        let stored = b.metadata.replication_settings(Some(true)).unwrap();
        assert_eq!(stored[0].last_sync_time, DateTime::<Utc>::default());
        let entry = b.log.as_ref().unwrap().latest().unwrap().unwrap();
        assert!(!entry.success);
        let source = b.metadata.node(settings[0].source_node_id).unwrap().unwrap();
        assert!(source.last_attempt.is_some());
        assert!(source.last_contact.is_none());
    }

    #[tokio::test]
    async fn test_failed_deletion_records_progress_and_logs() {
        let dir = TempDir::new().unwrap();
        let listing = Arc::new(Listing::default());
        let (b, store) = engine_with(&dir, "b", listing.clone());
        let local = || WriteOrigin::Local {
            modified_by: "bob".into(),
        };
        let gone = b
            .files
            .write_file("/docs", "gone.txt", &mut &b"x"[..], 1, local())
            .unwrap();
        let locked = b
            .files
            .write_file("/docs", "locked.txt", &mut &b"y"[..], 1, local())
            .unwrap();
        store.refuse_file_updates("locked.txt");

        let t0 = timestamp_now() + chrono::Duration::minutes(1);
        let t1 = t0 + chrono::Duration::minutes(1);
        *listing.0.lock().unwrap() = vec![
            ReplicationChange::Deletion {
                file_id: gone.file_id,
                folder_url: "/docs".into(),
                time_deleted: t0,
            },
            ReplicationChange::Deletion {
                file_id: locked.file_id,
                folder_url: "/docs".into(),
                time_deleted: t1,
            },
        ];

        let mut config = pull("/docs", Uuid::new_v4());
        config.soft_delete = true;
        let settings = b.configure(&[config]).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(b.pull_pair(&settings[0], &rx).await.is_err());

        // The first deletion counts; the watermark stops before the second
        assert!(b.files.file_by_id(&gone.file_id).unwrap().is_none());
        assert!(b.files.file_by_id(&locked.file_id).unwrap().is_some());
        let stored = b.metadata.replication_settings(Some(true)).unwrap();
        assert_eq!(stored[0].last_sync_time, t0);

        let entry = b.log.as_ref().unwrap().latest().unwrap().unwrap();
        assert!(!entry.success);
        assert_eq!(entry.deleted, 1);
        assert_eq!(entry.to_watermark, t0);
    }

    #[test]
    fn test_unreachable_classification() {
        let dir = TempDir::new().unwrap();
        let b = engine(&dir, "b");
        let now = timestamp_now();
        let mut node = StorageNode::new(Uuid::new_v4(), "peer", Some("http://peer".into()));
        assert!(!b.is_unreachable(&node, now));
        node.last_attempt = Some(now);
        node.time_registered = now - chrono::Duration::days(31);
        assert!(b.is_unreachable(&node, now));
        node.last_contact = Some(now - chrono::Duration::days(1));
        assert!(!b.is_unreachable(&node, now));
    }
}
