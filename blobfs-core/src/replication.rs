//! Replication protocol definitions for blobfs.
//!
//! Wire types for schema gossip, change listing and file transfer, the
//! transport contract the engine pulls through, and the pure functions that
//! merge one node's view of the replication topology into another's.
//!
//! A relationship is "puller P pulls folder F from source S". A node's own
//! pull configuration is strong (authoritative); relationships it heard from
//! peers are weak (advisory, gossiped onwards).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capabilities advertised by `/replication/info`.
pub const CAPABILITIES: &[&str] = &["schema-gossip", "soft-delete", "zstd-transfer", "recursive"];

/// Compression method for file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// Identity a node reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub node_name: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// How the item's node relates to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// `node` pulls the listed folders from `peer`
    PullsFrom,
}

/// One replicated folder inside a schema item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFolder {
    pub url: String,
    pub recursive: bool,
    pub soft_delete: bool,
}

/// Folders grouped under one (node, peer, relation) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaItem {
    /// The pulling node
    pub node_id: Uuid,
    pub node_name: String,
    /// The source node
    pub peer_id: Uuid,
    pub peer_name: String,
    pub relation: Relation,
    pub folders: Vec<SchemaFolder>,
}

/// Everything one node knows about the replication topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSchema {
    pub node_id: Uuid,
    pub node_name: String,
    /// Base URL the node serves replication on, if it has one
    pub url: Option<String>,
    pub strong_items: Vec<SchemaItem>,
    pub weak_items: Vec<SchemaItem>,
}

/// Identifies one relationship independent of how it is grouped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationKey {
    pub puller: Uuid,
    pub source: Uuid,
    pub folder_url: String,
}

/// One flattened relationship with the attributes needed to regroup it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEntry {
    pub key: RelationKey,
    pub puller_name: String,
    pub source_name: String,
    pub relation: Relation,
    pub recursive: bool,
    pub soft_delete: bool,
}

/// What one node knows about a (folder, peer) relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnowledgeState {
    Unknown,
    WeaklyKnown,
    StronglyConfigured,
}

impl KnowledgeState {
    /// State after hearing about the relationship through gossip. Gossip can
    /// only ever make a relationship weakly known; it never downgrades.
    pub fn after_gossip(self) -> Self {
        self.max(KnowledgeState::WeaklyKnown)
    }

    /// State after the node configures the relationship itself.
    pub fn after_configuration(self) -> Self {
        KnowledgeState::StronglyConfigured
    }
}

fn flatten(items: &[SchemaItem]) -> Vec<RelationEntry> {
    let mut entries = Vec::new();
    for item in items {
        for folder in &item.folders {
            entries.push(RelationEntry {
                key: RelationKey {
                    puller: item.node_id,
                    source: item.peer_id,
                    folder_url: folder.url.clone(),
                },
                puller_name: item.node_name.clone(),
                source_name: item.peer_name.clone(),
                relation: item.relation,
                recursive: folder.recursive,
                soft_delete: folder.soft_delete,
            });
        }
    }
    entries
}

/// Group flattened relationships back into schema items, one per
/// (puller, source, relation).
pub fn group_entries(entries: impl IntoIterator<Item = RelationEntry>) -> Vec<SchemaItem> {
    let mut groups: BTreeMap<(Uuid, Uuid, Relation), SchemaItem> = BTreeMap::new();
    for entry in entries {
        let item = groups
            .entry((entry.key.puller, entry.key.source, entry.relation))
            .or_insert_with(|| SchemaItem {
                node_id: entry.key.puller,
                node_name: entry.puller_name.clone(),
                peer_id: entry.key.source,
                peer_name: entry.source_name.clone(),
                relation: entry.relation,
                folders: Vec::new(),
            });
        item.folders.push(SchemaFolder {
            url: entry.key.folder_url,
            recursive: entry.recursive,
            soft_delete: entry.soft_delete,
        });
    }
    let mut items: Vec<SchemaItem> = groups.into_values().collect();
    for item in &mut items {
        item.folders.sort_by(|a, b| a.url.cmp(&b.url));
    }
    items
}

impl ReplicationSchema {
    pub fn new(node_id: Uuid, node_name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            url,
            strong_items: Vec::new(),
            weak_items: Vec::new(),
        }
    }

    pub fn strong_entries(&self) -> Vec<RelationEntry> {
        flatten(&self.strong_items)
    }

    pub fn weak_entries(&self) -> Vec<RelationEntry> {
        flatten(&self.weak_items)
    }

    /// What this schema says about one relationship
    pub fn knowledge(&self, key: &RelationKey) -> KnowledgeState {
        if self.strong_entries().iter().any(|e| &e.key == key) {
            KnowledgeState::StronglyConfigured
        } else if self.weak_entries().iter().any(|e| &e.key == key) {
            KnowledgeState::WeaklyKnown
        } else {
            KnowledgeState::Unknown
        }
    }
}

/// Merge what `incoming` knows into `local`'s weak set.
///
/// Pure: returns the new weak items for `local`. Relationships `local`
/// configured itself stay strong and are left out; claims about `local`'s own
/// pulls are ignored. The incoming node's strong items are authoritative
/// about that node and replace older weak knowledge of the same relationship;
/// relayed weak items only fill gaps.
pub fn merge_weak(local: &ReplicationSchema, incoming: &ReplicationSchema) -> Vec<SchemaItem> {
    let mut states: BTreeMap<RelationKey, KnowledgeState> = BTreeMap::new();
    for entry in local.weak_entries() {
        let state = states.entry(entry.key).or_insert(KnowledgeState::Unknown);
        *state = state.after_gossip();
    }
    for entry in local.strong_entries() {
        let state = states.entry(entry.key).or_insert(KnowledgeState::Unknown);
        *state = state.after_configuration();
    }

    let mut merged: BTreeMap<RelationKey, RelationEntry> = local
        .weak_entries()
        .into_iter()
        .filter(|e| states.get(&e.key) == Some(&KnowledgeState::WeaklyKnown))
        .map(|e| (e.key.clone(), e))
        .collect();

    let heard = incoming
        .strong_entries()
        .into_iter()
        .map(|e| (e, true))
        .chain(incoming.weak_entries().into_iter().map(|e| (e, false)));
    for (entry, authoritative) in heard {
        if entry.key.puller == local.node_id {
            continue;
        }
        let state = states.entry(entry.key.clone()).or_insert(KnowledgeState::Unknown);
        let before = *state;
        *state = before.after_gossip();
        if *state != KnowledgeState::WeaklyKnown {
            continue;
        }
        if authoritative || before == KnowledgeState::Unknown {
            merged.insert(entry.key.clone(), entry);
        }
    }

    group_entries(merged.into_values())
}

/// Request for the changes a source holds for one folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Node asking; versions it created are left out
    pub requester: Uuid,
    pub folder_url: String,
    /// Watermark: only changes stored after this instant
    pub since: DateTime<Utc>,
    pub recursive: bool,
}

/// One entry of a change list, ordered by the source's storage time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplicationChange {
    Version {
        file_id: Uuid,
        version_id: Uuid,
        folder_url: String,
        time_stored: DateTime<Utc>,
    },
    Deletion {
        file_id: Uuid,
        folder_url: String,
        time_deleted: DateTime<Utc>,
    },
}

impl ReplicationChange {
    /// Source-side instant the watermark advances to once applied
    pub fn cursor(&self) -> DateTime<Utc> {
        match self {
            ReplicationChange::Version { time_stored, .. } => *time_stored,
            ReplicationChange::Deletion { time_deleted, .. } => *time_deleted,
        }
    }

    pub fn file_id(&self) -> Uuid {
        match self {
            ReplicationChange::Version { file_id, .. } | ReplicationChange::Deletion { file_id, .. } => {
                *file_id
            }
        }
    }
}

/// Metadata sent ahead of a file's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFileMetadata {
    /// Node serving the file
    pub source_node_id: Uuid,
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub folder_url: String,
    pub name: String,
    pub size: u64,
    pub time_created: DateTime<Utc>,
    /// Node that originally created the version
    pub created_storage_id: Uuid,
    pub modified_by: String,
    /// Hex SHA-256 of the content
    pub sha256: String,
    #[serde(default)]
    pub compression: Compression,
}

/// A fetched file: metadata plus uncompressed content.
#[derive(Debug, Clone)]
pub struct ReplicationFile {
    pub metadata: ReplicationFileMetadata,
    pub content: Vec<u8>,
}

impl ReplicationFile {
    /// Check the content against the declared size and hash.
    pub fn verify(&self) -> Result<()> {
        if self.content.len() as u64 != self.metadata.size {
            return Err(StorageError::Serialization(format!(
                "version {}: got {} bytes, expected {}",
                self.metadata.version_id,
                self.content.len(),
                self.metadata.size
            )));
        }
        let computed = content_sha256(&self.content);
        if computed != self.metadata.sha256 {
            return Err(StorageError::Serialization(format!(
                "version {}: content hash mismatch",
                self.metadata.version_id
            )));
        }
        Ok(())
    }
}

/// Hex SHA-256 of `content`.
pub fn content_sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Where and who a peer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub node_id: Uuid,
    pub name: String,
    pub url: String,
}

/// The three operations replication needs from a remote node.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Send our schema, receive the peer's.
    async fn exchange_schema(
        &self,
        peer: &PeerAddress,
        schema: &ReplicationSchema,
    ) -> Result<ReplicationSchema>;

    /// List the changes the peer holds for a folder.
    async fn get_replication_files(
        &self,
        peer: &PeerAddress,
        request: &ChangesRequest,
    ) -> Result<Vec<ReplicationChange>>;

    /// Fetch one version's metadata and content.
    async fn get_replication_file(
        &self,
        peer: &PeerAddress,
        folder_url: &str,
        file_id: Uuid,
        version_id: Uuid,
    ) -> Result<ReplicationFile>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(node: Uuid, peer: Uuid, folders: &[&str]) -> SchemaItem {
        SchemaItem {
            node_id: node,
            node_name: format!("n-{}", &node.to_string()[..4]),
            peer_id: peer,
            peer_name: format!("n-{}", &peer.to_string()[..4]),
            relation: Relation::PullsFrom,
            folders: folders
                .iter()
                .map(|url| SchemaFolder {
                    url: url.to_string(),
                    recursive: true,
                    soft_delete: false,
                })
                .collect(),
        }
    }

    fn key(puller: Uuid, source: Uuid, folder: &str) -> RelationKey {
        RelationKey {
            puller,
            source,
            folder_url: folder.to_string(),
        }
    }

    #[test]
    fn test_knowledge_state_transitions() {
        use KnowledgeState::*;
        assert_eq!(Unknown.after_gossip(), WeaklyKnown);
        assert_eq!(WeaklyKnown.after_gossip(), WeaklyKnown);
        assert_eq!(StronglyConfigured.after_gossip(), StronglyConfigured);
        assert_eq!(Unknown.after_configuration(), StronglyConfigured);
        assert_eq!(WeaklyKnown.after_configuration(), StronglyConfigured);
    }

    #[test]
    fn test_merge_adds_incoming_items_as_weak() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let local = ReplicationSchema::new(a, "a", None);
        let mut incoming = ReplicationSchema::new(b, "b", None);
        incoming.strong_items.push(item(b, c, &["/docs"]));

        let mut merged = local.clone();
        merged.weak_items = merge_weak(&local, &incoming);
        assert_eq!(merged.knowledge(&key(b, c, "/docs")), KnowledgeState::WeaklyKnown);
        assert_eq!(merged.knowledge(&key(b, c, "/other")), KnowledgeState::Unknown);
    }

    #[test]
    fn test_merge_never_downgrades_strong() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut local = ReplicationSchema::new(a, "a", None);
        local.strong_items.push(item(a, b, &["/docs"]));
        let mut incoming = ReplicationSchema::new(b, "b", None);
        incoming.weak_items.push(item(a, b, &["/docs", "/media"]));

        let weak = merge_weak(&local, &incoming);
        // Claims about the local node's own pulls are ignored entirely
        assert!(weak.is_empty());

        let mut merged = local.clone();
        merged.weak_items = weak;
        assert_eq!(
            merged.knowledge(&key(a, b, "/docs")),
            KnowledgeState::StronglyConfigured
        );
    }

    #[test]
    fn test_configuring_a_gossiped_relation_drops_the_weak_copy() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut local = ReplicationSchema::new(a, "a", None);
        local.weak_items.push(item(b, c, &["/docs"]));
        local.weak_items.push(item(a, b, &["/docs"]));
        local.strong_items.push(item(a, b, &["/docs"]));

        let weak = merge_weak(&local, &ReplicationSchema::new(c, "c", None));
        assert_eq!(weak.len(), 1);
        assert_eq!(weak[0].node_id, b);
    }

    #[test]
    fn test_merge_relays_weak_items_without_overriding_authority() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut local = ReplicationSchema::new(a, "a", None);
        local.weak_items.push(item(c, d, &["/docs"]));

        // b relays a stale view of c that disagrees on soft_delete
        let mut relayed = item(c, d, &["/docs", "/media"]);
        relayed.folders[0].soft_delete = true;
        let mut incoming = ReplicationSchema::new(b, "b", None);
        incoming.weak_items.push(relayed);

        let weak = merge_weak(&local, &incoming);
        assert_eq!(weak.len(), 1);
        let folders = &weak[0].folders;
        assert_eq!(folders.len(), 2);
        assert!(!folders.iter().find(|f| f.url == "/docs").unwrap().soft_delete);

        // c itself is authoritative about its own pulls
        let mut authoritative = ReplicationSchema::new(c, "c", None);
        let mut own = item(c, d, &["/docs"]);
        own.folders[0].soft_delete = true;
        authoritative.strong_items.push(own);
        let mut local2 = local.clone();
        local2.weak_items = weak;
        let weak = merge_weak(&local2, &authoritative);
        let docs = weak[0].folders.iter().find(|f| f.url == "/docs").unwrap();
        assert!(docs.soft_delete);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let local = ReplicationSchema::new(a, "a", None);
        let mut incoming = ReplicationSchema::new(b, "b", None);
        incoming.strong_items.push(item(b, c, &["/x", "/y"]));
        incoming.weak_items.push(item(c, b, &["/z"]));

        let once = merge_weak(&local, &incoming);
        let mut after = local.clone();
        after.weak_items = once.clone();
        assert_eq!(merge_weak(&after, &incoming), once);
    }

    #[test]
    fn test_change_serialization_is_tagged() {
        let change = ReplicationChange::Deletion {
            file_id: Uuid::nil(),
            folder_url: "/docs".into(),
            time_deleted: Utc::now(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "deletion");
    }

    #[test]
    fn test_replication_file_verify() {
        let content = b"hello".to_vec();
        let mut file = ReplicationFile {
            metadata: ReplicationFileMetadata {
                source_node_id: Uuid::new_v4(),
                file_id: Uuid::new_v4(),
                version_id: Uuid::new_v4(),
                folder_url: "/docs".into(),
                name: "a.txt".into(),
                size: 5,
                time_created: Utc::now(),
                created_storage_id: Uuid::new_v4(),
                modified_by: "alice".into(),
                sha256: content_sha256(&content),
                compression: Compression::None,
            },
            content,
        };
        assert!(file.verify().is_ok());
        file.content[0] = b'j';
        assert!(file.verify().is_err());
    }
}
