//! blobfs core library
//!
//! Core functionality for blobfs including:
//! - Entities and the data-driven table schema
//! - Metadata repository contract and its SQLite implementation
//! - Blob pack format, blob handles and container lifecycle
//! - File and version management
//! - File tokens and access tokens
//! - Replication protocol, schema gossip and the pull engine
//! - Node configuration and the replication log

pub mod blob;
pub mod config;
pub mod error;
pub mod files;
pub mod lifecycle;
pub mod metadata;
pub mod model;
pub mod pack;
pub mod registry;
pub mod repl_log;
pub mod replication;
pub mod schema;
pub mod sqlite_store;
pub mod sync;
pub mod token;

pub use config::NodeConfig;
pub use error::{Result, StorageError};
pub use files::{FileManager, FileReader, ReplicatedVersion, VersionStream, WriteOrigin};
pub use lifecycle::{ContainerManager, LifecycleSettings, StreamGuard};
pub use metadata::{ChangeSet, CommittedVersion, CurrentPolicy, MetadataRepository};
pub use model::{
    AccessToken, Blob, BlobRange, Container, FileMetadata, FileVersion, Folder,
    ReplicationFolderSetting, StorageNode,
};
pub use registry::{ContainerConfig, ContainerRegistry};
pub use repl_log::{ReplicationLog, ReplicationLogEntry};
pub use replication::{
    ChangesRequest, Compression, KnowledgeState, NodeInfo, PeerAddress, ReplicationChange,
    ReplicationFile, ReplicationFileMetadata, ReplicationSchema, ReplicationTransport,
    PROTOCOL_VERSION,
};
pub use sqlite_store::SqliteMetadataStore;
pub use sync::{PullConfig, PullReport, ReplicationEngine, SchedulerSettings};
pub use token::{FileToken, TokenService};
