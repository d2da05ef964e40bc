//! File tokens and access tokens
//!
//! A file token packs (token id, file id, version id, folder URL) into an
//! opaque string that can be used as a URL path segment:
//!
//! ```text
//! base64( token id : 16 | file id : 16 | version id : 16 | folder URL utf-8 )
//! ```
//!
//! with the standard alphabet and padding, and every `/` replaced by `-`.
//! Tokens are tamper-evident, not signed: flipping a byte changes an id or the
//! folder, which then fails to resolve.
//!
//! Access tokens are database rows with an expiry. Minting one sweeps the
//! rows that already expired. A file token carries the id of the access token
//! it was issued under, so it lives exactly as long as that token; issuing
//! one writes nothing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Duration;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::metadata::MetadataRepository;
use crate::model::{AccessToken, timestamp_now};

/// Size of the fixed identifier block
pub const ID_BLOCK_LEN: usize = 48;

/// Default lifetime of access and file tokens, in hours
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// Self-describing delivery credential; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToken {
    pub token_id: Uuid,
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub folder_url: String,
}

impl FileToken {
    pub fn new(token_id: Uuid, file_id: Uuid, version_id: Uuid, folder_url: impl Into<String>) -> Self {
        Self {
            token_id,
            file_id,
            version_id,
            folder_url: folder_url.into(),
        }
    }

    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(ID_BLOCK_LEN + self.folder_url.len());
        raw.extend_from_slice(self.token_id.as_bytes());
        raw.extend_from_slice(self.file_id.as_bytes());
        raw.extend_from_slice(self.version_id.as_bytes());
        raw.extend_from_slice(self.folder_url.as_bytes());
        STANDARD.encode(raw).replace('/', "-")
    }

    pub fn decode(token: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(token.replace('-', "/"))
            .map_err(|e| StorageError::MalformedToken(format!("not base64: {}", e)))?;
        if raw.len() <= ID_BLOCK_LEN {
            return Err(StorageError::MalformedToken(format!(
                "{} bytes leaves no folder URL",
                raw.len()
            )));
        }
        let id = |ix: usize| {
            Uuid::from_slice(&raw[ix * 16..(ix + 1) * 16])
                .map_err(|e| StorageError::MalformedToken(e.to_string()))
        };
        let folder_url = std::str::from_utf8(&raw[ID_BLOCK_LEN..])
            .map_err(|_| StorageError::MalformedToken("folder URL is not UTF-8".into()))?;
        Ok(Self {
            token_id: id(0)?,
            file_id: id(1)?,
            version_id: id(2)?,
            folder_url: folder_url.to_string(),
        })
    }

    /// `"<deliveryHost>/<token>"`
    pub fn session_link(&self, delivery_host: &str) -> String {
        format!("{}/{}", delivery_host.trim_end_matches('/'), self.encode())
    }
}

/// Mints and checks access tokens, and issues file tokens backed by them
pub struct TokenService {
    metadata: Arc<dyn MetadataRepository>,
    ttl: Duration,
}

impl TokenService {
    pub fn new(metadata: Arc<dyn MetadataRepository>, ttl: Duration) -> Self {
        Self { metadata, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert a fresh access token, sweeping expired ones first
    pub fn mint_access_token(&self, security_id: Option<String>) -> Result<AccessToken> {
        let now = timestamp_now();
        let purged = self.metadata.purge_expired_tokens(now)?;
        if purged > 0 {
            debug!(purged, "Purged expired access tokens");
        }
        let mut token = AccessToken {
            id: 0,
            unique_id: Uuid::new_v4(),
            expires: now + self.ttl,
            security_id,
        };
        token.id = self.metadata.insert_access_token(&token)?;
        Ok(token)
    }

    /// The token if it exists and has not expired
    pub fn validate_access_token(&self, token_id: &Uuid) -> Result<Option<AccessToken>> {
        let now = timestamp_now();
        Ok(self
            .metadata
            .access_token(token_id)?
            .filter(|t| !t.is_expired(now)))
    }

    /// Issue a file token under an existing access token
    pub fn issue_file_token(
        &self,
        access: &AccessToken,
        file_id: Uuid,
        version_id: Uuid,
        folder_url: &str,
    ) -> FileToken {
        FileToken::new(access.unique_id, file_id, version_id, folder_url)
    }
}
