//! HTTP replication client.
//!
//! Talks to a peer's `/replication` endpoints. Status codes are mapped back
//! onto [`StorageError`] so the engine can tell a retryable outage (busy,
//! unreachable, 5xx) from a version it should skip (404, corrupt source,
//! undecodable answer).

use async_trait::async_trait;
use blobfs_core::{
    ChangesRequest, Compression, NodeInfo, PeerAddress, ReplicationChange, ReplicationFile,
    ReplicationSchema, ReplicationTransport, Result, StorageError,
};
use chrono::SecondsFormat;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::ErrorBody;
use crate::replication_handlers::decode_file_frame;

/// reqwest-backed [`ReplicationTransport`]
pub struct HttpTransport {
    http: reqwest::Client,
    compression: Compression,
}

impl HttpTransport {
    /// `timeout` bounds each request; `compression` is asked of peers for
    /// file transfers.
    pub fn new(timeout: Duration, compression: Compression) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, compression })
    }

    /// GET /replication/info
    pub async fn get_info(&self, base_url: &str) -> Result<NodeInfo> {
        let url = endpoint(base_url, "info");
        let resp = self.http.get(&url).send().await.map_err(|e| transport(&url, e))?;
        json_body(&url, resp).await
    }
}

fn endpoint(base_url: &str, name: &str) -> String {
    format!("{}/replication/{}", base_url.trim_end_matches('/'), name)
}

fn transport(url: &str, e: reqwest::Error) -> StorageError {
    StorageError::Transport(format!("{}: {}", url, e))
}

/// Map a non-success answer onto the error the engine acts on
async fn status_error(url: &str, resp: reqwest::Response) -> StorageError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
    let kind = body.as_ref().map(|b| b.kind.as_str()).unwrap_or("");
    let message = match &body {
        Some(b) => format!("{} ({}): {}", url, status, b.error),
        None => format!("{} ({}): {}", url, status, text),
    };
    match status {
        404 => StorageError::NotFound(message),
        503 => StorageError::Busy(message),
        500 if kind == "corruption" => StorageError::Serialization(message),
        400..=499 => StorageError::Serialization(message),
        _ => StorageError::Transport(message),
    }
}

async fn json_body<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(status_error(url, resp).await);
    }
    let bytes = resp.bytes().await.map_err(|e| transport(url, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::Serialization(format!("{}: invalid answer: {}", url, e)))
}

#[async_trait]
impl ReplicationTransport for HttpTransport {
    async fn exchange_schema(
        &self,
        peer: &PeerAddress,
        schema: &ReplicationSchema,
    ) -> Result<ReplicationSchema> {
        let url = endpoint(&peer.url, "schema");
        let resp = self
            .http
            .post(&url)
            .json(schema)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        json_body(&url, resp).await
    }

    async fn get_replication_files(
        &self,
        peer: &PeerAddress,
        request: &ChangesRequest,
    ) -> Result<Vec<ReplicationChange>> {
        let url = endpoint(&peer.url, "changes");
        let since = request.since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("requester", request.requester.to_string()),
                ("folder", request.folder_url.clone()),
                ("since", since),
                ("recursive", request.recursive.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let changes: Vec<ReplicationChange> = json_body(&url, resp).await?;
        debug!(peer = %peer.name, folder = %request.folder_url, count = changes.len(), "Listed changes");
        Ok(changes)
    }

    async fn get_replication_file(
        &self,
        peer: &PeerAddress,
        folder_url: &str,
        file_id: Uuid,
        version_id: Uuid,
    ) -> Result<ReplicationFile> {
        let url = endpoint(&peer.url, "file");
        let mut query = vec![
            ("folder", folder_url.to_string()),
            ("file", file_id.to_string()),
            ("version", version_id.to_string()),
        ];
        if self.compression == Compression::Zstd {
            query.push(("compression", "zstd".to_string()));
        }
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        if !resp.status().is_success() {
            return Err(status_error(&url, resp).await);
        }
        let frame = resp.bytes().await.map_err(|e| transport(&url, e))?;
        decode_file_frame(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_slash() {
        assert_eq!(
            endpoint("http://a:8080/", "info"),
            "http://a:8080/replication/info"
        );
        assert_eq!(endpoint("http://a", "file"), "http://a/replication/file");
    }

    #[test]
    fn test_new_client() {
        assert!(HttpTransport::new(Duration::from_secs(5), Compression::Zstd).is_ok());
    }
}
