//! HTTP replication endpoint handlers.
//!
//! Endpoints:
//!   GET  /replication/info     → node identity, protocol version, capabilities
//!   POST /replication/schema   → schema exchange (JSON in, JSON out)
//!   GET  /replication/changes  → changes since a watermark
//!   GET  /replication/file     → one version, framed (see [`encode_file_frame`])

use blobfs_core::{
    ChangesRequest, Compression, ReplicationEngine, ReplicationFile, ReplicationFileMetadata,
    ReplicationSchema, Result, StorageError,
};
use chrono::{DateTime, Utc};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Response};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::{HttpResponse, finish, json_error, json_ok, parse_query, storage_error};

/// zstd level used for file transfers
const ZSTD_LEVEL: i32 = 3;

/// Route a replication request. `path` is the part after `/replication`.
pub async fn handle_replication_request(
    path: &str,
    method: &Method,
    body: &[u8],
    query: &str,
    engine: &Arc<ReplicationEngine>,
) -> HttpResponse {
    match (method.as_str(), path) {
        ("GET", "/info") => match engine.node_info() {
            Ok(info) => json_ok(&info),
            Err(e) => storage_error(&e),
        },
        ("POST", "/schema") => handle_schema(engine, body),
        ("GET", "/changes") => handle_changes(engine, query),
        ("GET", "/file") => handle_file(engine, query).await,
        _ => json_error(
            404,
            "not_found",
            &format!("Unknown replication endpoint: {} /replication{}", method, path),
        ),
    }
}

fn handle_schema(engine: &ReplicationEngine, body: &[u8]) -> HttpResponse {
    let incoming: ReplicationSchema = match serde_json::from_slice(body) {
        Ok(schema) => schema,
        Err(e) => return json_error(400, "invalid_request", &format!("Invalid schema: {}", e)),
    };
    match engine.accept_schema(&incoming) {
        Ok(schema) => json_ok(&schema),
        Err(e) => storage_error(&e),
    }
}

fn uuid_param(params: &HashMap<String, String>, key: &str) -> std::result::Result<Uuid, HttpResponse> {
    params
        .get(key)
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| json_error(400, "invalid_request", &format!("'{}' must be a UUID", key)))
}

fn handle_changes(engine: &ReplicationEngine, query: &str) -> HttpResponse {
    let params = parse_query(query);
    let requester = match uuid_param(&params, "requester") {
        Ok(id) => id,
        Err(r) => return r,
    };
    let Some(folder_url) = params.get("folder").cloned() else {
        return json_error(400, "invalid_request", "Missing 'folder' parameter");
    };
    let since = match params.get("since") {
        None => DateTime::<Utc>::default(),
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => return json_error(400, "invalid_request", &format!("Invalid 'since': {}", e)),
        },
    };
    let recursive = params
        .get("recursive")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(true);
    let request = ChangesRequest {
        requester,
        folder_url,
        since,
        recursive,
    };
    match engine.list_changes(&request) {
        Ok(changes) => json_ok(&changes),
        Err(e) => storage_error(&e),
    }
}

async fn handle_file(engine: &Arc<ReplicationEngine>, query: &str) -> HttpResponse {
    let params = parse_query(query);
    let (file_id, version_id) = match (uuid_param(&params, "file"), uuid_param(&params, "version")) {
        (Ok(f), Ok(v)) => (f, v),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    let Some(folder_url) = params.get("folder").cloned() else {
        return json_error(400, "invalid_request", "Missing 'folder' parameter");
    };
    let compression = match params.get("compression").map(String::as_str) {
        Some("zstd") => Compression::Zstd,
        _ => Compression::None,
    };

    let engine = engine.clone();
    let framed = tokio::task::spawn_blocking(move || {
        let file = engine.fetch_file(&folder_url, file_id, version_id)?;
        encode_file_frame(file, compression)
    })
    .await;
    match framed {
        Ok(Ok(frame)) => finish(
            Response::builder()
                .status(200)
                .header(CONTENT_TYPE, "application/octet-stream"),
            frame,
        ),
        Ok(Err(e)) => storage_error(&e),
        Err(e) => storage_error(&StorageError::Io(std::io::Error::other(e))),
    }
}

/// `[u32 BE metadata length][metadata JSON][content]`; the content is zstd
/// compressed when the metadata says so.
pub fn encode_file_frame(file: ReplicationFile, compression: Compression) -> Result<Vec<u8>> {
    let ReplicationFile { mut metadata, content } = file;
    metadata.compression = compression;
    let content = match compression {
        Compression::None => content,
        Compression::Zstd => zstd::encode_all(content.as_slice(), ZSTD_LEVEL)?,
    };
    let meta = serde_json::to_vec(&metadata)?;
    let mut frame = Vec::with_capacity(4 + meta.len() + content.len());
    frame.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    frame.extend_from_slice(&meta);
    frame.extend_from_slice(&content);
    Ok(frame)
}

/// Inverse of [`encode_file_frame`]; the returned content is uncompressed.
pub fn decode_file_frame(frame: &[u8]) -> Result<ReplicationFile> {
    let truncated = || StorageError::Serialization("truncated file frame".into());
    let len_bytes: [u8; 4] = frame.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(truncated)?;
    let meta_len = u32::from_be_bytes(len_bytes) as usize;
    let meta = frame.get(4..4 + meta_len).ok_or_else(truncated)?;
    let mut metadata: ReplicationFileMetadata = serde_json::from_slice(meta)?;
    let body = &frame[4 + meta_len..];
    let content = match metadata.compression {
        Compression::None => body.to_vec(),
        Compression::Zstd => zstd::decode_all(body)?,
    };
    metadata.compression = Compression::None;
    Ok(ReplicationFile { metadata, content })
}
