//! File API, gated by the `X-Access-Token` header.
//!
//! Endpoints:
//!   PUT    /api/files?folder=&name=            → upload a new version (streamed;
//!                                                 needs a known length)
//!   GET    /api/files?folder=[&name=]          → file + versions, or folder listing
//!   DELETE /api/files?folder=&name=            → soft delete
//!   POST   /api/sessions?folder=&name=[&version=] → session link for delivery

use blobfs_core::{
    AccessToken, FileMetadata, FileVersion, StorageError, WriteOrigin, model::normalize_folder_url,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, HeaderMap};
use hyper::{Method, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::body::{RequestBody, body_channel, forward_body};
use crate::{AppState, HttpResponse, finish, json_error, json_ok, json_status, parse_query, storage_error};

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// `GET /api/files` answer for a single file
#[derive(Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub file: FileMetadata,
    pub versions: Vec<FileVersion>,
}

/// `PUT /api/files` answer
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResult {
    pub file_id: Uuid,
    pub version_id: Uuid,
    pub size: u64,
    pub time_created: DateTime<Utc>,
}

/// `POST /api/sessions` answer
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionLink {
    pub token: String,
    pub link: String,
    pub expires: DateTime<Utc>,
}

pub async fn handle_api_request(
    state: &AppState,
    method: &Method,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: RequestBody,
) -> HttpResponse {
    let caller = match authorize(state, headers) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let params = parse_query(query);

    match (method.as_str(), path) {
        ("PUT", "/api/files") => upload(state, &params, &caller, headers, body).await,
        ("GET", "/api/files") => describe(state, &params),
        ("DELETE", "/api/files") => delete(state, &params),
        ("POST", "/api/sessions") => session(state, &params, &caller),
        _ => json_error(404, "not_found", &format!("Unknown API endpoint: {} {}", method, path)),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AccessToken, HttpResponse> {
    let Some(raw) = headers.get(ACCESS_TOKEN_HEADER) else {
        return Err(json_error(401, "unauthorized", "Missing X-Access-Token header"));
    };
    let token_id = raw
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| json_error(401, "unauthorized", "X-Access-Token is not a token id"))?;
    match state.tokens.validate_access_token(&token_id) {
        Ok(Some(token)) => Ok(token),
        Ok(None) => Err(json_error(403, "forbidden", "Access token expired or unknown")),
        Err(e) => Err(storage_error(&e)),
    }
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, HttpResponse> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| json_error(400, "invalid_request", &format!("Missing '{}' parameter", key)))
}

/// Declared length of an upload: exact from the body when it knows, else
/// the Content-Length header
fn upload_length(headers: &HeaderMap, body: &RequestBody) -> Option<u64> {
    body.size_hint().exact().or_else(|| {
        headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    })
}

async fn upload(
    state: &AppState,
    params: &HashMap<String, String>,
    caller: &AccessToken,
    headers: &HeaderMap,
    body: RequestBody,
) -> HttpResponse {
    let (folder, name) = match (required(params, "folder"), required(params, "name")) {
        (Ok(f), Ok(n)) => (f.to_string(), n.to_string()),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    let Some(content_length) = upload_length(headers, &body) else {
        return json_error(411, "length_required", "Uploads need a Content-Length");
    };
    if content_length > state.max_upload_size {
        return json_error(413, "payload_too_large", "Upload too large");
    }
    let files = state.files.clone();
    let modified_by = caller
        .security_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());
    let (tx, mut content) = body_channel();
    let write = tokio::task::spawn_blocking(move || {
        files.write_file(
            &folder,
            &name,
            &mut content,
            content_length,
            WriteOrigin::Local { modified_by },
        )
    });
    let (_, written) = tokio::join!(forward_body(body, tx), write);
    match written {
        Ok(Ok(version)) => json_status(
            201,
            &UploadResult {
                file_id: version.file_id,
                version_id: version.unique_id,
                size: version.size,
                time_created: version.time_created,
            },
        ),
        Ok(Err(e)) => storage_error(&e),
        Err(e) => storage_error(&StorageError::Io(std::io::Error::other(e))),
    }
}

fn describe(state: &AppState, params: &HashMap<String, String>) -> HttpResponse {
    let folder = match required(params, "folder") {
        Ok(f) => f,
        Err(r) => return r,
    };
    let Some(name) = params.get("name").filter(|n| !n.is_empty()) else {
        return match state.reader.files_in_folder(folder) {
            Ok(files) => json_ok(&files),
            Err(e) => storage_error(&e),
        };
    };
    let file = match state.reader.file(folder, name) {
        Ok(Some(file)) => file,
        Ok(None) => return json_error(404, "not_found", &format!("{} not found in {}", name, folder)),
        Err(e) => return storage_error(&e),
    };
    match state.reader.versions(&file.unique_id) {
        Ok(versions) => json_ok(&FileInfo { file, versions }),
        Err(e) => storage_error(&e),
    }
}

fn delete(state: &AppState, params: &HashMap<String, String>) -> HttpResponse {
    let (folder, name) = match (required(params, "folder"), required(params, "name")) {
        (Ok(f), Ok(n)) => (f, n),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    let file = match state.files.file(folder, name) {
        Ok(Some(file)) => file,
        Ok(None) => return json_error(404, "not_found", &format!("{} not found in {}", name, folder)),
        Err(e) => return storage_error(&e),
    };
    match state.files.delete_file(&file) {
        Ok(_) => finish(Response::builder().status(204), Bytes::new()),
        Err(e) => storage_error(&e),
    }
}

fn session(state: &AppState, params: &HashMap<String, String>, caller: &AccessToken) -> HttpResponse {
    let (folder, name) = match (required(params, "folder"), required(params, "name")) {
        (Ok(f), Ok(n)) => (f, n),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    let folder_url = match normalize_folder_url(folder) {
        Ok(url) => url,
        Err(e) => return storage_error(&e),
    };
    let file = match state.reader.file(&folder_url, name) {
        Ok(Some(file)) => file,
        Ok(None) => return json_error(404, "not_found", &format!("{} not found in {}", name, folder_url)),
        Err(e) => return storage_error(&e),
    };
    let version_id = match params.get("version").filter(|v| !v.is_empty()) {
        None => file.current_version_id,
        Some(raw) => {
            let Ok(id) = Uuid::parse_str(raw) else {
                return json_error(400, "invalid_request", "version is not a UUID");
            };
            match state.reader.version(&id) {
                Ok(Some(v)) if v.file_id == file.unique_id => id,
                Ok(_) => return json_error(404, "not_found", &format!("version {} of {}", id, name)),
                Err(e) => return storage_error(&e),
            }
        }
    };
    let token = state
        .tokens
        .issue_file_token(caller, file.unique_id, version_id, &folder_url);
    json_ok(&SessionLink {
        link: token.session_link(&state.delivery_host),
        token: token.encode(),
        expires: caller.expires,
    })
}
