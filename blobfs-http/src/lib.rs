//! blobfs HTTP layer
//!
//! Server side: delivery of files by session token, the file API and the
//! replication endpoints peers pull through. Client side: [`HttpTransport`],
//! the replication transport that talks to those endpoints.

pub mod api;
pub mod body;
pub mod delivery;
pub mod node;
pub mod remote;
pub mod replication_handlers;

pub use body::{HttpBody, RequestBody};
pub use node::NodeHandle;
pub use remote::HttpTransport;

use blobfs_core::{FileManager, FileReader, ReplicationEngine, StorageError, TokenService};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use hyper::http::response::Builder;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error};

use crate::body::BoxError;

pub type HttpResponse = Response<HttpBody>;

/// Largest request body buffered in memory. Uploads stream and are bounded
/// by `max_upload_size` instead.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Largest declared upload length accepted
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Seconds a client is told to wait after a `busy` answer
const RETRY_AFTER_SECS: u64 = 30;

/// Everything request handlers need, shared across connections
pub struct AppState {
    pub files: Arc<FileManager>,
    pub reader: FileReader,
    pub tokens: Arc<TokenService>,
    pub engine: Arc<ReplicationEngine>,
    /// Prefix of session links handed out by the file API
    pub delivery_host: String,
    pub max_body_size: usize,
    pub max_upload_size: u64,
}

impl AppState {
    pub fn new(engine: Arc<ReplicationEngine>, tokens: Arc<TokenService>, delivery_host: impl Into<String>) -> Self {
        let files = engine.files().clone();
        Self {
            reader: files.reader(),
            files,
            tokens,
            engine,
            delivery_host: delivery_host.into(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

/// hyper service entry point
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<HttpResponse, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body.map_err(BoxError::from).boxed_unsync();
    let response = route(
        &state,
        &parts.method,
        parts.uri.path(),
        parts.uri.query().unwrap_or(""),
        &parts.headers,
        body,
    )
    .await;
    debug!(
        method = %parts.method,
        path = parts.uri.path(),
        status = response.status().as_u16(),
        "Handled request"
    );
    Ok(response)
}

/// Dispatch one request. Split from [`handle_request`] so tests can call it
/// without a socket.
pub async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: RequestBody,
) -> HttpResponse {
    if let Some(token) = path.strip_prefix("/d/") {
        if method != Method::GET && method != Method::HEAD {
            return json_error(405, "method_not_allowed", "Delivery only supports GET");
        }
        return delivery::handle_delivery(state, token, query, method == Method::HEAD).await;
    }
    if let Some(rest) = path.strip_prefix("/replication") {
        let body = match crate::body::collect_limited(body, state.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => return body_error(&e),
        };
        return replication_handlers::handle_replication_request(rest, method, &body, query, &state.engine)
            .await;
    }
    if path.starts_with("/api/") {
        return api::handle_api_request(state, method, path, query, headers, body).await;
    }
    if path == "/health" && method == Method::GET {
        return json_ok(&serde_json::json!({ "status": "ok" }));
    }
    json_error(404, "not_found", &format!("Unknown endpoint: {} {}", method, path))
}

/// Answer for a request body that could not be read
pub(crate) fn body_error(e: &BoxError) -> HttpResponse {
    if e.is::<http_body_util::LengthLimitError>() {
        return json_error(413, "payload_too_large", "Request body too large");
    }
    json_error(400, "invalid_request", &format!("Failed to read body: {}", e))
}

/// Build a response, falling back to a bare 500 if a header was invalid
pub(crate) fn finish(builder: Builder, content: impl Into<Bytes>) -> HttpResponse {
    finish_streaming(builder, body::full(content))
}

pub(crate) fn finish_streaming(builder: Builder, content: HttpBody) -> HttpResponse {
    builder.body(content).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        let mut response = Response::new(body::full(Bytes::from_static(b"{\"error\":\"internal\"}")));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

pub(crate) fn json_ok<T: serde::Serialize>(data: &T) -> HttpResponse {
    json_status(200, data)
}

pub(crate) fn json_status<T: serde::Serialize>(status: u16, data: &T) -> HttpResponse {
    let body = serde_json::to_vec(data).unwrap_or_default();
    finish(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json"),
        body,
    )
}

/// Error payload every endpoint answers with
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub(crate) fn json_error(status: u16, kind: &str, message: &str) -> HttpResponse {
    let body = serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
        kind: kind.to_string(),
    })
    .unwrap_or_default();
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if status == 503 {
        builder = builder.header(RETRY_AFTER, RETRY_AFTER_SECS);
    }
    finish(builder, body)
}

/// Status and machine-readable kind for a storage error
pub fn error_status(e: &StorageError) -> (u16, &'static str) {
    match e {
        StorageError::NotFound(_) => (404, "not_found"),
        StorageError::MalformedToken(_) => (400, "malformed_token"),
        StorageError::Config(_) => (400, "invalid_request"),
        StorageError::Busy(_) => (503, "busy"),
        StorageError::Duplicate(_) => (409, "duplicate"),
        StorageError::ContainerClosed(_) => (409, "container_closed"),
        StorageError::Transport(_) => (502, "transport"),
        StorageError::Corruption { .. } => (500, "corruption"),
        StorageError::Database(_) | StorageError::Serialization(_) | StorageError::Io(_) => {
            (500, "internal")
        }
    }
}

pub(crate) fn storage_error(e: &StorageError) -> HttpResponse {
    let (status, kind) = error_status(e);
    if status >= 500 && status != 503 {
        error!(kind, "Request failed: {}", e);
    } else {
        debug!(kind, "Request rejected: {}", e);
    }
    json_error(status, kind, &e.to_string())
}

/// Parse a URL query string into a key/value map.
pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(urldecode(k), urldecode(v));
    }
    map
}

/// Percent-decoding; invalid UTF-8 is replaced
pub(crate) fn urldecode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut input = s.bytes();
    while let Some(b) = input.next() {
        match b {
            b'%' => {
                let hi = input.next().and_then(hex_val);
                let lo = input.next().and_then(hex_val);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                    _ => bytes.push(b'%'),
                }
            }
            b'+' => bytes.push(b' '),
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-encode everything but RFC 3986 unreserved characters
pub(crate) fn pct_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
