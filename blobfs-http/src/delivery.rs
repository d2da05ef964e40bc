//! `GET /d/<token>[?download=1]`
//!
//! Decodes the session token, checks the access token behind it, resolves
//! the version and streams its bytes. The version stream, and with it any
//! pin on an active blob, lives until the last chunk is sent.

use blobfs_core::{FileMetadata, FileToken, FileVersion, Result, StorageError};
use bytes::Bytes;
use hyper::Response;
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use tracing::info;

use crate::body::stream_reader;
use crate::{
    AppState, HttpResponse, finish, finish_streaming, json_error, parse_query, pct_encode,
    storage_error,
};

pub async fn handle_delivery(state: &AppState, token: &str, query: &str, head_only: bool) -> HttpResponse {
    let token = match FileToken::decode(token) {
        Ok(token) => token,
        Err(e) => return storage_error(&e),
    };
    match state.tokens.validate_access_token(&token.token_id) {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(403, "session_expired", "Session expired or unknown"),
        Err(e) => return storage_error(&e),
    }
    let (file, version) = match resolve(state, &token) {
        Ok(resolved) => resolved,
        Err(e) => return storage_error(&e),
    };
    let download = parse_query(query)
        .get("download")
        .is_some_and(|v| v == "1" || v == "true");

    let builder = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, version.size)
        .header(CONTENT_DISPOSITION, content_disposition(&version.name, download));
    if head_only {
        return finish(builder, Bytes::new());
    }

    let stream = match state.reader.open_version_stream(&version).await {
        Ok(stream) => stream,
        Err(e) => return storage_error(&e),
    };
    info!(
        file_id = %file.unique_id,
        version_id = %version.unique_id,
        bytes = stream.content_length(),
        "Delivering {}",
        version.name
    );
    finish_streaming(builder, stream_reader(stream))
}

/// The token's version, provided it still belongs to a live file in the
/// token's folder
fn resolve(state: &AppState, token: &FileToken) -> Result<(FileMetadata, FileVersion)> {
    let missing = || StorageError::NotFound(format!("file {} in {}", token.file_id, token.folder_url));
    let file = state.reader.file_by_id(&token.file_id)?.ok_or_else(missing)?;
    let folder = state.reader.folder(&token.folder_url)?.ok_or_else(missing)?;
    if folder.id != file.folder_id {
        return Err(missing());
    }
    let version = state.reader.version(&token.version_id)?.ok_or_else(missing)?;
    if version.file_id != file.unique_id {
        return Err(missing());
    }
    Ok((file, version))
}

/// `inline|attachment; filename="<ascii>"; filename*=UTF-8''<pct>`
pub fn content_disposition(name: &str, attachment: bool) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        if attachment { "attachment" } else { "inline" },
        fallback,
        pct_encode(name)
    )
}
