//! Integration tests for the HTTP layer.
//!
//! Most tests call `route` directly; the last one serves a node on a real
//! socket and pulls from it through `HttpTransport`.

use blobfs_core::lifecycle::LifecycleSettings;
use blobfs_core::{
    AccessToken, Compression, ContainerConfig, ContainerRegistry, FileManager, FileToken,
    MetadataRepository, NodeInfo, PullConfig, ReplicationChange, ReplicationEngine,
    ReplicationSchema, SchedulerSettings, SqliteMetadataStore, TokenService,
};
use blobfs_http::api::{ACCESS_TOKEN_HEADER, FileInfo, SessionLink, UploadResult};
use blobfs_http::body::{BoxError, request_body};
use blobfs_http::replication_handlers::decode_file_frame;
use blobfs_http::{AppState, ErrorBody, HttpTransport, route};
use bytes::Bytes;
use chrono::Duration;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, HeaderMap, HeaderValue};
use hyper::Method;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

struct Fixture {
    state: Arc<AppState>,
    _dir: TempDir,
}

impl Fixture {
    fn metadata(&self) -> &Arc<dyn MetadataRepository> {
        self.state.files.metadata()
    }

    fn node_id(&self) -> Uuid {
        self.state.files.local_node_id()
    }

    fn token(&self) -> AccessToken {
        self.state.tokens.mint_access_token(Some("alice".into())).unwrap()
    }

    async fn call(&self, method: Method, path: &str, query: &str, headers: HeaderMap, body: &[u8]) -> (u16, HeaderMap, Vec<u8>) {
        let resp = route(
            &self.state,
            &method,
            path,
            query,
            &headers,
            request_body(Bytes::copy_from_slice(body)),
        )
        .await;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }

    async fn api(&self, method: Method, path: &str, query: &str, body: &[u8]) -> (u16, Vec<u8>) {
        let (status, _, body) = self.call(method, path, query, auth(&self.token()), body).await;
        (status, body)
    }

    async fn upload(&self, folder: &str, name: &str, content: &[u8]) -> UploadResult {
        let query = format!("folder={}&name={}", folder, name);
        let (status, body) = self.api(Method::PUT, "/api/files", &query, content).await;
        assert_eq!(status, 201, "{}", String::from_utf8_lossy(&body));
        serde_json::from_slice(&body).unwrap()
    }
}

fn fixture(name: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteMetadataStore::open_in_memory(4, name).unwrap());
    let registry = Arc::new(ContainerRegistry::new(store.clone(), LifecycleSettings::default()));
    registry
        .reconcile(&[ContainerConfig {
            name: "main".into(),
            path: dir.path().join("main").to_string_lossy().into_owned(),
            folder: "/".into(),
        }])
        .unwrap();
    let files = Arc::new(FileManager::new(registry).unwrap());
    let transport = Arc::new(HttpTransport::new(std::time::Duration::from_secs(10), Compression::Zstd).unwrap());
    let engine = Arc::new(ReplicationEngine::new(files, transport, None, SchedulerSettings::default()));
    let tokens = Arc::new(TokenService::new(store, Duration::hours(1)));
    Fixture {
        state: Arc::new(AppState::new(engine, tokens, "http://localhost/d")),
        _dir: dir,
    }
}

fn auth(token: &AccessToken) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCESS_TOKEN_HEADER,
        HeaderValue::from_str(&token.unique_id.to_string()).unwrap(),
    );
    headers
}

/// Body that does not know its length up front
struct Chunked(Vec<Bytes>);

impl Body for Chunked {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let chunks = &mut self.get_mut().0;
        Poll::Ready((!chunks.is_empty()).then(|| Ok(Frame::data(chunks.remove(0)))))
    }
}

fn error_kind(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body).unwrap().kind
}

#[tokio::test]
async fn test_health() {
    let f = fixture("a");
    let (status, _, _) = f.call(Method::GET, "/health", "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    let (status, _, body) = f.call(Method::GET, "/nope", "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 404);
    assert_eq!(error_kind(&body), "not_found");
}

#[tokio::test]
async fn test_api_requires_token() {
    let f = fixture("a");
    let (status, _, _) = f.call(Method::GET, "/api/files", "folder=/", HeaderMap::new(), &[]).await;
    assert_eq!(status, 401);

    let mut headers = HeaderMap::new();
    headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static("not-a-uuid"));
    let (status, _, _) = f.call(Method::GET, "/api/files", "folder=/", headers, &[]).await;
    assert_eq!(status, 401);

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCESS_TOKEN_HEADER,
        HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
    );
    let (status, _, _) = f.call(Method::GET, "/api/files", "folder=/", headers, &[]).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_upload_describe_delete() {
    let f = fixture("a");
    let first = f.upload("/docs", "plan.txt", b"v1").await;
    let second = f.upload("/docs", "plan.txt", b"version 2").await;
    assert_eq!(first.file_id, second.file_id);
    assert_eq!(second.size, 9);

    let (status, body) = f.api(Method::GET, "/api/files", "folder=/docs&name=plan.txt", &[]).await;
    assert_eq!(status, 200);
    let info: FileInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(info.file.current_version_id, second.version_id);
    assert_eq!(info.versions.len(), 2);
    assert!(info.versions.iter().all(|v| v.modified_by == "alice"));

    let (status, body) = f.api(Method::GET, "/api/files", "folder=/docs", &[]).await;
    assert_eq!(status, 200);
    let listing: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing.len(), 1);

    let (status, _) = f.api(Method::DELETE, "/api/files", "folder=/docs&name=plan.txt", &[]).await;
    assert_eq!(status, 204);
    let (status, _) = f.api(Method::GET, "/api/files", "folder=/docs&name=plan.txt", &[]).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_upload_rejects_missing_name() {
    let f = fixture("a");
    let (status, body) = f.api(Method::PUT, "/api/files", "folder=/docs", b"x").await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "invalid_request");
}

#[tokio::test]
async fn test_session_link_delivers_content() {
    let f = fixture("a");
    f.upload("/docs", "r%C3%A9sum%C3%A9.txt", b"hello delivery").await;

    let (status, body) = f
        .api(Method::POST, "/api/sessions", "folder=/docs&name=r%C3%A9sum%C3%A9.txt", &[])
        .await;
    assert_eq!(status, 200);
    let session: SessionLink = serde_json::from_slice(&body).unwrap();
    let path = session.link.strip_prefix("http://localhost").unwrap();
    assert!(path.starts_with("/d/"));

    let (status, headers, body) = f.call(Method::GET, path, "download=1", HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hello delivery");
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "14");
    let disposition = headers.get(CONTENT_DISPOSITION).unwrap().to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.txt"));

    let (status, headers, body) = f.call(Method::HEAD, path, "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "14");
}

#[tokio::test]
async fn test_large_file_streams_byte_exact() {
    let f = fixture("a");
    let content: Vec<u8> = (0..3 * 1024 * 1024 + 7).map(|i: u32| (i % 251) as u8).collect();
    f.upload("/media", "big.bin", &content).await;

    let (_, body) = f
        .api(Method::POST, "/api/sessions", "folder=/media&name=big.bin", &[])
        .await;
    let session: SessionLink = serde_json::from_slice(&body).unwrap();
    let path = session.link.strip_prefix("http://localhost").unwrap();
    let (status, headers, body) = f.call(Method::GET, path, "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), &content.len().to_string());
    assert_eq!(body.len(), content.len());
    assert!(body == content);
}

#[tokio::test]
async fn test_streamed_upload_uses_content_length() {
    let f = fixture("a");
    let chunks: Vec<Bytes> = ["first ", "second ", "third"]
        .into_iter()
        .map(|s: &'static str| Bytes::from_static(s.as_bytes()))
        .collect();
    let query = "folder=/docs&name=chunked.txt";

    let unsized_body = Chunked(chunks.clone()).boxed_unsync();
    let resp = route(&f.state, &Method::PUT, "/api/files", query, &auth(&f.token()), unsized_body).await;
    assert_eq!(resp.status().as_u16(), 411);

    let mut headers = auth(&f.token());
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("18"));
    let resp = route(&f.state, &Method::PUT, "/api/files", query, &headers, Chunked(chunks).boxed_unsync()).await;
    assert_eq!(resp.status().as_u16(), 201);
    let file = f.state.reader.file("/docs", "chunked.txt").unwrap().unwrap();
    let content = f.state.reader.read_file(&file).unwrap().unwrap().into_bytes().unwrap();
    assert_eq!(content, b"first second third");
}

#[tokio::test]
async fn test_session_reuses_caller_token() {
    let f = fixture("a");
    f.upload("/docs", "a.txt", b"abc").await;
    let caller = f.token();
    for _ in 0..3 {
        let (status, _, body) = f
            .call(Method::POST, "/api/sessions", "folder=/docs&name=a.txt", auth(&caller), &[])
            .await;
        assert_eq!(status, 200);
        let session: SessionLink = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.expires, caller.expires);
        let token = FileToken::decode(&session.token).unwrap();
        assert_eq!(token.token_id, caller.unique_id);
    }
    // One token for the upload, one for the caller; sessions add none
    let far_future = chrono::Utc::now() + Duration::days(10_000);
    assert_eq!(f.metadata().purge_expired_tokens(far_future).unwrap(), 2);
}

#[tokio::test]
async fn test_session_for_old_version() {
    let f = fixture("a");
    let first = f.upload("/docs", "a.txt", b"old").await;
    f.upload("/docs", "a.txt", b"new").await;

    let query = format!("folder=/docs&name=a.txt&version={}", first.version_id);
    let (status, body) = f.api(Method::POST, "/api/sessions", &query, &[]).await;
    assert_eq!(status, 200);
    let session: SessionLink = serde_json::from_slice(&body).unwrap();
    let path = session.link.strip_prefix("http://localhost").unwrap();
    let (_, _, body) = f.call(Method::GET, path, "", HeaderMap::new(), &[]).await;
    assert_eq!(body, b"old");

    let query = format!("folder=/docs&name=a.txt&version={}", Uuid::new_v4());
    let (status, _) = f.api(Method::POST, "/api/sessions", &query, &[]).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_delivery_malformed_token() {
    let f = fixture("a");
    let (status, _, body) = f.call(Method::GET, "/d/%%%", "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "malformed_token");

    let (status, _, _) = f.call(Method::POST, "/d/abc", "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn test_delivery_expired_session() {
    let f = fixture("a");
    let upload = f.upload("/docs", "a.txt", b"secret").await;
    let mut expired = AccessToken {
        id: 0,
        unique_id: Uuid::new_v4(),
        expires: chrono::Utc::now() - Duration::minutes(5),
        security_id: None,
    };
    expired.id = f.metadata().insert_access_token(&expired).unwrap();
    let token = FileToken::new(expired.unique_id, upload.file_id, upload.version_id, "/docs");

    let path = format!("/d/{}", token.encode());
    let (status, _, body) = f.call(Method::GET, &path, "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "session_expired");
}

#[tokio::test]
async fn test_delivery_wrong_folder() {
    let f = fixture("a");
    let upload = f.upload("/docs", "a.txt", b"secret").await;
    let access = f.token();
    let token = FileToken::new(access.unique_id, upload.file_id, upload.version_id, "/other");
    let path = format!("/d/{}", token.encode());
    let (status, _, _) = f.call(Method::GET, &path, "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_replication_info_and_schema() {
    let f = fixture("a");
    let (status, _, body) = f.call(Method::GET, "/replication/info", "", HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    let info: NodeInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(info.node_id, f.node_id());
    assert_eq!(info.node_name, "a");

    let peer = ReplicationSchema::new(Uuid::new_v4(), "b", None);
    let (status, _, body) = f
        .call(Method::POST, "/replication/schema", "", HeaderMap::new(), &serde_json::to_vec(&peer).unwrap())
        .await;
    assert_eq!(status, 200);
    let answer: ReplicationSchema = serde_json::from_slice(&body).unwrap();
    assert_eq!(answer.node_id, f.node_id());
    assert!(f.metadata().node_by_unique_id(&peer.node_id).unwrap().is_some());

    let own = ReplicationSchema::new(f.node_id(), "a", None);
    let (status, _, _) = f
        .call(Method::POST, "/replication/schema", "", HeaderMap::new(), &serde_json::to_vec(&own).unwrap())
        .await;
    assert_eq!(status, 400);

    let (status, _, _) = f.call(Method::POST, "/replication/schema", "", HeaderMap::new(), b"{").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_replication_changes_and_file() {
    let f = fixture("a");
    let upload = f.upload("/docs/sub", "a.txt", &b"replicate me ".repeat(100)).await;

    let query = format!("requester={}&folder=%2Fdocs&recursive=true", Uuid::new_v4());
    let (status, _, body) = f.call(Method::GET, "/replication/changes", &query, HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    let changes: Vec<ReplicationChange> = serde_json::from_slice(&body).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].file_id(), upload.file_id);

    let query = format!("requester={}&folder=%2Fdocs&recursive=false", Uuid::new_v4());
    let (_, _, body) = f.call(Method::GET, "/replication/changes", &query, HeaderMap::new(), &[]).await;
    let changes: Vec<ReplicationChange> = serde_json::from_slice(&body).unwrap();
    assert!(changes.is_empty());

    let query = format!(
        "folder=%2Fdocs%2Fsub&file={}&version={}&compression=zstd",
        upload.file_id, upload.version_id
    );
    let (status, _, body) = f.call(Method::GET, "/replication/file", &query, HeaderMap::new(), &[]).await;
    assert_eq!(status, 200);
    assert!(body.len() < 1300);
    let file = decode_file_frame(&body).unwrap();
    file.verify().unwrap();
    assert_eq!(file.content.len(), 1300);

    let query = format!("folder=%2Fother&file={}&version={}", upload.file_id, upload.version_id);
    let (status, _, _) = f.call(Method::GET, "/replication/file", &query, HeaderMap::new(), &[]).await;
    assert_eq!(status, 404);

    let (status, _, _) = f.call(Method::GET, "/replication/changes", "folder=%2Fdocs", HeaderMap::new(), &[]).await;
    assert_eq!(status, 400);
}

async fn serve(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    blobfs_http::handle_request(req, state.clone())
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_pull_over_http() {
    let a = fixture("a");
    let b = fixture("b");
    let upload = a.upload("/docs", "a.txt", &b"over the wire ".repeat(50)).await;
    let url = serve(a.state.clone()).await;

    let transport = HttpTransport::new(std::time::Duration::from_secs(10), Compression::None).unwrap();
    let info = transport.get_info(&url).await.unwrap();
    assert_eq!(info.node_id, a.node_id());

    b.state
        .engine
        .configure(&[PullConfig {
            folder: "/docs".into(),
            source_name: "a".into(),
            source_id: a.node_id(),
            source_url: url,
            recursive: true,
            soft_delete: false,
        }])
        .unwrap();
    let (_tx, rx) = watch::channel(false);
    let reports = b.state.engine.run_cycle(&rx, true).await.unwrap();
    let report = reports[0].as_ref().unwrap();
    assert_eq!(report.applied, 1);

    let replica = b.state.files.version(&upload.version_id).unwrap().unwrap();
    assert_eq!(replica.created_storage_id, a.node_id());
    let file = b.state.files.file("/docs", "a.txt").unwrap().unwrap();
    let content = b.state.files.read_file(&file).unwrap().unwrap().into_bytes().unwrap();
    assert_eq!(content, b"over the wire ".repeat(50));

    // schema exchange through the real transport
    let remote = b.state.engine.exchange_all().await.unwrap();
    assert_eq!(remote, 1);
}
