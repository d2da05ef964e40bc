//! Streaming request and response bodies
//!
//! File content never sits in memory whole. Delivery reads a version on the
//! blocking pool and hands chunks to hyper through a bounded channel; uploads
//! run the other way, feeding body frames to a blocking [`Read`] the file
//! manager writes from.

use bytes::{Buf, Bytes};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Frame};
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response
pub type HttpBody = BoxBody<Bytes, io::Error>;

/// Body of a request as handed to [`crate::route`]
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Bytes read from a version per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the blocking side and hyper
const CHANNEL_DEPTH: usize = 4;

pub fn full(bytes: impl Into<Bytes>) -> HttpBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Request body from bytes already in memory
pub fn request_body(bytes: impl Into<Bytes>) -> RequestBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Collect a body of at most `limit` bytes
pub async fn collect_limited(body: RequestBody, limit: usize) -> Result<Bytes, BoxError> {
    Ok(collect_limited_boxed(body, limit).await?.to_bytes())
}

// Boxed outside the async fn so the `Send` check sees concrete lifetimes
// (works around a higher-ranked `From` inference error in async bodies).
fn collect_limited_boxed(
    body: RequestBody,
    limit: usize,
) -> Pin<Box<dyn std::future::Future<Output = Result<http_body_util::Collected<Bytes>, BoxError>> + Send>> {
    Box::pin(Limited::new(body, limit).collect())
}

/// Response body fed by a channel
struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}

/// Stream `reader` as a response body. The reader runs on the blocking pool
/// and is dropped once it is exhausted or the client goes away.
pub fn stream_reader<R: Read + Send + 'static>(reader: R) -> HttpBody {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || pump_reader(reader, tx));
    ChannelBody { rx }.boxed()
}

fn pump_reader<R: Read>(mut reader: R, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// Blocking reader over request body chunks forwarded by [`forward_body`]
pub struct BodyReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

pub fn body_channel() -> (mpsc::Sender<io::Result<Bytes>>, BodyReader) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        tx,
        BodyReader {
            rx,
            current: Bytes::new(),
        },
    )
}

/// Forward the data frames of `body` until it ends or the reader hangs up
pub async fn forward_body(mut body: RequestBody, tx: mpsc::Sender<io::Result<Bytes>>) {
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if tx.send(Ok(data)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e))).await;
                return;
            }
        }
    }
}
