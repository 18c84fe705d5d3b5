//! HTTP transport for signed S3 requests
//!
//! `Transport` is the seam between request construction and the network.
//! `HttpTransport` is the production implementation:
//! - HTTP/1.1 hyper client with a tuned idle pool (shared, cheap to clone)
//! - TCP_NODELAY and keepalive, native-tls for TLS
//! - Streaming request bodies (files are read in chunks, never buffered whole)
//! - Streaming response bodies
//! - One deadline covering the request and the body reads

use crate::s3::error::{Result, S3Error};
use crate::s3::signer::SignedRequest;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::{Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// Size of the chunks request bodies are streamed in
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Callback receiving the cumulative number of body bytes sent
pub type ByteObserver = Arc<dyn Fn(u64) + Send + Sync>;

/// Where request body bytes come from
#[derive(Debug, Clone)]
enum BodySource {
    Empty,
    Bytes(Bytes),
    FileRange {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

/// Outgoing request body, streamed on demand
#[derive(Clone)]
pub struct RequestBody {
    source: BodySource,
    observer: Option<ByteObserver>,
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("source", &self.source)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            source: BodySource::Empty,
            observer: None,
        }
    }

    pub fn bytes(data: Bytes) -> Self {
        Self {
            source: BodySource::Bytes(data),
            observer: None,
        }
    }

    /// `length` bytes of the file at `path` starting at `offset`
    pub fn file_range(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            source: BodySource::FileRange {
                path: path.into(),
                offset,
                length,
            },
            observer: None,
        }
    }

    /// Report cumulative bytes as the body is streamed
    pub fn with_observer(mut self, observer: ByteObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Body length in bytes
    pub fn len(&self) -> u64 {
        match &self.source {
            BodySource::Empty => 0,
            BodySource::Bytes(data) => data.len() as u64,
            BodySource::FileRange { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the body in chunks, notifying the observer after each chunk
    pub fn into_stream(self) -> BoxStream<'static, std::io::Result<Bytes>> {
        let chunks: BoxStream<'static, std::io::Result<Bytes>> = match self.source {
            BodySource::Empty => stream::empty().boxed(),
            BodySource::Bytes(data) => {
                let len = data.len();
                stream::iter((0..len).step_by(BODY_CHUNK_SIZE).map(move |start| {
                    let end = (start + BODY_CHUNK_SIZE).min(len);
                    Ok(data.slice(start..end))
                }))
                .boxed()
            }
            BodySource::FileRange {
                path,
                offset,
                length,
            } => stream::once(async move {
                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                Ok::<_, std::io::Error>(ReaderStream::with_capacity(
                    file.take(length),
                    BODY_CHUNK_SIZE,
                ))
            })
            .try_flatten()
            .boxed(),
        };

        match self.observer {
            Some(observer) => {
                let mut sent = 0u64;
                chunks
                    .inspect_ok(move |chunk| {
                        sent += chunk.len() as u64;
                        observer(sent);
                    })
                    .boxed()
            }
            None => chunks,
        }
    }
}

/// Streaming response body
pub type ResponseBody = BoxStream<'static, Result<Bytes>>;

/// A response with its body not yet consumed
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Response with an in-memory body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let body = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self {
            status,
            headers,
            body,
        }
    }

    /// Collect the whole body
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// ETag header without quotes
    pub fn etag(&self) -> Option<String> {
        self.header_str("etag")
            .map(crate::s3::types::normalize_etag)
            .filter(|e| !e.is_empty())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Turn a non-2xx response into the matching error
    pub async fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.bytes().await.unwrap_or_default();
        Err(S3Error::from_response(status, &body))
    }
}

/// Executes signed requests.
///
/// Implementations must be safe to call concurrently from many tasks.
/// Non-2xx statuses are returned as responses, not errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: SignedRequest,
        body: RequestBody,
        deadline: Duration,
    ) -> Result<Response>;
}

/// Execute a request, dropping it (and failing with `Cancelled`) once the
/// token fires.
pub async fn execute_cancellable(
    transport: &dyn Transport,
    request: SignedRequest,
    body: RequestBody,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Response> {
    if cancel.is_cancelled() {
        return Err(S3Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(S3Error::Cancelled),
        result = transport.execute(request, body, deadline) => result,
    }
}

type OutgoingBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// hyper-based transport
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct HttpTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, OutgoingBody>,
}

impl HttpTransport {
    /// Create a transport with tuned connection settings
    ///
    /// - HTTP/1.1 only
    /// - 1024 idle connections per host, 90s idle timeout
    /// - TCP_NODELAY, 90s TCP keepalive, 10s connect timeout
    pub fn new(insecure_tls: bool) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| S3Error::Network(format!("Failed to build TLS connector: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(1024)
            .set_host(true)
            .build(https);

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: SignedRequest,
        body: RequestBody,
        deadline: Duration,
    ) -> Result<Response> {
        let deadline_at = tokio::time::Instant::now() + deadline;
        let content_length = body.len();

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(&request.url);
        for (key, value) in request.headers.iter() {
            builder = builder.header(key, value);
        }
        if content_length > 0 && !request.headers.contains_key("content-length") {
            builder = builder.header(CONTENT_LENGTH, content_length);
        }

        let outgoing: OutgoingBody =
            StreamBody::new(body.into_stream().map_ok(Frame::data)).boxed_unsync();
        let http_request = builder.body(outgoing)?;

        let response = match tokio::time::timeout_at(deadline_at, self.client.request(http_request)).await {
            Err(_) => return Err(S3Error::Timeout(deadline)),
            Ok(Err(e)) => return Err(S3Error::Network(format!("Request failed: {}", e))),
            Ok(Ok(response)) => response,
        };

        let (parts, incoming) = response.into_parts();
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = parts.status.as_u16(),
            "s3 response"
        );

        let frames = Box::pin(BodyStream::new(incoming));
        let body = stream::unfold(Some(frames), move |state| async move {
            let mut frames = state?;
            loop {
                match tokio::time::timeout_at(deadline_at, frames.next()).await {
                    Err(_) => return Some((Err(S3Error::Timeout(deadline)), None)),
                    Ok(None) => return None,
                    Ok(Some(Err(e))) => {
                        return Some((Err(S3Error::Network(format!("Body error: {}", e))), None))
                    }
                    Ok(Some(Ok(frame))) => {
                        // Trailers carry no payload
                        if let Ok(data) = frame.into_data() {
                            if !data.is_empty() {
                                return Some((Ok(data), Some(frames)));
                            }
                        }
                    }
                }
            }
        })
        .boxed();

        Ok(Response {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}
