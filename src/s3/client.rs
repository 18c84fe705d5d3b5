//! S3 operations built on the signer and a `Transport`
//!
//! - Path-style URLs (`endpoint/bucket/key`)
//! - UNSIGNED-PAYLOAD for streamed PUT bodies (skips SHA256 of the body)
//! - SHA256 + Content-MD5 for the small multipart completion body
//! - Automatic retry with jitter for control requests (list, head, delete, abort)
//!
//! Transfer requests (object and part bodies) are not retried here; the
//! transfer engine owns their retry and cancellation.

use crate::s3::credentials::CredentialStore;
use crate::s3::error::{Result, S3Error};
use crate::s3::signer::{HttpRequest, PayloadHash, RequestSigner, SignedRequest};
use crate::s3::transport::{execute_cancellable, RequestBody, Response, Transport};
use crate::s3::types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse, DeleteResult,
    ListingPage, ObjectMetadata, UploadResult,
};
use crate::s3::xml;
use bytes::Bytes;
use chrono::Utc;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use rand::Rng;
use std::borrow::Cow;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Retries for control requests
const MAX_RETRIES: u32 = 3;

/// S3 client over a pluggable transport
///
/// Clone is cheap - every field is shared.
#[derive(Clone)]
pub struct S3Client {
    transport: Arc<dyn Transport>,
    /// AWS SigV4 signer (with signing key cache)
    signer: Arc<RequestSigner>,
    credentials: Arc<CredentialStore>,
    endpoint: String,
    /// Per-request deadline
    timeout: Duration,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("endpoint", &self.endpoint)
            .field("region", &self.signer.region())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl S3Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        region: Option<String>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            transport,
            signer: Arc::new(RequestSigner::new(region)),
            credentials,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Sign with the current credential snapshot at the current time
    fn sign(&self, request: HttpRequest) -> Result<SignedRequest> {
        let credentials = self.credentials.current();
        self.signer.sign(request, &credentials, Utc::now())
    }

    /// Sign, execute and map non-2xx statuses to errors
    async fn send(
        &self,
        request: HttpRequest,
        body: RequestBody,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response> {
        let signed = self.sign(request)?;
        let response = match cancel {
            Some(token) => {
                execute_cancellable(self.transport.as_ref(), signed, body, self.timeout, token)
                    .await?
            }
            None => self.transport.execute(signed, body, self.timeout).await?,
        };
        response.error_for_status().await
    }

    /// Send a control request with automatic retry on transient failures.
    ///
    /// Retries up to 3 times with exponential backoff + jitter.
    /// Returns (status, headers, body_bytes) on success or the last error.
    async fn request_with_retry(
        &self,
        request: HttpRequest,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut attempt = 0u32;
        loop {
            // Re-sign on each attempt (timestamp changes)
            let result = match self
                .send(request.clone(), RequestBody::bytes(body.clone()), None)
                .await
            {
                Ok(response) => {
                    let status = response.status;
                    let headers = response.headers.clone();
                    response.bytes().await.map(|bytes| (status, headers, bytes))
                }
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let base_ms = 100u64 << attempt;
                    let jitter = rand::thread_rng().gen_range(0..=base_ms / 5);
                    tracing::debug!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        error = %e,
                        "retrying s3 request"
                    );
                    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Encode an S3 key, preserving forward slashes
    /// Returns Cow::Borrowed when no encoding is needed (common case = zero allocation)
    fn encode_s3_key(key: &str) -> Cow<str> {
        let needs_encoding = key.bytes().any(|b| {
            !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/')
        });

        if !needs_encoding {
            return Cow::Borrowed(key);
        }

        let mut result = String::with_capacity(key.len() + 32);
        for byte in key.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    result.push(byte as char);
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        Cow::Owned(result)
    }

    /// Full URL of an object
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        let encoded_key = Self::encode_s3_key(key);
        let mut url =
            String::with_capacity(self.endpoint.len() + 2 + bucket.len() + encoded_key.len());
        url.push_str(&self.endpoint);
        url.push('/');
        url.push_str(bucket);
        url.push('/');
        url.push_str(&encoded_key);
        url
    }

    fn bucket_url(&self, bucket: &str) -> String {
        let mut url = String::with_capacity(self.endpoint.len() + 1 + bucket.len());
        url.push_str(&self.endpoint);
        url.push('/');
        url.push_str(bucket);
        url
    }

    /// Object URL with an `uploadId` query (plus `partNumber` for parts)
    fn upload_url(&self, bucket: &str, key: &str, upload_id: &str, part_number: Option<u32>) -> String {
        let mut url = self.object_url(bucket, key);
        url.push('?');
        if let Some(part_number) = part_number {
            let _ = write!(url, "partNumber={}&", part_number);
        }
        url.push_str("uploadId=");
        Self::url_encode_into(&mut url, upload_id);
        url
    }

    /// Encode a string for use in a URL query parameter value (RFC 3986).
    /// Writes directly into the target buffer - zero intermediate allocation.
    fn url_encode_into(buf: &mut String, s: &str) {
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    buf.push(byte as char);
                }
                _ => {
                    buf.push('%');
                    buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
    }

    /// Build the full URL for a ListObjectsV2 request.
    ///
    /// Parameters are ordered alphabetically (c, d, l, m, p) so the signer's
    /// canonical query string fast path can skip re-sorting.
    pub fn build_list_url(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: u32,
    ) -> String {
        let base_url = self.bucket_url(bucket);

        let mut url = String::with_capacity(base_url.len() + 256);
        url.push_str(&base_url);
        url.push_str("/?");

        if let Some(token) = continuation_token {
            url.push_str("continuation-token=");
            Self::url_encode_into(&mut url, token);
            url.push('&');
        }
        if let Some(d) = delimiter {
            url.push_str("delimiter=");
            Self::url_encode_into(&mut url, d);
            url.push('&');
        }
        url.push_str("list-type=2&max-keys=");
        let _ = write!(url, "{}", max_keys);
        if let Some(p) = prefix {
            url.push_str("&prefix=");
            Self::url_encode_into(&mut url, p);
        }

        url
    }

    /// List one page of objects (S3 ListObjectsV2)
    ///
    /// Automatically retries on transient failures.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: u32,
    ) -> Result<ListingPage> {
        let url = self.build_list_url(bucket, prefix, delimiter, continuation_token, max_keys);
        let (_, _, body) = self
            .request_with_retry(HttpRequest::new(Method::GET, url), Bytes::new())
            .await?;
        xml::parse_list_response(&body)
    }

    /// Upload a whole object with a single streamed PUT
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let location = self.object_url(bucket, key);
        let request = HttpRequest::new(Method::PUT, location.clone())
            .header("content-type", "application/octet-stream")
            .header("content-length", body.len().to_string())
            .payload(PayloadHash::Unsigned);

        let response = self.send(request, body, Some(cancel)).await?;
        let etag = response.etag().unwrap_or_default();
        let status_code = response.status.as_u16();
        // Drain body to return connection to pool
        let _ = response.bytes().await;

        Ok(UploadResult {
            status_code,
            etag,
            location,
        })
    }

    /// GET an object, optionally a byte range `[start, end)` guarded by `If-Match`.
    ///
    /// Returns the response with its body still streaming.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
        if_match: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut request = HttpRequest::new(Method::GET, self.object_url(bucket, key));
        if let Some((start, end)) = range {
            if end <= start {
                return Err(S3Error::InvalidRequest(format!(
                    "empty byte range {}..{}",
                    start, end
                )));
            }
            request = request.header("range", format!("bytes={}-{}", start, end - 1));
        }
        if let Some(etag) = if_match {
            request = request.header("if-match", format!("\"{}\"", etag));
        }
        self.send(request, RequestBody::empty(), Some(cancel)).await
    }

    /// Fetch object metadata (HEAD)
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let request = HttpRequest::new(Method::HEAD, self.object_url(bucket, key));
        let (status, headers, _) = self.request_with_retry(request, Bytes::new()).await?;

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_length = header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| S3Error::InvalidResponse("HEAD without Content-Length".to_string()))?;

        Ok(ObjectMetadata {
            status_code: status.as_u16(),
            content_length,
            etag: header("etag")
                .map(|e| crate::s3::types::normalize_etag(&e))
                .unwrap_or_default(),
            last_modified: header("last-modified"),
            content_type: header("content-type"),
        })
    }

    /// Delete an object
    ///
    /// Automatically retries on transient failures.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<DeleteResult> {
        let request = HttpRequest::new(Method::DELETE, self.object_url(bucket, key));
        let (status, _, _) = self.request_with_retry(request, Bytes::new()).await?;
        Ok(DeleteResult {
            status_code: status.as_u16(),
        })
    }

    /// Query-string authenticated GET URL for an object
    pub fn presigned_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        let credentials = self.credentials.current();
        self.signer.presign(
            &Method::GET,
            &self.object_url(bucket, key),
            &credentials,
            Utc::now(),
            expires_in,
        )
    }

    // =========================================================================
    // Multipart Upload Operations
    // =========================================================================

    /// Initiate a multipart upload (CreateMultipartUpload)
    ///
    /// Returns an upload ID that must be used in subsequent UploadPart and
    /// CompleteMultipartUpload or AbortMultipartUpload calls.
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<CreateMultipartUploadResponse> {
        let url = format!("{}?uploads", self.object_url(bucket, key));
        let request = HttpRequest::new(Method::POST, url)
            .header("content-type", "application/octet-stream");

        let response = self.send(request, RequestBody::empty(), Some(cancel)).await?;
        let body = response.bytes().await?;
        xml::parse_create_multipart_response(&body)
    }

    /// Upload a part of a multipart upload (UploadPart)
    ///
    /// Part numbers are 1-indexed (1 to 10000).
    /// Returns the ETag of the uploaded part.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: RequestBody,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.upload_url(bucket, key, upload_id, Some(part_number));
        // UNSIGNED-PAYLOAD avoids hashing large parts
        let request = HttpRequest::new(Method::PUT, url)
            .header("content-length", body.len().to_string())
            .payload(PayloadHash::Unsigned);

        let response = self.send(request, body, Some(cancel)).await?;
        let etag = response.etag();
        let _ = response.bytes().await;

        etag.ok_or_else(|| {
            S3Error::InvalidResponse(format!("UploadPart {} returned no ETag", part_number))
        })
    }

    /// Complete a multipart upload (CompleteMultipartUpload)
    ///
    /// Parts must be sorted by part number.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        cancel: &CancellationToken,
    ) -> Result<CompleteMultipartUploadResponse> {
        let url = self.upload_url(bucket, key, upload_id, None);
        let xml_bytes = Bytes::from(xml::complete_multipart_body(parts));

        let md5_hash = md5::compute(&xml_bytes);
        let md5_base64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &md5_hash[..]);

        // Sign with actual body hash (XML is small)
        let request = HttpRequest::new(Method::POST, url)
            .header("content-type", "application/xml")
            .header("content-length", xml_bytes.len().to_string())
            .header("content-md5", md5_base64)
            .payload(PayloadHash::for_bytes(&xml_bytes));

        let response = self
            .send(request, RequestBody::bytes(xml_bytes), Some(cancel))
            .await?;
        let body = response.bytes().await?;
        xml::parse_complete_multipart_response(&body)
    }

    /// Abort a multipart upload (AbortMultipartUpload)
    ///
    /// Cancels the upload and deletes all uploaded parts.
    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let url = self.upload_url(bucket, key, upload_id, None);
        self.request_with_retry(HttpRequest::new(Method::DELETE, url), Bytes::new())
            .await?;
        Ok(())
    }
}
