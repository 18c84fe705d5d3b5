//! In-memory S3 server behind the `Transport` trait

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use hyper::{HeaderMap, Method, StatusCode};
use s3xfer::config::TransferConfig;
use s3xfer::s3::{
    CredentialStore, Credentials, RequestBody, Response, S3Client, S3Error, SignedRequest,
    Transport,
};
use s3xfer::transfer::{TaskSnapshot, TransferManager};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const ENDPOINT: &str = "http://mock.s3.local";

/// One request as seen by the server
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub bucket: String,
    pub key: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl Call {
    pub fn part_number(&self) -> Option<u32> {
        self.query.get("partNumber").and_then(|n| n.parse().ok())
    }

    pub fn is_abort(&self) -> bool {
        self.method == Method::DELETE && self.query.contains_key("uploadId")
    }
}

struct StoredObject {
    data: Bytes,
    size: u64,
    etag: String,
}

struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, u64, String)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    next_upload: u32,
    calls: Vec<Call>,
    part_faults: HashMap<u32, (u32, u16)>,
    complete_faults: Option<(u32, u16)>,
    aborts: usize,
    completions: Vec<Vec<u32>>,
    hold_parts: bool,
    hold_reads: bool,
    discard_bodies: bool,
    corrupt_range_etags: bool,
    initiate_delay: Option<Duration>,
    replace_after_head: HashMap<(String, String), Bytes>,
}

#[derive(Default)]
pub struct MockS3 {
    state: Mutex<State>,
    held: AtomicUsize,
}

fn xml_response(status: StatusCode, xml: String) -> Response {
    Response::from_bytes(status, HeaderMap::new(), Bytes::from(xml))
}

fn error_response(status: u16, code: &str) -> Response {
    xml_response(
        StatusCode::from_u16(status).unwrap(),
        format!("<Error><Code>{}</Code><Message>injected {}</Message></Error>", code, status),
    )
}

fn etag_header(etag: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("etag", format!("\"{}\"", etag).parse().unwrap());
    headers
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string())
}

/// Split `http://host/bucket/key?query` into its parts
fn parse_url(url: &str) -> (String, String, BTreeMap<String, String>) {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path_and_query = after_scheme.find('/').map(|i| &after_scheme[i + 1..]).unwrap_or("");
    let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
    let (bucket, key) = path.split_once('/').unwrap_or((path, ""));

    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), decode(v)),
            None => (pair.to_string(), String::new()),
        })
        .collect();
    (bucket.to_string(), decode(key), query)
}

fn parse_range(header: &str) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl MockS3 {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Seed an object
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = format!("{:x}", md5::compute(&data));
        self.state().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                size: data.len() as u64,
                data,
                etag,
            },
        );
    }

    /// Stored bytes and ETag of an object
    pub fn object(&self, bucket: &str, key: &str) -> Option<(Bytes, String)> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| (o.data.clone(), o.etag.clone()))
    }

    pub fn object_size(&self, bucket: &str, key: &str) -> Option<u64> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.size)
    }

    /// Answer the next `times` uploads of `part` with `status`
    pub fn fail_part(&self, part: u32, times: u32, status: u16) {
        self.state().part_faults.insert(part, (times, status));
    }

    /// Answer the next `times` CompleteMultipartUpload calls with `status`
    pub fn fail_complete(&self, times: u32, status: u16) {
        self.state().complete_faults = Some((times, status));
    }

    /// Uploaded parts never get an answer
    pub fn hold_parts(&self) {
        self.state().hold_parts = true;
    }

    /// Object GETs never get an answer
    pub fn hold_reads(&self) {
        self.state().hold_reads = true;
    }

    /// CreateMultipartUpload opens the session, then answers after `delay`
    pub fn delay_initiate(&self, delay: Duration) {
        self.state().initiate_delay = Some(delay);
    }

    /// The object is overwritten with `data` right after its next HEAD
    pub fn replace_after_head(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state()
            .replace_after_head
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Only count uploaded object and part bytes
    pub fn discard_bodies(&self) {
        self.state().discard_bodies = true;
    }

    /// Ranged GETs report a different ETag than HEAD
    pub fn corrupt_range_etags(&self) {
        self.state().corrupt_range_etags = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn abort_count(&self) -> usize {
        self.state().aborts
    }

    /// Part numbers listed by each CompleteMultipartUpload, in request order
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.state().completions.clone()
    }

    /// Requests currently parked by `hold_parts` or `hold_reads`
    pub fn held_parts(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    fn put_object(&self, bucket: String, key: String, body: Bytes, size: u64) -> Response {
        let mut state = self.state();
        let etag = format!("{:x}", md5::compute(&body));
        let data = if state.discard_bodies { Bytes::new() } else { body };
        state
            .objects
            .insert((bucket, key), StoredObject { data, size, etag: etag.clone() });
        Response::from_bytes(StatusCode::OK, etag_header(&etag), Bytes::new())
    }

    fn create_upload(&self, bucket: String, key: String) -> Response {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.clone(),
                key: key.clone(),
                parts: BTreeMap::new(),
            },
        );
        xml_response(
            StatusCode::OK,
            format!(
                "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                bucket, key, upload_id
            ),
        )
    }

    async fn upload_part(&self, upload_id: &str, part: u32, body: Bytes, size: u64) -> Response {
        let fault = {
            let mut state = self.state();
            match state.part_faults.get_mut(&part) {
                Some((remaining, status)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };
        if let Some(status) = fault {
            return error_response(status, "InternalError");
        }

        if self.state().hold_parts {
            self.park().await;
        }

        let mut state = self.state();
        let etag = format!("part-{}-{:x}", part, md5::compute(&body));
        let data = if state.discard_bodies { Bytes::new() } else { body };
        match state.uploads.get_mut(upload_id) {
            Some(upload) => {
                upload.parts.insert(part, (data, size, etag.clone()));
                Response::from_bytes(StatusCode::OK, etag_header(&etag), Bytes::new())
            }
            None => error_response(404, "NoSuchUpload"),
        }
    }

    fn complete_upload(&self, upload_id: &str, body: &[u8]) -> Response {
        {
            let mut state = self.state();
            if let Some((remaining, status)) = state.complete_faults.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    return error_response(*status, "InternalError");
                }
            }
        }
        let body = String::from_utf8_lossy(body);
        let listed: Vec<u32> = body
            .split("<PartNumber>")
            .skip(1)
            .filter_map(|s| s.split("</PartNumber>").next()?.parse().ok())
            .collect();

        let mut state = self.state();
        state.completions.push(listed.clone());
        let Some(upload) = state.uploads.remove(upload_id) else {
            return error_response(404, "NoSuchUpload");
        };
        if listed.len() != upload.parts.len() || listed.windows(2).any(|w| w[0] >= w[1]) {
            return error_response(400, "InvalidPartOrder");
        }

        let mut data = BytesMut::new();
        let mut size = 0;
        let mut etags = String::new();
        for (data_part, part_size, etag) in upload.parts.values() {
            data.extend_from_slice(data_part);
            size += part_size;
            etags.push_str(etag);
        }
        let etag = format!("{:x}-{}", md5::compute(etags.as_bytes()), upload.parts.len());
        state.objects.insert(
            (upload.bucket.clone(), upload.key.clone()),
            StoredObject {
                data: data.freeze(),
                size,
                etag: etag.clone(),
            },
        );

        xml_response(
            StatusCode::OK,
            format!(
                "<CompleteMultipartUploadResult><Location>{}/{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>\"{}\"</ETag></CompleteMultipartUploadResult>",
                ENDPOINT, upload.bucket, upload.key, upload.bucket, upload.key, etag
            ),
        )
    }

    fn list(&self, bucket: &str, query: &BTreeMap<String, String>) -> Response {
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let delimiter = query.get("delimiter").cloned().filter(|d| !d.is_empty());
        let max_keys: usize = query
            .get("max-keys")
            .and_then(|m| m.parse().ok())
            .unwrap_or(1000);
        let after = query
            .get("continuation-token")
            .and_then(|t| t.strip_prefix("after:"))
            .map(str::to_string);

        let state = self.state();
        let mut entries = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut last_key = None;
        let mut truncated = false;

        let candidates = state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(&prefix))
            .filter(|((_, k), _)| after.as_ref().map_or(true, |a| k > a));
        for ((_, key), object) in candidates {
            if entries.len() + prefixes.len() == max_keys {
                truncated = true;
                break;
            }
            if let Some(d) = &delimiter {
                if let Some(idx) = key[prefix.len()..].find(d.as_str()) {
                    let common = key[..prefix.len() + idx + d.len()].to_string();
                    if prefixes.last() != Some(&common) {
                        prefixes.push(common);
                    }
                    last_key = Some(key.clone());
                    continue;
                }
            }
            entries.push(format!(
                "<Contents><Key>{}</Key><LastModified>2026-01-22T20:44:33.000Z</LastModified><ETag>\"{}\"</ETag><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
                key, object.etag, object.size
            ));
            last_key = Some(key.clone());
        }

        let mut xml = String::from("<ListBucketResult>");
        xml.push_str(&format!("<Name>{}</Name><Prefix>{}</Prefix>", bucket, prefix));
        xml.push_str(&format!("<KeyCount>{}</KeyCount>", entries.len()));
        xml.push_str(&format!("<IsTruncated>{}</IsTruncated>", truncated));
        if truncated {
            if let Some(last) = last_key {
                xml.push_str(&format!("<NextContinuationToken>after:{}</NextContinuationToken>", last));
            }
        }
        for entry in entries {
            xml.push_str(&entry);
        }
        for p in prefixes {
            xml.push_str(&format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", p));
        }
        xml.push_str("</ListBucketResult>");
        xml_response(StatusCode::OK, xml)
    }

    fn get(&self, bucket: String, key: String, headers: &BTreeMap<String, String>, head: bool) -> Response {
        let state = self.state();
        let Some(object) = state.objects.get(&(bucket, key)) else {
            return if head {
                Response::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new())
            } else {
                error_response(404, "NoSuchKey")
            };
        };

        if let Some(expected) = headers.get("if-match") {
            if expected.trim_matches('"') != object.etag {
                return error_response(412, "PreconditionFailed");
            }
        }

        let range = headers.get("range").and_then(|r| parse_range(r));
        let mut response_headers = etag_header(&object.etag);
        response_headers.insert("last-modified", "Thu, 22 Jan 2026 20:44:33 GMT".parse().unwrap());
        response_headers.insert("content-type", "application/octet-stream".parse().unwrap());
        if head {
            response_headers.insert("content-length", object.size.to_string().parse().unwrap());
            return Response::from_bytes(StatusCode::OK, response_headers, Bytes::new());
        }

        match range {
            Some((start, end)) => {
                if state.corrupt_range_etags {
                    response_headers = etag_header("bogus");
                }
                let end = (end + 1).min(object.data.len());
                Response::from_bytes(
                    StatusCode::PARTIAL_CONTENT,
                    response_headers,
                    object.data.slice(start.min(end)..end),
                )
            }
            None => Response::from_bytes(StatusCode::OK, response_headers, object.data.clone()),
        }
    }

    fn delete(&self, bucket: String, key: String, query: &BTreeMap<String, String>) -> Response {
        let mut state = self.state();
        if let Some(upload_id) = query.get("uploadId") {
            state.aborts += 1;
            state.uploads.remove(upload_id);
        } else {
            state.objects.remove(&(bucket, key));
        }
        Response::from_bytes(StatusCode::NO_CONTENT, HeaderMap::new(), Bytes::new())
    }
}

impl MockS3 {
    /// Never returns; the client's cancellation drops the future
    async fn park(&self) {
        self.held.fetch_add(1, Ordering::SeqCst);
        let _guard = HeldGuard(&self.held);
        std::future::pending::<()>().await;
    }
}

struct HeldGuard<'a>(&'a AtomicUsize);

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockS3 {
    async fn execute(
        &self,
        request: SignedRequest,
        body: RequestBody,
        _deadline: Duration,
    ) -> s3xfer::s3::Result<Response> {
        let (bucket, key, query) = parse_url(&request.url);
        self.state().calls.push(Call {
            method: request.method.clone(),
            bucket: bucket.clone(),
            key: key.clone(),
            query: query.clone(),
            headers: request.headers.clone(),
        });

        // Read the whole body so byte observers fire
        let mut size = 0u64;
        let mut data = BytesMut::new();
        // Only payloads are dropped; the completion XML is always kept
        let discard = self.state().discard_bodies && request.method == Method::PUT;
        let mut chunks = body.into_stream();
        while let Some(chunk) = chunks.try_next().await.map_err(S3Error::Io)? {
            size += chunk.len() as u64;
            if !discard {
                data.extend_from_slice(&chunk);
            }
        }
        let data = data.freeze();

        let response = match request.method {
            Method::GET if key.is_empty() => self.list(&bucket, &query),
            Method::GET => {
                if self.state().hold_reads {
                    self.park().await;
                }
                self.get(bucket, key, &request.headers, false)
            }
            Method::HEAD => {
                let response = self.get(bucket.clone(), key.clone(), &request.headers, true);
                let replacement = self
                    .state()
                    .replace_after_head
                    .remove(&(bucket.clone(), key.clone()));
                if let Some(data) = replacement {
                    self.insert(&bucket, &key, data);
                }
                response
            }
            Method::PUT => match (query.get("uploadId"), query.get("partNumber")) {
                (Some(upload_id), Some(part)) => {
                    let part = part.parse().unwrap_or(0);
                    self.upload_part(upload_id, part, data, size).await
                }
                _ => self.put_object(bucket, key, data, size),
            },
            Method::POST if query.contains_key("uploads") => {
                let response = self.create_upload(bucket, key);
                let delay = self.state().initiate_delay;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                response
            }
            Method::POST => match query.get("uploadId") {
                Some(upload_id) => self.complete_upload(upload_id, &data),
                None => error_response(400, "InvalidRequest"),
            },
            Method::DELETE => self.delete(bucket, key, &query),
            _ => error_response(405, "MethodNotAllowed"),
        };
        Ok(response)
    }
}

/// Fast retries, unthrottled progress
pub fn test_config() -> TransferConfig {
    TransferConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        progress_interval_ms: 0,
        ..TransferConfig::default()
    }
}

pub fn client(mock: &Arc<MockS3>) -> S3Client {
    S3Client::new(
        mock.clone(),
        ENDPOINT,
        Some("us-east-1".to_string()),
        Arc::new(CredentialStore::new(Credentials::permanent(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        ))),
    )
}

pub fn manager(mock: &Arc<MockS3>, config: TransferConfig) -> TransferManager {
    TransferManager::new(client(mock), config)
}

/// Wait for a task with a generous upper bound
pub async fn wait(manager: &TransferManager, task_id: &str) -> TaskSnapshot {
    tokio::time::timeout(Duration::from_secs(30), manager.wait(task_id))
        .await
        .expect("task did not finish in time")
        .expect("task is registered")
}
