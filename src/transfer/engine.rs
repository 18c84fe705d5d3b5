//! Executes transfer plans
//!
//! Uploads:
//! - Simple: one streamed PUT
//! - Multipart: initiate, parts through `buffer_unordered(concurrency)`,
//!   complete with parts sorted by number, abort once on failure or cancel
//!
//! Downloads:
//! - HEAD first to learn size and ETag
//! - Ranged GETs guarded by `If-Match`, each written at its own offset
//! - Byte total and per-part ETag verified before completion
//!
//! Every request except multipart initiate and abort goes through the
//! task's cancellation token; retries use the configured `RetryPolicy`.

use crate::config::TransferConfig;
use crate::s3::transport::RequestBody;
use crate::s3::types::{CompletedPart, DownloadResult, UploadResult};
use crate::s3::{S3Client, S3Error};
use crate::transfer::error::{Result, TransferError};
use crate::transfer::planner::{self, PartRange, Strategy, TransferPlan};
use crate::transfer::retry::{Exhausted, RetryPolicy};
use crate::transfer::task::{DownloadTarget, TaskHandle, TaskState, TransferOutcome, UploadSource};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hyper::StatusCode;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Write buffer per download part
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

pub struct TransferEngine {
    client: S3Client,
    config: TransferConfig,
    retry: RetryPolicy,
}

/// Fixed inputs of one multipart upload
struct PartUpload<'a> {
    handle: &'a Arc<TaskHandle>,
    source: &'a UploadSource,
    bucket: &'a str,
    key: &'a str,
    upload_id: &'a str,
}

/// Fixed inputs of one download
struct PartDownload<'a> {
    handle: &'a Arc<TaskHandle>,
    sink: &'a DownloadSink,
    bucket: &'a str,
    key: &'a str,
    etag: &'a str,
    ranged: bool,
}

struct PartReceipt {
    part_number: u32,
    etag: Option<String>,
    bytes: u64,
}

impl TransferEngine {
    pub fn new(client: S3Client, config: TransferConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            client,
            config,
            retry,
        }
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    fn plan(&self, size: u64) -> Result<TransferPlan> {
        planner::plan(
            size,
            self.config.multipart_threshold,
            self.config.part_size,
            self.config.max_parts,
        )
    }

    /// Run an upload task to its terminal state
    pub async fn run_upload(&self, handle: Arc<TaskHandle>, source: UploadSource) {
        let outcome = self.upload(&handle, &source).await;
        handle.finish(outcome.map(TransferOutcome::Upload));
    }

    /// Run a download task to its terminal state
    pub async fn run_download(&self, handle: Arc<TaskHandle>, target: DownloadTarget) {
        let outcome = self.download(&handle, &target).await;
        handle.finish(outcome.map(TransferOutcome::Download));
    }

    async fn upload(&self, handle: &Arc<TaskHandle>, source: &UploadSource) -> Result<UploadResult> {
        let cancel = handle.cancel_token().clone();
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        handle.transition(TaskState::Planning)?;

        let size = match source {
            UploadSource::Memory(data) => data.len() as u64,
            UploadSource::File(path) => {
                let metadata = tokio::fs::metadata(path).await?;
                if !metadata.is_file() {
                    return Err(TransferError::InvalidArgument(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                metadata.len()
            }
        };

        let plan = self.plan(size)?;
        handle.set_plan(&plan);
        tracing::debug!(size, strategy = ?plan.strategy, parts = plan.parts.len(), "upload planned");
        handle.transition(TaskState::InProgress)?;

        let (bucket, key) = handle.bucket_and_key();
        match (plan.strategy, plan.parts.first()) {
            (Strategy::Simple, Some(part)) => {
                self.upload_simple(handle, source, &bucket, &key, part, &cancel)
                    .await
            }
            _ => {
                self.upload_multipart(handle, source, &bucket, &key, &plan, &cancel)
                    .await
            }
        }
    }

    async fn upload_simple(
        &self,
        handle: &Arc<TaskHandle>,
        source: &UploadSource,
        bucket: &str,
        key: &str,
        part: &PartRange,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let n = part.part_number;
        let reporter = handle.progress();
        let outcome = self
            .retry
            .run(cancel, |attempt| {
                handle.part_attempt(n, attempt);
                if attempt > 1 {
                    reporter.reset_part(n);
                }
                let body = part_body(source, part).with_observer(reporter.part_observer(n));
                self.client.put_object(bucket, key, body, cancel)
            })
            .await;

        match outcome {
            Ok(result) => {
                handle.part_done(n, Some(result.etag.clone()));
                Ok(result)
            }
            Err(exhausted) => {
                handle.part_failed(n);
                Err(step_error(exhausted, Some(n)))
            }
        }
    }

    async fn upload_multipart(
        &self,
        handle: &Arc<TaskHandle>,
        source: &UploadSource,
        bucket: &str,
        key: &str,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        // Never dropped mid-flight: a session the server opened must be aborted
        let detached = CancellationToken::new();
        let init = self
            .retry
            .run(cancel, |_| self.client.create_multipart_upload(bucket, key, &detached))
            .await
            .map_err(|exhausted| step_error(exhausted, None))?;
        let upload_id = init.upload_id;
        handle.set_upload_id(&upload_id);
        tracing::info!(upload_id = %upload_id, parts = plan.parts.len(), "multipart upload initiated");

        let upload = PartUpload {
            handle,
            source,
            bucket,
            key,
            upload_id: &upload_id,
        };
        let outcome = if cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            self.upload_parts_and_complete(&upload, plan, cancel).await
        };

        if outcome.is_err() {
            // Not tied to the task token: cleanup must run after a cancel
            match self.client.abort_multipart_upload(bucket, key, &upload_id).await {
                Ok(()) => tracing::info!(upload_id = %upload_id, "multipart upload aborted"),
                Err(e) => tracing::warn!(upload_id = %upload_id, error = %e, "failed to abort multipart upload"),
            }
        }
        outcome
    }

    async fn upload_parts_and_complete(
        &self,
        upload: &PartUpload<'_>,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let parts_cancel = cancel.child_token();
        let mut completed = Vec::with_capacity(plan.parts.len());
        let mut failure = None;
        {
            let parts_cancel = &parts_cancel;
            let results = stream::iter(plan.parts.iter().copied())
                .map(|part| async move { self.upload_part(upload, &part, parts_cancel).await })
                .buffer_unordered(self.config.concurrency.max(1));
            futures::pin_mut!(results);

            while let Some(result) = results.next().await {
                match result {
                    Ok(part) => completed.push(part),
                    Err(e) => {
                        // Stop siblings; dropping the stream drops in-flight requests
                        parts_cancel.cancel();
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        completed.sort_by_key(|p: &CompletedPart| p.part_number);
        let response = self
            .retry
            .run(cancel, |_| {
                self.client.complete_multipart_upload(
                    upload.bucket,
                    upload.key,
                    upload.upload_id,
                    &completed,
                    cancel,
                )
            })
            .await
            .map_err(|exhausted| step_error(exhausted, None))?;

        Ok(UploadResult {
            status_code: StatusCode::OK.as_u16(),
            etag: response.etag,
            location: response
                .location
                .unwrap_or_else(|| self.client.object_url(upload.bucket, upload.key)),
        })
    }

    async fn upload_part(
        &self,
        upload: &PartUpload<'_>,
        part: &PartRange,
        cancel: &CancellationToken,
    ) -> Result<CompletedPart> {
        let n = part.part_number;
        let handle = upload.handle;
        let reporter = handle.progress();
        let outcome = self
            .retry
            .run(cancel, |attempt| {
                handle.part_attempt(n, attempt);
                if attempt > 1 {
                    reporter.reset_part(n);
                }
                tracing::debug!(part = n, attempt, "uploading part");
                let body = part_body(upload.source, part).with_observer(reporter.part_observer(n));
                self.client
                    .upload_part(upload.bucket, upload.key, upload.upload_id, n, body, cancel)
            })
            .await;

        match outcome {
            Ok(etag) => {
                handle.part_done(n, Some(etag.clone()));
                Ok(CompletedPart::new(n, etag))
            }
            Err(exhausted) => {
                handle.part_failed(n);
                Err(step_error(exhausted, Some(n)))
            }
        }
    }

    async fn download(&self, handle: &Arc<TaskHandle>, target: &DownloadTarget) -> Result<DownloadResult> {
        let cancel = handle.cancel_token().clone();
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        handle.transition(TaskState::Planning)?;

        let (bucket, key) = handle.bucket_and_key();
        let meta = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            meta = self.client.head_object(&bucket, &key) => meta?,
        };

        let plan = self.plan(meta.content_length)?;
        handle.set_plan(&plan);
        tracing::debug!(
            size = meta.content_length,
            etag = %meta.etag,
            strategy = ?plan.strategy,
            parts = plan.parts.len(),
            "download planned"
        );

        let sink = DownloadSink::prepare(target, plan.size).await?;
        handle.transition(TaskState::InProgress)?;

        let download = PartDownload {
            handle,
            sink: &sink,
            bucket: &bucket,
            key: &key,
            etag: &meta.etag,
            ranged: plan.strategy == Strategy::Multipart,
        };
        let outcome = self.download_parts(&download, &plan, &cancel).await;

        if let Err(e) = outcome {
            sink.discard().await;
            return Err(e);
        }
        let data = sink.commit().await?;
        Ok(DownloadResult {
            status_code: meta.status_code,
            etag: meta.etag,
            content_length: meta.content_length,
            data,
        })
    }

    async fn download_parts(
        &self,
        download: &PartDownload<'_>,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let parts_cancel = cancel.child_token();
        let mut receipts = Vec::with_capacity(plan.parts.len());
        {
            let parts_cancel = &parts_cancel;
            let results = stream::iter(plan.parts.iter().copied())
                .map(|part| async move { self.download_part(download, &part, parts_cancel).await })
                .buffer_unordered(self.config.concurrency.max(1));
            futures::pin_mut!(results);

            while let Some(result) = results.next().await {
                match result {
                    Ok(receipt) => receipts.push(receipt),
                    Err(e) => {
                        parts_cancel.cancel();
                        return Err(e);
                    }
                }
            }
        }

        for receipt in &receipts {
            if !download.etag.is_empty() && receipt.etag.as_deref() != Some(download.etag) {
                return Err(TransferError::IntegrityMismatch(format!(
                    "part {} has ETag {:?}, object has {:?}",
                    receipt.part_number, receipt.etag, download.etag
                )));
            }
        }
        let received: u64 = receipts.iter().map(|r| r.bytes).sum();
        if received != plan.size {
            return Err(TransferError::IntegrityMismatch(format!(
                "received {} bytes, object has {}",
                received, plan.size
            )));
        }
        Ok(())
    }

    async fn download_part(
        &self,
        download: &PartDownload<'_>,
        part: &PartRange,
        cancel: &CancellationToken,
    ) -> Result<PartReceipt> {
        let n = part.part_number;
        let handle = download.handle;
        let reporter = handle.progress();
        let outcome = self
            .retry
            .run(cancel, |attempt| {
                handle.part_attempt(n, attempt);
                if attempt > 1 {
                    reporter.reset_part(n);
                }
                tracing::debug!(part = n, attempt, "downloading part");
                self.fetch_part(download, part, cancel)
            })
            .await;

        match outcome {
            Ok(receipt) => {
                handle.part_done(n, receipt.etag.clone());
                Ok(receipt)
            }
            Err(exhausted) => {
                handle.part_failed(n);
                if exhausted.error.status() == Some(StatusCode::PRECONDITION_FAILED) {
                    return Err(TransferError::IntegrityMismatch(format!(
                        "object changed during download (part {})",
                        n
                    )));
                }
                Err(step_error(exhausted, Some(n)))
            }
        }
    }

    /// One attempt at a download part: GET and write at the part's offset
    async fn fetch_part(
        &self,
        download: &PartDownload<'_>,
        part: &PartRange,
        cancel: &CancellationToken,
    ) -> std::result::Result<PartReceipt, S3Error> {
        let n = part.part_number;
        let reporter = download.handle.progress();
        let range = download.ranged.then_some((part.start, part.end));
        let if_match = (!download.etag.is_empty()).then_some(download.etag);
        let response = self
            .client
            .get_object(download.bucket, download.key, range, if_match, cancel)
            .await?;
        let etag = response.etag();

        let capacity = part.len();
        let mut writer = download.sink.writer(part.start).await?;
        let mut body = response.body;
        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(S3Error::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            // Bytes past the range are counted but never written
            let room = capacity.saturating_sub(received).min(chunk.len() as u64) as usize;
            if room > 0 {
                writer.write(&chunk[..room]).await?;
            }
            received += chunk.len() as u64;
            reporter.report(n, received.min(capacity));
        }
        writer.finish().await?;

        Ok(PartReceipt {
            part_number: n,
            etag,
            bytes: received,
        })
    }
}

fn part_body(source: &UploadSource, part: &PartRange) -> RequestBody {
    match source {
        UploadSource::File(path) => RequestBody::file_range(path.clone(), part.start, part.len()),
        UploadSource::Memory(data) => {
            RequestBody::bytes(data.slice(part.start as usize..part.end as usize))
        }
    }
}

/// Map a request that ran out of attempts; `part_number` is `None` for
/// initiate and complete
fn step_error(exhausted: Exhausted, part_number: Option<u32>) -> TransferError {
    match exhausted.error {
        S3Error::Cancelled => TransferError::Cancelled,
        S3Error::CredentialExpired { expiry } => TransferError::CredentialExpired(expiry),
        error => TransferError::TransferFailed {
            part_number,
            attempts: exhausted.attempts,
            source: error,
        },
    }
}

/// Destination of downloaded bytes, pre-sized to the object length.
///
/// File downloads are written to a hidden sibling and renamed over the
/// target only once every part has been verified.
enum DownloadSink {
    File { target: PathBuf, partial: PathBuf },
    Memory(Mutex<Vec<u8>>),
}

/// `dir/name` -> `dir/.name.<random>.part`
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let suffix: u32 = rand::random();
    target.with_file_name(format!(".{}.{:08x}.part", name, suffix))
}

enum PartWriter<'a> {
    File(BufWriter<tokio::fs::File>),
    Memory {
        buffer: &'a Mutex<Vec<u8>>,
        offset: usize,
    },
}

impl DownloadSink {
    async fn prepare(target: &DownloadTarget, size: u64) -> Result<Self> {
        match target {
            DownloadTarget::File(target) => {
                let partial = partial_path(target);
                let file = tokio::fs::File::create(&partial).await?;
                file.set_len(size).await?;
                Ok(DownloadSink::File {
                    target: target.clone(),
                    partial,
                })
            }
            DownloadTarget::Memory => {
                let len = usize::try_from(size).map_err(|_| {
                    TransferError::InvalidArgument(format!("{} bytes do not fit in memory", size))
                })?;
                Ok(DownloadSink::Memory(Mutex::new(vec![0u8; len])))
            }
        }
    }

    async fn writer(&self, offset: u64) -> std::io::Result<PartWriter<'_>> {
        match self {
            DownloadSink::File { partial, .. } => {
                let mut file = tokio::fs::OpenOptions::new().write(true).open(partial).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                Ok(PartWriter::File(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)))
            }
            DownloadSink::Memory(buffer) => Ok(PartWriter::Memory {
                buffer,
                offset: offset as usize,
            }),
        }
    }

    /// Move a finished file into place, or hand back the memory buffer
    async fn commit(self) -> Result<Option<Bytes>> {
        match self {
            DownloadSink::File { target, partial } => {
                if let Err(e) = tokio::fs::rename(&partial, &target).await {
                    DownloadSink::File { target, partial }.discard().await;
                    return Err(e.into());
                }
                Ok(None)
            }
            DownloadSink::Memory(buffer) => Ok(Some(Bytes::from(
                buffer
                    .into_inner()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ))),
        }
    }

    /// Remove the partial file; the target is left untouched
    async fn discard(self) {
        if let DownloadSink::File { partial, .. } = self {
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => tracing::debug!(path = %partial.display(), "removed partial download"),
                Err(e) => tracing::warn!(path = %partial.display(), error = %e, "failed to remove partial download"),
            }
        }
    }
}

impl PartWriter<'_> {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            PartWriter::File(writer) => writer.write_all(data).await,
            PartWriter::Memory { buffer, offset } => {
                let mut buffer = buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let end = *offset + data.len();
                match buffer.get_mut(*offset..end) {
                    Some(slot) => slot.copy_from_slice(data),
                    None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "write past the end of the download buffer",
                        ))
                    }
                }
                *offset = end;
                Ok(())
            }
        }
    }

    async fn finish(self) -> std::io::Result<()> {
        match self {
            PartWriter::File(mut writer) => writer.flush().await,
            PartWriter::Memory { .. } => Ok(()),
        }
    }
}
