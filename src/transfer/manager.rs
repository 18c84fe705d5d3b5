//! Task registry and the public transfer interface
//!
//! `TransferManager` validates submissions, spawns one engine run per task,
//! and answers status, cancel and subscribe calls. Object operations that
//! are not transfers (list, head, delete, presign) pass straight through
//! to the S3 client.

use crate::config::{Profile, TransferConfig};
use crate::listing::{ListRequest, ObjectLister};
use crate::s3::types::{DeleteResult, ObjectMetadata};
use crate::s3::{CredentialStore, Credentials, HttpTransport, S3Client, Transport};
use crate::transfer::engine::TransferEngine;
use crate::transfer::error::{Result, TransferError};
use crate::transfer::progress::{ProgressHub, ProgressReporter, ProgressSample};
use crate::transfer::task::{
    Direction, DownloadTarget, TaskHandle, TaskSnapshot, UploadSource,
};
use hyper::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct TransferManager {
    client: S3Client,
    engine: Arc<TransferEngine>,
    hub: Arc<ProgressHub>,
    tasks: Mutex<HashMap<String, Arc<TaskHandle>>>,
    config: TransferConfig,
    /// Parent of every task token
    shutdown: CancellationToken,
}

impl TransferManager {
    pub fn new(client: S3Client, config: TransferConfig) -> Self {
        let client = client.with_timeout(config.request_timeout());
        Self {
            engine: Arc::new(TransferEngine::new(client.clone(), config.clone())),
            client,
            hub: Arc::new(ProgressHub::new()),
            tasks: Mutex::new(HashMap::new()),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Manager over the hyper transport for a configured profile
    pub fn from_profile(profile: &Profile, config: TransferConfig) -> crate::s3::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.insecure_tls)?);
        let credentials = Arc::new(CredentialStore::new(profile.credentials()));
        let client = S3Client::new(
            transport,
            profile.endpoint.clone(),
            Some(profile.region.clone()),
            credentials,
        );
        Ok(Self::new(client, config))
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskHandle>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, task_id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(task_id.to_string()))
    }

    /// Evict tasks that have been terminal for longer than the TTL, and
    /// subscriptions to ids that were never submitted
    fn collect_expired(&self, tasks: &mut HashMap<String, Arc<TaskHandle>>) {
        let ttl = self.config.task_ttl();
        let now = tokio::time::Instant::now();
        tasks.retain(|task_id, handle| {
            let keep = !handle.expired(ttl, now);
            if !keep {
                tracing::debug!(task_id = %task_id, "evicting finished task");
            }
            keep
        });
        self.hub.prune_orphans(|task_id| tasks.contains_key(task_id), ttl, now);
    }

    /// Validate and register a new task
    fn register(
        &self,
        direction: Direction,
        bucket: &str,
        key: &str,
        task_id: &str,
    ) -> Result<Arc<TaskHandle>> {
        for (name, value) in [("bucket", bucket), ("key", key), ("task id", task_id)] {
            if value.is_empty() {
                return Err(TransferError::InvalidArgument(format!("{} must not be empty", name)));
            }
        }

        let mut tasks = self.tasks();
        if let Some(existing) = tasks.get(task_id) {
            if !existing.is_terminal() {
                return Err(TransferError::InvalidArgument(format!(
                    "task {} is already active",
                    task_id
                )));
            }
        }

        let progress = Arc::new(ProgressReporter::new(
            task_id,
            self.config.progress_interval(),
            Arc::clone(&self.hub),
        ));
        let handle = Arc::new(TaskHandle::new(
            task_id.to_string(),
            direction,
            bucket.to_string(),
            key.to_string(),
            progress,
            self.shutdown.child_token(),
        ));
        tasks.insert(task_id.to_string(), Arc::clone(&handle));
        // After the insert, so a subscription made ahead of this submit is kept
        self.collect_expired(&mut tasks);
        Ok(handle)
    }

    /// Start uploading `source` to `bucket/key`; returns once the task is registered
    pub fn submit_upload(
        &self,
        bucket: &str,
        key: &str,
        source: UploadSource,
        task_id: &str,
    ) -> Result<()> {
        let handle = self.register(Direction::Upload, bucket, key, task_id)?;
        let engine = Arc::clone(&self.engine);
        let span = tracing::info_span!("upload", task_id = %task_id, bucket = %bucket, key = %key);
        tracing::info!(parent: &span, "upload submitted");
        tokio::spawn(async move { engine.run_upload(handle, source).await }.instrument(span));
        Ok(())
    }

    /// Start downloading `bucket/key` into `destination`
    pub fn submit_download(
        &self,
        bucket: &str,
        key: &str,
        destination: DownloadTarget,
        task_id: &str,
    ) -> Result<()> {
        let handle = self.register(Direction::Download, bucket, key, task_id)?;
        let engine = Arc::clone(&self.engine);
        let span = tracing::info_span!("download", task_id = %task_id, bucket = %bucket, key = %key);
        tracing::info!(parent: &span, "download submitted");
        tokio::spawn(async move { engine.run_download(handle, destination).await }.instrument(span));
        Ok(())
    }

    /// Wait for a task to reach a terminal state
    pub async fn wait(&self, task_id: &str) -> Result<TaskSnapshot> {
        let handle = self.handle(task_id)?;
        Ok(handle.wait_terminal().await)
    }

    /// Request cancellation; the task settles as Cancelled once its
    /// in-flight requests are dropped and cleanup has run
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let handle = self.handle(task_id)?;
        if !handle.is_terminal() {
            tracing::info!(task_id = %task_id, "cancelling transfer");
            handle.cancel();
        }
        Ok(())
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot> {
        {
            let mut tasks = self.tasks();
            self.collect_expired(&mut tasks);
        }
        Ok(self.handle(task_id)?.snapshot())
    }

    /// Return and evict a terminal task; live tasks stay registered
    pub fn take_finished(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let mut tasks = self.tasks();
        let handle = tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(task_id.to_string()))?;
        if !handle.is_terminal() {
            return Ok(None);
        }
        tasks.remove(task_id);
        Ok(Some(handle.snapshot()))
    }

    /// Snapshots of every registered task
    pub fn tasks_snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> =
            self.tasks().values().map(|handle| handle.snapshot()).collect();
        snapshots.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        snapshots
    }

    /// Progress samples of one task.
    ///
    /// Subscribing to a finished task yields its final sample and then ends.
    pub fn subscribe(&self, task_id: &str) -> UnboundedReceiver<ProgressSample> {
        // Held across the hub call so the task cannot be registered in between
        let tasks = self.tasks();
        match tasks.get(task_id) {
            Some(handle) => handle.progress().subscribe(),
            // Not submitted yet; the task's reporter will find these senders
            None => self.hub.subscribe(task_id),
        }
    }

    /// Progress samples of every task
    pub fn subscribe_all(&self) -> UnboundedReceiver<ProgressSample> {
        self.hub.subscribe_all()
    }

    /// Lazy listing of `bucket` under `prefix`
    pub fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        max_keys: Option<u32>,
    ) -> ObjectLister {
        let mut request = ListRequest::new(bucket);
        request.prefix = prefix.map(str::to_string);
        request.delimiter = delimiter.map(str::to_string);
        if let Some(max_keys) = max_keys {
            request.max_keys = max_keys;
        }
        ObjectLister::new(self.client.clone(), request)
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<DeleteResult> {
        Ok(self.client.delete_object(bucket, key).await?)
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        Ok(self.client.head_object(bucket, key).await?)
    }

    /// Metadata of `bucket/key` from a single HEAD; a 404 is `None`
    pub async fn find_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        match self.client.head_object(bucket, key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `bucket/key` exists; a 404 is `false`, other errors propagate
    pub async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.find_object(bucket, key).await?.is_some())
    }

    /// Shareable GET URL valid for `expires_in`
    pub fn presigned_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        Ok(self.client.presigned_url(bucket, key, expires_in)?)
    }

    /// Install new credentials; requests signed afterwards use them
    pub fn replace_credentials(&self, credentials: Credentials) {
        self.client.credentials().replace(credentials);
    }

    /// Cancel every live task
    pub fn shutdown(&self) {
        tracing::info!("cancelling all transfers");
        self.shutdown.cancel();
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
