//! Transfer task model and its state machine

use crate::s3::types::{DownloadResult, UploadResult};
use crate::transfer::error::{Result, TransferError};
use crate::transfer::planner::{PartRange, TransferPlan};
use crate::transfer::progress::ProgressReporter;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Planning,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Legal transitions: forward through Planning and InProgress, and from
    /// any live state to Failed or Cancelled.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Pending, Planning) | (Planning, InProgress) | (InProgress, Completed) => true,
            (_, Failed) | (_, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPart {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub state: PartState,
    pub attempts: u32,
    pub etag: Option<String>,
}

impl From<&PartRange> for TransferPart {
    fn from(range: &PartRange) -> Self {
        Self {
            part_number: range.part_number,
            start: range.start,
            end: range.end,
            state: PartState::Pending,
            attempts: 0,
            etag: None,
        }
    }
}

/// Where upload bytes come from
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Memory(Bytes),
}

/// Where download bytes go
#[derive(Debug, Clone)]
pub enum DownloadTarget {
    File(PathBuf),
    /// Returned in `DownloadResult::data`
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransferOutcome {
    Upload(UploadResult),
    Download(DownloadResult),
}

#[derive(Debug)]
pub struct TransferTask {
    pub task_id: String,
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub state: TaskState,
    pub error: Option<Arc<TransferError>>,
    pub result: Option<TransferOutcome>,
    pub bytes_total: u64,
    pub parts: Vec<TransferPart>,
    pub upload_id: Option<String>,
    pub finished_at: Option<Instant>,
}

fn serialize_error<S: Serializer>(
    error: &Option<Arc<TransferError>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub direction: Direction,
    pub bucket: String,
    pub key: String,
    pub state: TaskState,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub parts_total: usize,
    pub parts_done: usize,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Arc<TransferError>>,
    pub result: Option<TransferOutcome>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle of a running task: its record, progress, cancellation
/// token and a watch on its state.
#[derive(Debug)]
pub struct TaskHandle {
    task: Mutex<TransferTask>,
    progress: Arc<ProgressReporter>,
    cancel: CancellationToken,
    state_tx: watch::Sender<TaskState>,
}

impl TaskHandle {
    pub fn new(
        task_id: String,
        direction: Direction,
        bucket: String,
        key: String,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Pending);
        Self {
            task: Mutex::new(TransferTask {
                task_id,
                direction,
                bucket,
                key,
                state: TaskState::Pending,
                error: None,
                result: None,
                bytes_total: 0,
                parts: Vec::new(),
                upload_id: None,
                finished_at: None,
            }),
            progress,
            cancel,
            state_tx,
        }
    }

    pub fn task_id(&self) -> String {
        lock(&self.task).task_id.clone()
    }

    pub fn bucket_and_key(&self) -> (String, String) {
        let task = lock(&self.task);
        (task.bucket.clone(), task.key.clone())
    }

    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.progress
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> TaskState {
        lock(&self.task).state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Terminal for at least `ttl`
    pub fn expired(&self, ttl: std::time::Duration, now: Instant) -> bool {
        matches!(lock(&self.task).finished_at, Some(at) if now.duration_since(at) >= ttl)
    }

    /// Move to a live state; terminal states go through `finish`
    pub fn transition(&self, next: TaskState) -> Result<()> {
        {
            let mut task = lock(&self.task);
            if !task.state.can_transition_to(next) || next.is_terminal() {
                return Err(TransferError::InvalidArgument(format!(
                    "task {}: illegal transition {:?} -> {:?}",
                    task.task_id, task.state, next
                )));
            }
            task.state = next;
        }
        self.progress.set_state(next);
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Install the plan's parts and byte total
    pub fn set_plan(&self, plan: &TransferPlan) {
        let mut task = lock(&self.task);
        task.bytes_total = plan.size;
        task.parts = plan.parts.iter().map(TransferPart::from).collect();
        self.progress.set_total(plan.size);
    }

    pub fn set_upload_id(&self, upload_id: &str) {
        lock(&self.task).upload_id = Some(upload_id.to_string());
    }

    /// Mark a part in flight for attempt `attempt`
    pub fn part_attempt(&self, part_number: u32, attempt: u32) {
        self.update_part(part_number, |part| {
            part.state = PartState::InFlight;
            part.attempts = attempt;
        });
    }

    pub fn part_done(&self, part_number: u32, etag: Option<String>) {
        self.update_part(part_number, |part| {
            part.state = PartState::Done;
            part.etag = etag;
        });
    }

    pub fn part_failed(&self, part_number: u32) {
        self.update_part(part_number, |part| part.state = PartState::Failed);
    }

    fn update_part(&self, part_number: u32, f: impl FnOnce(&mut TransferPart)) {
        let mut task = lock(&self.task);
        if let Some(part) = task.parts.iter_mut().find(|p| p.part_number == part_number) {
            f(part);
        }
    }

    pub fn parts(&self) -> Vec<TransferPart> {
        lock(&self.task).parts.clone()
    }

    /// Record the outcome and enter the terminal state.
    ///
    /// Errors while the task's token is cancelled end as `Cancelled`.
    /// Returns false when the task was already terminal.
    pub fn finish(&self, outcome: Result<TransferOutcome>) -> bool {
        let final_state = {
            let mut task = lock(&self.task);
            if task.state.is_terminal() {
                return false;
            }
            let state = match &outcome {
                Ok(_) => TaskState::Completed,
                Err(TransferError::Cancelled) => TaskState::Cancelled,
                Err(_) if self.cancel.is_cancelled() => TaskState::Cancelled,
                Err(_) => TaskState::Failed,
            };
            match outcome {
                Ok(result) => task.result = Some(result),
                Err(TransferError::Cancelled) => task.error = Some(Arc::new(TransferError::Cancelled)),
                Err(_) if state == TaskState::Cancelled => {
                    task.error = Some(Arc::new(TransferError::Cancelled))
                }
                Err(e) => task.error = Some(Arc::new(e)),
            }
            task.state = state;
            task.finished_at = Some(Instant::now());

            match &task.error {
                None => tracing::info!(task_id = %task.task_id, bytes = task.bytes_total, "transfer completed"),
                Some(e) if state == TaskState::Cancelled => {
                    tracing::info!(task_id = %task.task_id, error = %e, "transfer cancelled")
                }
                Some(e) => tracing::warn!(task_id = %task.task_id, error = %e, "transfer failed"),
            }
            state
        };

        self.progress.finish(final_state);
        self.state_tx.send_replace(final_state);
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let task = lock(&self.task);
        TaskSnapshot {
            task_id: task.task_id.clone(),
            direction: task.direction,
            bucket: task.bucket.clone(),
            key: task.key.clone(),
            state: task.state,
            bytes_completed: self.progress.bytes_completed(),
            bytes_total: task.bytes_total,
            parts_total: task.parts.len(),
            parts_done: task
                .parts
                .iter()
                .filter(|p| p.state == PartState::Done)
                .count(),
            error: task.error.clone(),
            result: task.result.clone(),
        }
    }

    /// Resolve once the task is terminal
    pub async fn wait_terminal(&self) -> TaskSnapshot {
        let mut rx = self.state_tx.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::planner;
    use crate::transfer::progress::ProgressHub;
    use std::time::Duration;

    fn handle() -> TaskHandle {
        let hub = Arc::new(ProgressHub::new());
        TaskHandle::new(
            "t1".into(),
            Direction::Upload,
            "bucket".into(),
            "key".into(),
            Arc::new(ProgressReporter::new("t1", Duration::ZERO, hub)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_state_machine() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Planning));
        assert!(Planning.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Planning.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Planning));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Planning, InProgress, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn test_finish_is_final() {
        let handle = handle();
        handle.transition(TaskState::Planning).unwrap();
        assert!(handle.finish(Err(TransferError::InvalidArgument("x".into()))));
        assert_eq!(handle.state(), TaskState::Failed);

        assert!(!handle.finish(Err(TransferError::Cancelled)));
        assert!(handle.transition(TaskState::InProgress).is_err());
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_error_after_cancel_is_cancelled() {
        let handle = handle();
        handle.cancel();
        handle.finish(Err(TransferError::IntegrityMismatch("x".into())));
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(matches!(
            snapshot.error.as_deref(),
            Some(TransferError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_counts_parts() {
        let handle = handle();
        let plan = planner::plan(30, 10, 10, 100).unwrap();
        handle.set_plan(&plan);
        handle.part_attempt(1, 1);
        handle.part_done(1, Some("e1".into()));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.parts_total, 3);
        assert_eq!(snapshot.parts_done, 1);
        assert_eq!(snapshot.bytes_total, 30);
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let handle = Arc::new(handle());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_terminal().await })
        };
        handle.transition(TaskState::Planning).unwrap();
        handle.finish(Err(TransferError::Cancelled));
        let snapshot = waiter.await.unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
    }

    #[test]
    fn test_snapshot_serializes_error_as_text() {
        let handle = handle();
        handle.finish(Err(TransferError::NotFound("x".into())));
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "no such task: x");
    }
}
