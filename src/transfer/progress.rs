//! Byte progress aggregation and delivery
//!
//! A `ProgressReporter` belongs to one task. Parts report the cumulative
//! bytes of their current attempt; the task aggregate is the sum of each
//! part's latest value. Samples go out through the shared `ProgressHub`
//! to per-task and wildcard subscribers.

use crate::transfer::task::TaskState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

/// One progress observation of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSample {
    pub task_id: String,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    /// A part restarted since the previous sample, so the aggregate may be lower
    pub part_reset: bool,
    pub state: TaskState,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscriber registry shared by every task
#[derive(Debug, Default)]
pub struct ProgressHub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    by_task: HashMap<String, TaskSubscribers>,
    wildcard: Vec<UnboundedSender<ProgressSample>>,
}

#[derive(Debug)]
struct TaskSubscribers {
    senders: Vec<UnboundedSender<ProgressSample>>,
    /// First subscription, used to expire ids that never run
    since: Instant,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive samples of one task
    pub fn subscribe(&self, task_id: &str) -> UnboundedReceiver<ProgressSample> {
        let (tx, rx) = unbounded_channel();
        lock(&self.inner)
            .by_task
            .entry(task_id.to_string())
            .or_insert_with(|| TaskSubscribers {
                senders: Vec::new(),
                since: Instant::now(),
            })
            .senders
            .push(tx);
        rx
    }

    /// Receive samples of every task
    pub fn subscribe_all(&self) -> UnboundedReceiver<ProgressSample> {
        let (tx, rx) = unbounded_channel();
        lock(&self.inner).wildcard.push(tx);
        rx
    }

    /// Deliver a sample without blocking; closed receivers are pruned
    pub fn publish(&self, sample: &ProgressSample) {
        let mut inner = lock(&self.inner);
        if let Some(subscribers) = inner.by_task.get_mut(&sample.task_id) {
            subscribers.senders.retain(|tx| tx.send(sample.clone()).is_ok());
            if subscribers.senders.is_empty() {
                inner.by_task.remove(&sample.task_id);
            }
        }
        inner.wildcard.retain(|tx| tx.send(sample.clone()).is_ok());
    }

    /// Drop the per-task senders so their receivers end
    pub fn close_task(&self, task_id: &str) {
        lock(&self.inner).by_task.remove(task_id);
    }

    /// Drop subscriptions to ids with no registered task once every
    /// receiver is gone or `ttl` has passed since the first subscription
    pub fn prune_orphans(&self, is_registered: impl Fn(&str) -> bool, ttl: Duration, now: Instant) {
        lock(&self.inner).by_task.retain(|task_id, subscribers| {
            if is_registered(task_id) {
                return true;
            }
            subscribers.senders.retain(|tx| !tx.is_closed());
            let keep = !subscribers.senders.is_empty()
                && now.saturating_duration_since(subscribers.since) < ttl;
            if !keep {
                tracing::debug!(task_id = %task_id, "dropping subscribers of unknown task");
            }
            keep
        });
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        lock(&self.inner)
            .by_task
            .get(task_id)
            .map_or(0, |subscribers| subscribers.senders.len())
    }
}

#[derive(Debug)]
struct ReporterState {
    parts: HashMap<u32, u64>,
    aggregate: u64,
    bytes_total: u64,
    state: TaskState,
    last_emit: Option<Instant>,
    last_emitted_bytes: Option<u64>,
    pending_reset: bool,
    finished: bool,
}

/// Per-task progress aggregator with throttled emission
#[derive(Debug)]
pub struct ProgressReporter {
    task_id: String,
    interval: Duration,
    hub: Arc<ProgressHub>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, interval: Duration, hub: Arc<ProgressHub>) -> Self {
        Self {
            task_id: task_id.into(),
            interval,
            hub,
            state: Mutex::new(ReporterState {
                parts: HashMap::new(),
                aggregate: 0,
                bytes_total: 0,
                state: TaskState::Pending,
                last_emit: None,
                last_emitted_bytes: None,
                pending_reset: false,
                finished: false,
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn set_total(&self, bytes_total: u64) {
        lock(&self.state).bytes_total = bytes_total;
    }

    /// Track the task state carried by samples
    pub fn set_state(&self, state: TaskState) {
        lock(&self.state).state = state;
    }

    pub fn bytes_completed(&self) -> u64 {
        lock(&self.state).aggregate
    }

    /// Record the cumulative bytes of a part's current attempt
    pub fn report(&self, part_number: u32, part_bytes: u64) {
        let mut state = lock(&self.state);
        if state.finished {
            return;
        }
        let previous = state.parts.get(&part_number).copied().unwrap_or(0);
        // Within one attempt the count only grows
        if part_bytes <= previous {
            return;
        }
        state.parts.insert(part_number, part_bytes);
        state.aggregate = state.aggregate - previous + part_bytes;
        self.maybe_emit(&mut state);
    }

    /// Drop a part's contribution before it is retried
    pub fn reset_part(&self, part_number: u32) {
        let mut state = lock(&self.state);
        if state.finished {
            return;
        }
        if let Some(previous) = state.parts.remove(&part_number) {
            state.aggregate -= previous;
            if previous > 0 {
                state.pending_reset = true;
                tracing::debug!(task_id = %self.task_id, part = part_number, dropped = previous, "part progress reset");
            }
        }
    }

    /// Callback feeding a request body's byte counter into this reporter
    pub fn part_observer(self: &Arc<Self>, part_number: u32) -> crate::s3::transport::ByteObserver {
        let reporter = Arc::clone(self);
        Arc::new(move |bytes| reporter.report(part_number, bytes))
    }

    /// Emit the terminal sample; later reports are ignored
    pub fn finish(&self, terminal: TaskState) {
        let sample = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            state.state = terminal;
            if terminal == TaskState::Completed {
                state.aggregate = state.bytes_total;
            }
            let sample = Self::sample(&self.task_id, &mut state);
            self.hub.publish(&sample);
            self.hub.close_task(&self.task_id);
            sample
        };
        tracing::debug!(task_id = %sample.task_id, bytes = sample.bytes_completed, state = ?terminal, "final progress");
    }

    /// Receive this task's samples.
    ///
    /// Checked against `finish` under the state lock: a finished task yields
    /// its final sample on a closed channel, a live one is registered in the
    /// hub before the terminal sample can go out.
    pub fn subscribe(&self) -> UnboundedReceiver<ProgressSample> {
        let state = lock(&self.state);
        if state.finished {
            let (tx, rx) = unbounded_channel();
            let _ = tx.send(ProgressSample {
                task_id: self.task_id.clone(),
                bytes_completed: state.aggregate,
                bytes_total: state.bytes_total,
                part_reset: false,
                state: state.state,
            });
            return rx;
        }
        self.hub.subscribe(&self.task_id)
    }

    /// Current values as a sample, without emitting it
    pub fn current(&self) -> ProgressSample {
        let state = lock(&self.state);
        ProgressSample {
            task_id: self.task_id.clone(),
            bytes_completed: state.aggregate,
            bytes_total: state.bytes_total,
            part_reset: false,
            state: state.state,
        }
    }

    fn maybe_emit(&self, state: &mut ReporterState) {
        if state.last_emitted_bytes == Some(state.aggregate) {
            return;
        }
        let now = Instant::now();
        if let Some(last) = state.last_emit {
            if now.duration_since(last) < self.interval {
                return;
            }
        }
        state.last_emit = Some(now);
        let sample = Self::sample(&self.task_id, state);
        // Published under the state lock so subscribers see samples in order
        self.hub.publish(&sample);
    }

    fn sample(task_id: &str, state: &mut ReporterState) -> ProgressSample {
        state.last_emitted_bytes = Some(state.aggregate);
        ProgressSample {
            task_id: task_id.to_string(),
            bytes_completed: state.aggregate,
            bytes_total: state.bytes_total,
            part_reset: std::mem::take(&mut state.pending_reset),
            state: state.state,
        }
    }
}
