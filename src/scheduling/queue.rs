//! Execution Queue
//!
//! Priority-ordered backlog of execution requests drained by a background
//! worker under a concurrency ceiling.
//!
//! - HIGH before NORMAL before LOW; FIFO within a priority
//! - at most `max_concurrent` items RUNNING at once
//! - only QUEUED items can be cancelled
//! - terminal records are kept in a bounded history, oldest evicted first
//!
//! Each item runs in its own task, so a panicking runner fails that item
//! and never stops the worker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::execution::{ExecutionRequest, ExecutionRunner};

/// Default number of terminal records kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Upper bound on how long the worker sleeps without a wake-up.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Queue priority. Lower value runs first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Parses a priority name, falling back to NORMAL for anything unknown.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!("Unknown priority '{}', using normal", value);
            Self::Normal
        })
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "1" => Ok(Self::High),
            "normal" | "2" => Ok(Self::Normal),
            "low" | "3" => Ok(Self::Low),
            other => Err(format!("Unknown priority '{}'", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle of a queued item.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One queued execution request and its bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueuedExecution {
    pub id: String,
    pub playbook_path: String,
    pub parameters: HashMap<String, Value>,
    pub gateway_url: Option<String>,
    pub credential_name: Option<String>,
    pub priority: Priority,
    pub state: QueueState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Id of the engine execution, assigned when the item starts
    pub execution_id: Option<String>,
    pub error: Option<String>,
    #[serde(skip)]
    debug: bool,
}

impl QueuedExecution {
    fn new(request: ExecutionRequest, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            playbook_path: request.playbook_path,
            parameters: request.parameters,
            gateway_url: request.gateway_url,
            credential_name: request.credential_name,
            priority,
            state: QueueState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_id: request.execution_id,
            error: None,
            debug: request.debug,
        }
    }

    fn to_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            playbook_path: self.playbook_path.clone(),
            parameters: self.parameters.clone(),
            gateway_url: self.gateway_url.clone(),
            credential_name: self.credential_name.clone(),
            execution_id: self.execution_id.clone(),
            debug: self.debug,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Serialize, Debug, Clone)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub running_executions: Vec<QueuedExecution>,
    /// Up to the ten most recent terminal records, newest first
    pub recent_completed: Vec<QueuedExecution>,
}

#[derive(Default)]
struct QueueInner {
    backlog: BTreeMap<(Priority, u64), QueuedExecution>,
    running: HashMap<String, QueuedExecution>,
    history: VecDeque<QueuedExecution>,
    next_sequence: u64,
    shutdown: bool,
}

impl QueueInner {
    fn push_history(&mut self, record: QueuedExecution, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

struct Shared {
    inner: Mutex<QueueInner>,
    runner: Arc<dyn ExecutionRunner>,
    wake: Notify,
    max_concurrent: usize,
    history_limit: usize,
}

/// Priority queue of executions with a background worker.
pub struct ExecutionQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionQueue {
    /// Creates a queue. A ceiling of zero is raised to one.
    pub fn new(runner: Arc<dyn ExecutionRunner>, max_concurrent: usize) -> Self {
        Self::with_history_limit(runner, max_concurrent, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(
        runner: Arc<dyn ExecutionRunner>,
        max_concurrent: usize,
        history_limit: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(QueueInner::default()),
                runner,
                wake: Notify::new(),
                max_concurrent: max_concurrent.max(1),
                history_limit,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// Adds a request to the backlog and returns its record.
    pub fn enqueue(&self, request: ExecutionRequest, priority: Priority) -> QueuedExecution {
        let record = QueuedExecution::new(request, priority);
        {
            let mut inner = self.shared.inner.lock();
            let key = (priority, inner.next_sequence);
            inner.next_sequence += 1;
            inner.backlog.insert(key, record.clone());
        }
        info!(
            "Queued execution {} for '{}' (priority {})",
            record.id, record.playbook_path, priority
        );
        self.shared.wake.notify_one();
        record
    }

    /// Cancels a QUEUED item. Returns false for running, finished or unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.shared.inner.lock();
        let Some(key) = inner
            .backlog
            .iter()
            .find(|(_, record)| record.id == id)
            .map(|(key, _)| *key)
        else {
            debug!("Cannot cancel {}: not queued", id);
            return false;
        };

        if let Some(mut record) = inner.backlog.remove(&key) {
            record.state = QueueState::Cancelled;
            record.completed_at = Some(Utc::now());
            info!("Cancelled queued execution {}", id);
            inner.push_history(record, self.shared.history_limit);
        }
        true
    }

    /// Looks up a record in the backlog, running set or history.
    pub fn get(&self, id: &str) -> Option<QueuedExecution> {
        let inner = self.shared.inner.lock();
        inner
            .backlog
            .values()
            .find(|r| r.id == id)
            .or_else(|| inner.running.get(id))
            .or_else(|| inner.history.iter().rev().find(|r| r.id == id))
            .cloned()
    }

    pub fn get_running(&self) -> Vec<QueuedExecution> {
        let inner = self.shared.inner.lock();
        let mut running: Vec<QueuedExecution> = inner.running.values().cloned().collect();
        running.sort_by_key(|r| r.started_at);
        running
    }

    pub fn get_status(&self) -> QueueStatus {
        let inner = self.shared.inner.lock();
        let mut running_executions: Vec<QueuedExecution> = inner.running.values().cloned().collect();
        running_executions.sort_by_key(|r| r.started_at);

        QueueStatus {
            queued: inner.backlog.len(),
            running: inner.running.len(),
            completed: inner.history.len(),
            max_concurrent: self.shared.max_concurrent,
            available_slots: self.shared.max_concurrent.saturating_sub(inner.running.len()),
            running_executions,
            recent_completed: inner.history.iter().rev().take(10).cloned().collect(),
        }
    }

    /// Starts the background worker. Calling it again has no effect.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Queue worker already running");
            return;
        }
        self.shared.inner.lock().shutdown = false;
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::spawn(run_worker(shared)));
        info!(
            "Execution queue started (max concurrent: {})",
            self.shared.max_concurrent
        );
    }

    /// Stops the worker. Items already running finish on their own; queued
    /// items stay queued.
    pub async fn shutdown(&self) {
        self.shared.inner.lock().shutdown = true;
        self.shared.wake.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Queue worker ended abnormally: {}", e);
            }
        }
        info!("Execution queue stopped");
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut inner = shared.inner.lock();
            if inner.shutdown {
                break;
            }
            if inner.running.len() < shared.max_concurrent {
                take_next(&mut inner)
            } else {
                None
            }
        };

        match next {
            Some(record) => launch(&shared, record),
            None => {
                let _ = tokio::time::timeout(POLL_INTERVAL, shared.wake.notified()).await;
            }
        }
    }
    debug!("Queue worker exiting");
}

/// Moves the highest-priority backlog item into the running set.
fn take_next(inner: &mut QueueInner) -> Option<QueuedExecution> {
    let (_, mut record) = inner.backlog.pop_first()?;
    record.state = QueueState::Running;
    record.started_at = Some(Utc::now());
    if record.execution_id.is_none() {
        record.execution_id = Some(Uuid::new_v4().to_string());
    }
    inner.running.insert(record.id.clone(), record.clone());
    Some(record)
}

fn launch(shared: &Arc<Shared>, record: QueuedExecution) {
    info!(
        "Starting queued execution {} ('{}', priority {})",
        record.id, record.playbook_path, record.priority
    );
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let runner = Arc::clone(&shared.runner);
        let request = record.to_request();
        let outcome = tokio::spawn(async move { runner.run(request).await }).await;

        let (state, error) = match outcome {
            Ok(Ok(_)) => (QueueState::Completed, None),
            Ok(Err(e)) => (QueueState::Failed, Some(e.to_string())),
            Err(e) => (QueueState::Failed, Some(format!("Execution task aborted: {}", e))),
        };
        finish(&shared, &record.id, state, error);
    });
}

fn finish(shared: &Shared, id: &str, state: QueueState, error: Option<String>) {
    {
        let mut inner = shared.inner.lock();
        match inner.running.remove(id) {
            Some(mut record) => {
                record.state = state;
                record.completed_at = Some(Utc::now());
                record.error = error;
                match state {
                    QueueState::Completed => info!("Queued execution {} completed", id),
                    _ => error!(
                        "Queued execution {} failed: {}",
                        id,
                        record.error.as_deref().unwrap_or("unknown error")
                    ),
                }
                inner.push_history(record, shared.history_limit);
            }
            None => warn!("Finished execution {} was not marked running", id),
        }
    }
    shared.wake.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrchestratorError, Result};
    use crate::playbook::{ExecutionState, Playbook};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records run order and tracks peak concurrency.
    #[derive(Default)]
    struct RecordingRunner {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    impl RecordingRunner {
        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ExecutionRunner for RecordingRunner {
        async fn run(&self, request: ExecutionRequest) -> Result<ExecutionState> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().push(request.playbook_path.clone());

            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            match request.playbook_path.as_str() {
                "fail.yaml" => Err(OrchestratorError::Config("boom".to_string())),
                "panic.yaml" => panic!("runner exploded"),
                path => Ok(ExecutionState::new(
                    request.execution_id.unwrap_or_default(),
                    &Playbook::new(path),
                )),
            }
        }
    }

    async fn wait_until(queue: &ExecutionQueue, predicate: impl Fn(&QueueStatus) -> bool) {
        for _ in 0..400 {
            if predicate(&queue.get_status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached the expected state: {:?}", queue.get_status());
    }

    fn drained(total: usize) -> impl Fn(&QueueStatus) -> bool {
        move |s| s.queued == 0 && s.running == 0 && s.completed == total
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(Priority::parse_lenient("urgent"), Priority::Normal);
        assert_eq!(Priority::parse_lenient("low"), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::High.value(), 1);
        assert!(Priority::High < Priority::Low);
    }

    #[tokio::test]
    async fn test_drains_by_priority_then_fifo() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::new(runner.clone(), 1);

        queue.enqueue(ExecutionRequest::new("low.yaml"), Priority::Low);
        queue.enqueue(ExecutionRequest::new("high.yaml"), Priority::High);
        queue.enqueue(ExecutionRequest::new("normal-1.yaml"), Priority::Normal);
        queue.enqueue(ExecutionRequest::new("normal-2.yaml"), Priority::Normal);
        queue.start();

        wait_until(&queue, drained(4)).await;
        assert_eq!(
            *runner.order.lock(),
            vec!["high.yaml", "normal-1.yaml", "normal-2.yaml", "low.yaml"]
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_respects_concurrency_ceiling() {
        let runner = Arc::new(RecordingRunner::with_delay(20));
        let queue = ExecutionQueue::new(runner.clone(), 2);
        queue.start();

        for i in 0..6 {
            queue.enqueue(ExecutionRequest::new(format!("p{}.yaml", i)), Priority::Normal);
        }

        wait_until(&queue, drained(6)).await;
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.order.lock().len(), 6);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_only_applies_to_queued_items() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::new(runner.clone(), 1);

        let record = queue.enqueue(ExecutionRequest::new("a.yaml"), Priority::Normal);
        assert!(queue.cancel(&record.id));
        assert!(!queue.cancel(&record.id));
        assert!(!queue.cancel("unknown"));

        let cancelled = queue.get(&record.id).unwrap();
        assert_eq!(cancelled.state, QueueState::Cancelled);
        assert!(cancelled.completed_at.is_some());

        queue.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.order.lock().is_empty());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_running_item_cannot_be_cancelled() {
        let runner = Arc::new(RecordingRunner::with_delay(200));
        let queue = ExecutionQueue::new(runner, 1);
        let record = queue.enqueue(ExecutionRequest::new("slow.yaml"), Priority::Normal);
        queue.start();

        wait_until(&queue, |s| s.running == 1).await;
        assert!(!queue.cancel(&record.id));

        let running = queue.get_running();
        assert_eq!(running[0].state, QueueState::Running);
        assert!(running[0].execution_id.is_some());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_worker() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::new(runner, 1);

        let failed = queue.enqueue(ExecutionRequest::new("fail.yaml"), Priority::High);
        let panicked = queue.enqueue(ExecutionRequest::new("panic.yaml"), Priority::Normal);
        let ok = queue.enqueue(ExecutionRequest::new("ok.yaml"), Priority::Low);
        queue.start();

        wait_until(&queue, drained(3)).await;
        let failed = queue.get(&failed.id).unwrap();
        assert_eq!(failed.state, QueueState::Failed);
        assert!(failed.error.unwrap().contains("boom"));
        assert_eq!(queue.get(&panicked.id).unwrap().state, QueueState::Failed);
        assert_eq!(queue.get(&ok.id).unwrap().state, QueueState::Completed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::with_history_limit(runner, 1, 3);

        let ids: Vec<String> = (0..5)
            .map(|i| {
                queue
                    .enqueue(ExecutionRequest::new(format!("p{}.yaml", i)), Priority::Normal)
                    .id
            })
            .collect();
        queue.start();

        wait_until(&queue, |s| s.queued == 0 && s.running == 0 && s.completed == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = queue.get_status();
        assert_eq!(status.completed, 3);
        assert!(queue.get(&ids[0]).is_none());
        assert!(queue.get(&ids[1]).is_none());
        assert_eq!(status.recent_completed[0].id, ids[4]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::new(runner, 3);
        queue.enqueue(ExecutionRequest::new("a.yaml"), Priority::Normal);
        queue.enqueue(ExecutionRequest::new("b.yaml"), Priority::Low);

        let status = queue.get_status();
        assert_eq!(status.queued, 2);
        assert_eq!(status.running, 0);
        assert_eq!(status.available_slots, 3);
        assert_eq!(status.max_concurrent, 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let runner = Arc::new(RecordingRunner::default());
        let queue = ExecutionQueue::new(runner.clone(), 1);
        queue.start();
        queue.shutdown().await;

        queue.enqueue(ExecutionRequest::new("late.yaml"), Priority::High);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.order.lock().is_empty());
        assert_eq!(queue.get_status().queued, 1);
    }
}
