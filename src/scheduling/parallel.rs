//! Parallel Execution Manager
//!
//! Runs a batch of executions concurrently under a global slot ceiling and
//! the shared [`ResourceLimiter`]. Units are launched in submission order as
//! slots free up; each unit holds the resource tokens its configuration
//! needs for its whole run.
//!
//! In fail-fast mode the first failing unit halts the batch: nothing new is
//! launched, running units are aborted and marked cancelled, and the
//! triggering error is returned. A member that was itself cancelled does
//! not count as a failure.
//!
//! Finished records are kept in a bounded history so a halted or dropped
//! batch can still be inspected.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

use super::resource::{ResourceLimiter, ResourceStatus, ResourceType};
use crate::error::{OrchestratorError, Result};
use crate::execution::ExecutionRequest;
use crate::playbook::{ExecutionState, Parameters};

/// Finished records kept for lookup after their batch returns.
const HISTORY_LIMIT: usize = 256;

/// Playbook path fragments that mark a browser-driven playbook.
const BROWSER_PATH_HINTS: &[&str] = &["perspective", "browser", "designer"];

/// Configuration of one batch member.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ExecutionConfig {
    pub playbook_path: String,
    pub parameters: Parameters,
    pub gateway_url: Option<String>,
    pub credential_name: Option<String>,
}

impl ExecutionConfig {
    pub fn new(playbook_path: impl Into<String>) -> Self {
        Self {
            playbook_path: playbook_path.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    pub fn with_credential(mut self, name: impl Into<String>) -> Self {
        self.credential_name = Some(name.into());
        self
    }

    /// Resources this unit holds while it runs.
    ///
    /// A browser token when the playbook path names a browser-driven area,
    /// a gateway token when a gateway URL is given.
    pub fn required_resources(&self) -> Vec<ResourceType> {
        let path = self.playbook_path.to_lowercase();
        let mut resources = Vec::new();
        if BROWSER_PATH_HINTS.iter().any(|hint| path.contains(hint)) {
            resources.push(ResourceType::Browser);
        }
        if self.gateway_url.as_deref().map_or(false, |url| !url.trim().is_empty()) {
            resources.push(ResourceType::Gateway);
        }
        resources
    }
}

impl From<ExecutionConfig> for ExecutionRequest {
    fn from(config: ExecutionConfig) -> Self {
        ExecutionRequest {
            playbook_path: config.playbook_path,
            parameters: config.parameters,
            gateway_url: config.gateway_url,
            credential_name: config.credential_name,
            execution_id: None,
            debug: false,
        }
    }
}

/// Lifecycle of a batch member.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParallelState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Record of one batch member.
#[derive(Serialize, Debug, Clone)]
pub struct ParallelExecution {
    pub id: String,
    pub playbook_path: String,
    pub execution_id: Option<String>,
    pub status: ParallelState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Final execution state, as JSON
    pub result: Option<Value>,
}

impl ParallelExecution {
    fn running(playbook_path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            playbook_path: playbook_path.to_string(),
            execution_id: None,
            status: ParallelState::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// Record for a member that was never launched.
    fn not_started(playbook_path: &str) -> Self {
        Self {
            started_at: None,
            ..Self::running(playbook_path)
        }
        .finished(ParallelState::Cancelled, Some("Not started: batch halted".to_string()))
    }

    fn finished(mut self, status: ParallelState, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Point-in-time view of the manager.
#[derive(Serialize, Debug, Clone)]
pub struct ParallelStatus {
    pub running: usize,
    pub max_parallel: usize,
    pub resources: HashMap<ResourceType, ResourceStatus>,
}

struct ActiveUnit {
    record: ParallelExecution,
    abort: AbortHandle,
}

/// Removes a batch's units from the active table on every exit path,
/// including when the batch future is dropped before it finishes.
struct BatchGuard<'a> {
    manager: &'a ParallelExecutionManager,
    ids: Vec<Option<String>>,
}

impl BatchGuard<'_> {
    /// Takes every launched unit out of the active table, indexed by
    /// submission order. Units still running are aborted and closed with
    /// `status` and `reason`.
    fn drain(&mut self, status: ParallelState, reason: &str) -> Vec<Option<ParallelExecution>> {
        let mut active = self.manager.active.lock();
        self.ids
            .iter_mut()
            .map(|id| {
                let unit = active.remove(id.take()?.as_str())?;
                Some(match unit.record.status {
                    ParallelState::Running => {
                        unit.abort.abort();
                        unit.record.finished(status, Some(reason.to_string()))
                    }
                    _ => unit.record,
                })
            })
            .collect()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.ids.iter().all(Option::is_none) {
            return;
        }
        let records: Vec<ParallelExecution> = self
            .drain(ParallelState::Cancelled, "Cancelled: batch dropped")
            .into_iter()
            .flatten()
            .collect();
        warn!("Batch dropped with {} unit(s) outstanding", records.len());
        self.manager.remember(&records);
    }
}

/// Runs batches of executions concurrently.
pub struct ParallelExecutionManager {
    max_parallel: usize,
    slots: Arc<Semaphore>,
    limiter: Arc<ResourceLimiter>,
    resource_timeout: Option<Duration>,
    active: Mutex<HashMap<String, ActiveUnit>>,
    history: Mutex<VecDeque<ParallelExecution>>,
}

impl ParallelExecutionManager {
    /// Creates a manager. A ceiling of zero is raised to one.
    pub fn new(max_parallel: usize, limiter: Arc<ResourceLimiter>) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            max_parallel,
            slots: Arc::new(Semaphore::new(max_parallel)),
            limiter,
            resource_timeout: None,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Bounds how long a unit waits for its resource tokens.
    pub fn with_resource_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resource_timeout = timeout;
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.limiter
    }

    /// Runs every config through `execution_fn` and returns the records in
    /// submission order.
    ///
    /// Without fail-fast, member failures are recorded and the batch result
    /// is `Ok`. With fail-fast, the first failure is returned as the error;
    /// the batch's records stay available through [`Self::get_history`].
    /// A member that ends in a cancellation never halts the batch.
    pub async fn run_parallel<F, Fut>(
        &self,
        configs: Vec<ExecutionConfig>,
        execution_fn: F,
        fail_fast: bool,
    ) -> Result<Vec<ParallelExecution>>
    where
        F: Fn(ExecutionConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionState>> + Send + 'static,
    {
        let total = configs.len();
        info!(
            "Running {} executions (max parallel: {}, fail fast: {})",
            total, self.max_parallel, fail_fast
        );

        let execution_fn = Arc::new(execution_fn);
        let halted = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<(usize, Result<ExecutionState>)> = JoinSet::new();
        let mut guard = BatchGuard {
            manager: self,
            ids: vec![None; total],
        };
        let mut records: Vec<Option<ParallelExecution>> = vec![None; total];

        for (index, config) in configs.into_iter().enumerate() {
            let slot = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(slot) => slot,
                Err(e) => {
                    error!("Slot pool closed: {}", e);
                    records[index] = Some(ParallelExecution::not_started(&config.playbook_path));
                    continue;
                }
            };
            if fail_fast && halted.load(Ordering::SeqCst) {
                records[index] = Some(ParallelExecution::not_started(&config.playbook_path));
                continue;
            }

            let record = ParallelExecution::running(&config.playbook_path);
            let id = record.id.clone();
            debug!("Launching {} ('{}')", id, config.playbook_path);

            let resources = config.required_resources();
            let limiter = Arc::clone(&self.limiter);
            let timeout = self.resource_timeout;
            let execution_fn = Arc::clone(&execution_fn);
            let halted = Arc::clone(&halted);
            let unit = async move {
                let _slot = slot;
                let _tokens = match limiter.acquire_all(&resources, timeout).await {
                    Ok(tokens) => tokens,
                    Err(resource) => {
                        halted.store(true, Ordering::SeqCst);
                        return (index, Err(OrchestratorError::ResourceUnavailable(resource)));
                    }
                };
                if fail_fast && halted.load(Ordering::SeqCst) {
                    return (
                        index,
                        Err(OrchestratorError::Cancelled("batch halted".to_string())),
                    );
                }

                let result = execution_fn(config).await;
                if matches!(&result, Err(e) if !e.is_cancellation()) {
                    // Set before the slot is released so the launcher sees it.
                    halted.store(true, Ordering::SeqCst);
                }
                (index, result)
            };

            let mut active = self.active.lock();
            let abort = join_set.spawn(unit);
            active.insert(id.clone(), ActiveUnit { record, abort });
            guard.ids[index] = Some(id);
        }

        let mut first_error: Option<OrchestratorError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    let Some(id) = guard.ids[index].clone() else {
                        continue;
                    };
                    let failed = matches!(&result, Err(e) if !e.is_cancellation());
                    self.complete(&id, result, fail_fast && first_error.is_none(), &mut first_error);
                    if failed && fail_fast && !join_set.is_empty() {
                        warn!("Fail-fast: aborting {} running execution(s)", join_set.len());
                        join_set.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("Parallel execution task failed: {}", e);
                    if fail_fast && first_error.is_none() {
                        first_error = Some(OrchestratorError::TaskAborted(e.to_string()));
                        join_set.abort_all();
                    }
                }
            }
        }

        // Anything still RUNNING here was aborted.
        let drained = if fail_fast && first_error.is_some() {
            guard.drain(ParallelState::Cancelled, "Cancelled: batch halted")
        } else {
            guard.drain(ParallelState::Failed, "Execution task aborted")
        };
        for (slot, record) in records.iter_mut().zip(drained) {
            if record.is_some() {
                *slot = record;
            }
        }

        let records: Vec<ParallelExecution> = records.into_iter().flatten().collect();
        self.remember(&records);
        info!(
            "Batch finished: {} completed, {} failed, {} cancelled",
            records.iter().filter(|r| r.status == ParallelState::Completed).count(),
            records.iter().filter(|r| r.status == ParallelState::Failed).count(),
            records.iter().filter(|r| r.status == ParallelState::Cancelled).count()
        );

        match first_error {
            Some(e) if fail_fast => Err(e),
            _ => Ok(records),
        }
    }

    /// Records a unit's outcome unless it was cancelled meanwhile.
    fn complete(
        &self,
        id: &str,
        result: Result<ExecutionState>,
        capture_error: bool,
        first_error: &mut Option<OrchestratorError>,
    ) {
        let mut active = self.active.lock();
        let Some(unit) = active.get_mut(id) else {
            return;
        };
        if unit.record.status != ParallelState::Running {
            return;
        }

        match result {
            Ok(state) => {
                unit.record.execution_id = Some(state.execution_id.clone());
                unit.record.result = serde_json::to_value(&state).ok();
                unit.record.status = ParallelState::Completed;
                unit.record.completed_at = Some(Utc::now());
                info!("Parallel execution {} completed", id);
            }
            Err(e) if e.is_cancellation() => {
                warn!("Parallel execution {} cancelled: {}", id, e);
                unit.record.status = ParallelState::Cancelled;
                unit.record.error = Some(e.to_string());
                unit.record.completed_at = Some(Utc::now());
            }
            Err(e) => {
                error!("Parallel execution {} failed: {}", id, e);
                unit.record.status = ParallelState::Failed;
                unit.record.error = Some(e.to_string());
                unit.record.completed_at = Some(Utc::now());
                if capture_error {
                    *first_error = Some(e);
                }
            }
        }
    }

    fn remember(&self, records: &[ParallelExecution]) {
        let mut history = self.history.lock();
        for record in records {
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
    }

    /// Aborts one running unit. Returns false if it is not running.
    pub fn cancel(&self, id: &str) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(id) {
            // A finished task keeps its outcome; the join loop records it.
            Some(unit)
                if unit.record.status == ParallelState::Running && !unit.abort.is_finished() =>
            {
                unit.abort.abort();
                unit.record.status = ParallelState::Cancelled;
                unit.record.error = Some("Cancelled".to_string());
                unit.record.completed_at = Some(Utc::now());
                info!("Cancelled parallel execution {}", id);
                true
            }
            _ => false,
        }
    }

    /// Looks a unit up among running units first, then finished ones.
    pub fn get(&self, id: &str) -> Option<ParallelExecution> {
        if let Some(unit) = self.active.lock().get(id) {
            return Some(unit.record.clone());
        }
        self.history.lock().iter().rev().find(|r| r.id == id).cloned()
    }

    /// Records of finished units, oldest first.
    pub fn get_history(&self) -> Vec<ParallelExecution> {
        self.history.lock().iter().cloned().collect()
    }

    /// Records of units currently running.
    pub fn get_running(&self) -> Vec<ParallelExecution> {
        self.active
            .lock()
            .values()
            .filter(|unit| unit.record.status == ParallelState::Running)
            .map(|unit| unit.record.clone())
            .collect()
    }

    pub fn get_status(&self) -> ParallelStatus {
        ParallelStatus {
            running: self.get_running().len(),
            max_parallel: self.max_parallel,
            resources: self.limiter.get_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{Playbook, PlaybookStep, StepType};
    use std::sync::atomic::AtomicUsize;

    fn state_for(config: &ExecutionConfig) -> ExecutionState {
        let playbook = Playbook::new(config.playbook_path.clone())
            .with_step(PlaybookStep::new("s", "S", StepType::UtilityLog));
        ExecutionState::new(Uuid::new_v4().to_string(), &playbook)
    }

    /// Tracks how many units run at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn manager(max_parallel: usize, limits: &[(ResourceType, usize)]) -> ParallelExecutionManager {
        ParallelExecutionManager::new(
            max_parallel,
            Arc::new(ResourceLimiter::new(limits.iter().copied())),
        )
    }

    #[test]
    fn test_required_resources_inference() {
        let plain = ExecutionConfig::new("playbooks/gateway/login.yaml");
        assert!(plain.required_resources().is_empty());

        let browser = ExecutionConfig::new("playbooks/Perspective/checkout.yaml");
        assert_eq!(browser.required_resources(), vec![ResourceType::Browser]);

        let both = ExecutionConfig::new("designer_smoke.yaml").with_gateway_url("http://gw:8088");
        assert_eq!(
            both.required_resources(),
            vec![ResourceType::Browser, ResourceType::Gateway]
        );

        let blank_url = ExecutionConfig::new("a.yaml").with_gateway_url("  ");
        assert!(blank_url.required_resources().is_empty());
    }

    #[tokio::test]
    async fn test_all_members_complete_in_submission_order() {
        let manager = manager(3, &[]);
        let configs: Vec<ExecutionConfig> =
            (0..5).map(|i| ExecutionConfig::new(format!("p{}.yaml", i))).collect();

        let records = manager
            .run_parallel(configs, |config| async move { Ok(state_for(&config)) }, false)
            .await
            .unwrap();

        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.playbook_path, format!("p{}.yaml", i));
            assert_eq!(record.status, ParallelState::Completed);
            assert!(record.execution_id.is_some());
            assert!(record.result.is_some());
        }
        assert_eq!(manager.get_status().running, 0);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_without_fail_fast() {
        let manager = manager(2, &[]);
        let configs = vec![
            ExecutionConfig::new("ok.yaml"),
            ExecutionConfig::new("bad.yaml"),
            ExecutionConfig::new("ok2.yaml"),
        ];

        let records = manager
            .run_parallel(
                configs,
                |config| async move {
                    if config.playbook_path == "bad.yaml" {
                        Err(OrchestratorError::Config("broken".to_string()))
                    } else {
                        Ok(state_for(&config))
                    }
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(records[0].status, ParallelState::Completed);
        assert_eq!(records[1].status, ParallelState::Failed);
        assert!(records[1].error.as_deref().unwrap().contains("broken"));
        assert_eq!(records[2].status, ParallelState::Completed);
    }

    #[tokio::test]
    async fn test_slot_ceiling_is_respected() {
        let manager = manager(2, &[]);
        let gauge = Arc::new(Gauge::default());
        let configs: Vec<ExecutionConfig> =
            (0..6).map(|i| ExecutionConfig::new(format!("p{}.yaml", i))).collect();

        let g = Arc::clone(&gauge);
        manager
            .run_parallel(
                configs,
                move |config| {
                    let gauge = Arc::clone(&g);
                    async move {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        gauge.exit();
                        Ok(state_for(&config))
                    }
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(gauge.calls.load(Ordering::SeqCst), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_browser_tokens_gate_units() {
        let manager = manager(4, &[(ResourceType::Browser, 1)]);
        let gauge = Arc::new(Gauge::default());
        let configs: Vec<ExecutionConfig> = (0..3)
            .map(|i| ExecutionConfig::new(format!("perspective_{}.yaml", i)))
            .collect();

        let g = Arc::clone(&gauge);
        let records = manager
            .run_parallel(
                configs,
                move |config| {
                    let gauge = Arc::clone(&g);
                    async move {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        gauge.exit();
                        Ok(state_for(&config))
                    }
                },
                false,
            )
            .await
            .unwrap();

        assert!(records.iter().all(|r| r.status == ParallelState::Completed));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.limiter().status_of(ResourceType::Browser).unwrap().in_use,
            0
        );
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_running_members() {
        let manager = manager(3, &[]);
        let configs = vec![
            ExecutionConfig::new("bad.yaml"),
            ExecutionConfig::new("slow-1.yaml"),
            ExecutionConfig::new("slow-2.yaml"),
        ];

        let result = manager
            .run_parallel(
                configs,
                |config| async move {
                    if config.playbook_path == "bad.yaml" {
                        return Err(OrchestratorError::Config("bad playbook".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(state_for(&config))
                },
                true,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("bad playbook"));
        assert!(manager.get_running().is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_launching() {
        let manager = manager(1, &[]);
        let gauge = Arc::new(Gauge::default());
        let configs = vec![
            ExecutionConfig::new("bad.yaml"),
            ExecutionConfig::new("never-1.yaml"),
            ExecutionConfig::new("never-2.yaml"),
        ];

        let g = Arc::clone(&gauge);
        let result = manager
            .run_parallel(
                configs,
                move |config| {
                    let gauge = Arc::clone(&g);
                    async move {
                        gauge.enter();
                        gauge.exit();
                        if config.playbook_path == "bad.yaml" {
                            Err(OrchestratorError::Config("bad".to_string()))
                        } else {
                            Ok(state_for(&config))
                        }
                    }
                },
                true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(gauge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_timeout_fails_unit() {
        let limiter = Arc::new(ResourceLimiter::new([(ResourceType::Browser, 1)]));
        let _held = limiter.try_acquire(ResourceType::Browser).unwrap();
        let manager = ParallelExecutionManager::new(2, Arc::clone(&limiter))
            .with_resource_timeout(Some(Duration::from_millis(100)));

        let records = manager
            .run_parallel(
                vec![ExecutionConfig::new("browser_check.yaml")],
                |config| async move { Ok(state_for(&config)) },
                false,
            )
            .await
            .unwrap();

        assert_eq!(records[0].status, ParallelState::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("browser"));
    }

    #[tokio::test]
    async fn test_cancel_running_member() {
        let manager = Arc::new(manager(2, &[]));
        let batch = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run_parallel(
                        vec![ExecutionConfig::new("forever.yaml")],
                        |config| async move {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(state_for(&config))
                        },
                        false,
                    )
                    .await
            })
        };

        let mut running = Vec::new();
        for _ in 0..200 {
            running = manager.get_running();
            if !running.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let id = running[0].id.clone();
        assert_eq!(manager.get_status().running, 1);

        assert!(manager.cancel(&id));
        assert!(!manager.cancel(&id));
        assert!(!manager.cancel("unknown"));

        let records = batch.await.unwrap().unwrap();
        assert_eq!(records[0].status, ParallelState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_member_does_not_halt_fail_fast_batch() {
        let manager = manager(2, &[]);
        let configs = vec![
            ExecutionConfig::new("stopped.yaml"),
            ExecutionConfig::new("steady.yaml"),
        ];

        let records = manager
            .run_parallel(
                configs,
                |config| async move {
                    if config.playbook_path == "stopped.yaml" {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        return Err(OrchestratorError::Cancelled("stopped by operator".to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(state_for(&config))
                },
                true,
            )
            .await
            .unwrap();

        assert_eq!(records[0].status, ParallelState::Cancelled);
        assert!(records[0].error.as_deref().unwrap().contains("stopped by operator"));
        assert_eq!(records[1].status, ParallelState::Completed);
    }

    #[tokio::test]
    async fn test_fail_fast_records_kept_in_history() {
        let manager = manager(2, &[]);
        let configs = vec![
            ExecutionConfig::new("bad.yaml"),
            ExecutionConfig::new("slow.yaml"),
            ExecutionConfig::new("later.yaml"),
        ];

        let result = manager
            .run_parallel(
                configs,
                |config| async move {
                    if config.playbook_path == "bad.yaml" {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        return Err(OrchestratorError::Config("bad playbook".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(state_for(&config))
                },
                true,
            )
            .await;
        assert!(result.is_err());

        let history = manager.get_history();
        let paths: Vec<&str> = history.iter().map(|r| r.playbook_path.as_str()).collect();
        assert_eq!(paths, vec!["bad.yaml", "slow.yaml", "later.yaml"]);

        assert_eq!(history[0].status, ParallelState::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("bad playbook"));
        assert_eq!(history[1].status, ParallelState::Cancelled);
        assert!(history[1].error.as_deref().unwrap().contains("batch halted"));
        assert_eq!(history[2].status, ParallelState::Cancelled);
        assert!(history[2].error.as_deref().unwrap().starts_with("Not started"));
        assert!(history[2].started_at.is_none());

        let slow = manager.get(&history[1].id).unwrap();
        assert_eq!(slow.status, ParallelState::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_batch_clears_active_units() {
        let manager = Arc::new(manager(2, &[]));
        let batch = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run_parallel(
                        vec![ExecutionConfig::new("forever.yaml")],
                        |config| async move {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(state_for(&config))
                        },
                        false,
                    )
                    .await
            })
        };

        let mut running = Vec::new();
        for _ in 0..200 {
            running = manager.get_running();
            if !running.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let id = running[0].id.clone();

        batch.abort();
        assert!(batch.await.unwrap_err().is_cancelled());

        assert!(manager.get_running().is_empty());
        assert_eq!(manager.get_status().running, 0);
        assert!(!manager.cancel(&id));

        let record = manager.get(&id).unwrap();
        assert_eq!(record.status, ParallelState::Cancelled);
        assert!(record.error.as_deref().unwrap().contains("batch dropped"));
    }

    #[tokio::test]
    async fn test_cancel_leaves_finished_unit_to_join_loop() {
        let manager = manager(1, &[]);
        let mut join_set = JoinSet::new();
        let abort = join_set.spawn(async {});
        while !abort.is_finished() {
            tokio::task::yield_now().await;
        }

        let record = ParallelExecution::running("done.yaml");
        let id = record.id.clone();
        manager
            .active
            .lock()
            .insert(id.clone(), ActiveUnit { record, abort });

        assert!(!manager.cancel(&id));
        assert_eq!(manager.get(&id).unwrap().status, ParallelState::Running);
        assert!(join_set.join_next().await.unwrap().is_ok());
    }
}
