//! Playbook Execution Engine
//!
//! Runs the steps of one playbook strictly in order:
//! - validates the playbook and parameters and resolves credentials
//! - acquires resource tokens and opens browser/designer sessions
//! - executes each step with retries and a per-attempt timeout
//! - applies the step's on-failure policy
//! - honours pause, resume, skip, debug and cancel commands between steps
//!
//! Every state change is published to the update callback and the
//! execution store as it happens.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::control::{ControlCommand, ControlReceiver, ExecutionControl, StateManager};
use super::credentials::CredentialVault;
use super::session::{
    DetachedSessionProvider, SessionGuard, SessionHandle, SessionKind, SessionProvider,
};
use super::step::{StepError, StepExecutorRegistry, StepInvocation, TimeoutConfig};
use crate::error::{OrchestratorError, Result};
use crate::monitoring::{ExecutionTimeline, TimelineEventKind};
use crate::playbook::{
    preprocess_credential_parameters, substitute_placeholders, validate_parameters,
    validate_playbook, ExecutionState, ExecutionStatus, ExecutionStore, Parameters, Playbook,
    PlaybookStep, StepResult, StepStatus,
};
use crate::scheduling::{ResourceLimiter, ResourceType};

/// Called with a snapshot after every state change.
pub type UpdateCallback = Arc<dyn Fn(&ExecutionState) + Send + Sync>;

const CANCELLED_MESSAGE: &str = "Execution cancelled";

/// Executes a single playbook.
///
/// An engine runs its playbook once; the execution id is fixed at
/// construction so it can be controlled before it starts.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// use playrunner::execution::{InMemoryVault, PlaybookEngine, StepExecutorRegistry};
/// use playrunner::playbook::{Playbook, PlaybookStep, StepType};
///
/// # async fn run() -> playrunner::Result<()> {
/// let playbook = Playbook::new("smoke")
///     .with_step(PlaybookStep::new("hello", "Say hello", StepType::UtilityLog)
///         .with_parameter("message", "hello"));
///
/// let engine = PlaybookEngine::new(
///     playbook,
///     Arc::new(StepExecutorRegistry::with_builtins()),
///     Arc::new(InMemoryVault::new()),
/// );
/// let state = engine.execute_playbook(HashMap::new()).await?;
/// println!("{:?}", state.status);
/// # Ok(())
/// # }
/// ```
pub struct PlaybookEngine {
    playbook: Arc<Playbook>,
    registry: Arc<StepExecutorRegistry>,
    vault: Arc<dyn CredentialVault>,
    sessions: Arc<dyn SessionProvider>,
    timeouts: TimeoutConfig,
    limiter: Option<Arc<ResourceLimiter>>,
    resource_timeout: Option<Duration>,
    store: Option<Arc<dyn ExecutionStore>>,
    state_manager: Option<Arc<StateManager>>,
    on_update: Option<UpdateCallback>,
    control: ExecutionControl,
    receiver: Mutex<Option<ControlReceiver>>,
    state: RwLock<ExecutionState>,
    browser_session: RwLock<Option<SessionHandle>>,
    timeline: Mutex<ExecutionTimeline>,
}

/// Engine-side view of the control commands received so far.
#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    at_breakpoint: bool,
    skip_pending: bool,
    debug: bool,
    /// Steps released by `resume` while in debug mode
    debug_credits: u32,
    cancelled: bool,
}

#[derive(Debug, Default, Clone)]
struct ActiveSessions {
    browser: Option<SessionHandle>,
    designer: Option<SessionHandle>,
}

enum StepOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

enum RunOutcome {
    Finished,
    Aborted {
        step_id: String,
        step_name: String,
        message: String,
    },
    Cancelled,
}

impl PlaybookEngine {
    /// Creates an engine with a fresh execution id.
    pub fn new(
        playbook: Playbook,
        registry: Arc<StepExecutorRegistry>,
        vault: Arc<dyn CredentialVault>,
    ) -> Self {
        let execution_id = Uuid::new_v4().to_string();
        let (control, receiver) = ExecutionControl::channel(&execution_id);
        let state = ExecutionState::new(&execution_id, &playbook);

        Self {
            playbook: Arc::new(playbook),
            registry,
            vault,
            sessions: Arc::new(DetachedSessionProvider),
            timeouts: TimeoutConfig::default(),
            limiter: None,
            resource_timeout: None,
            store: None,
            state_manager: None,
            on_update: None,
            control,
            receiver: Mutex::new(Some(receiver)),
            state: RwLock::new(state),
            browser_session: RwLock::new(None),
            timeline: Mutex::new(ExecutionTimeline::new()),
        }
    }

    /// Uses a caller-assigned execution id.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        let execution_id = execution_id.into();
        let (control, receiver) = ExecutionControl::channel(&execution_id);
        self.control = control;
        self.receiver = Mutex::new(Some(receiver));
        self.state.get_mut().execution_id = execution_id;
        self
    }

    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = provider;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Holds the playbook's resource tokens for the whole execution.
    pub fn with_resource_limiter(
        mut self,
        limiter: Arc<ResourceLimiter>,
        timeout: Option<Duration>,
    ) -> Self {
        self.limiter = Some(limiter);
        self.resource_timeout = timeout;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers the execution with a state manager while it runs.
    pub fn with_state_manager(mut self, manager: Arc<StateManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    pub fn on_update(mut self, callback: UpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    pub fn execution_id(&self) -> &str {
        self.control.execution_id()
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    /// Snapshot of the current execution state.
    pub fn state(&self) -> ExecutionState {
        self.state.read().clone()
    }

    /// The open browser session, if any.
    pub fn browser_session(&self) -> Option<SessionHandle> {
        self.browser_session.read().clone()
    }

    /// Handle for sending control commands from elsewhere.
    pub fn control(&self) -> ExecutionControl {
        self.control.clone()
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        self.timeline.lock().clone()
    }

    /// Pauses before the next step. A running step is allowed to finish.
    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Skips the next step to start.
    pub fn skip_current_step(&self) -> bool {
        self.control.skip_current_step()
    }

    /// Enters debug mode: the engine pauses before every step and each
    /// `resume` releases exactly one step. Ignored for another execution id.
    pub fn enable_debug(&self, execution_id: &str) -> bool {
        if execution_id != self.execution_id() {
            warn!(
                "Debug mode requested for '{}' but this engine runs '{}'",
                execution_id,
                self.execution_id()
            );
            return false;
        }
        self.control.enable_debug()
    }

    pub fn disable_debug(&self) -> bool {
        self.control.disable_debug()
    }

    /// Cancels the execution. The in-flight step is abandoned.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Runs the playbook to completion.
    ///
    /// Returns the final state on completion, including completion with
    /// tolerated step failures. Configuration errors, an aborting step
    /// failure and cancellation are returned as errors; the final state is
    /// still available through [`PlaybookEngine::state`].
    pub async fn execute_playbook(&self, parameters: Parameters) -> Result<ExecutionState> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| OrchestratorError::AlreadyStarted(self.execution_id().to_string()))?;
        let _registration = self
            .state_manager
            .as_ref()
            .map(|manager| manager.register(self.control.clone()));
        let mut dropped = DropGuard {
            engine: self,
            armed: true,
        };

        info!(
            "Starting playbook '{}' (execution {}, {} steps)",
            self.playbook.name,
            self.execution_id(),
            self.playbook.len()
        );
        self.update(|state| {
            state.status = ExecutionStatus::Started;
            state.started_at = Utc::now();
        })
        .await;

        let outcome = match self.prepare(&parameters).await {
            Ok(resolved) => self.run_with_resources(&resolved, &mut receiver).await,
            Err(e) => {
                error!("Execution {} rejected: {}", self.execution_id(), e);
                Err(e)
            }
        };

        dropped.armed = false;
        self.finish(outcome).await
    }

    /// Configuration phase. Nothing here is retried.
    async fn prepare(&self, parameters: &Parameters) -> Result<Parameters> {
        validate_playbook(&self.playbook)?;
        validate_parameters(&self.playbook, parameters)?;

        if let Some((step, step_type)) = self.registry.missing_for(&self.playbook).into_iter().next() {
            return Err(OrchestratorError::UnknownStepExecutor {
                step,
                step_type: step_type.to_string(),
            });
        }

        preprocess_credential_parameters(&self.playbook, parameters, self.vault.as_ref()).await
    }

    fn required_resources(&self) -> Vec<ResourceType> {
        let mut resources = Vec::new();
        if self.playbook.needs_browser() || self.playbook.needs_designer() {
            resources.push(ResourceType::Browser);
        }
        if self.playbook.needs_gateway() {
            resources.push(ResourceType::Gateway);
        }
        resources
    }

    async fn run_with_resources(
        &self,
        resolved: &Parameters,
        receiver: &mut ControlReceiver,
    ) -> Result<RunOutcome> {
        let mut ctl = ControlState::default();
        let resources = self.required_resources();
        let _tokens = match &self.limiter {
            Some(limiter) if !resources.is_empty() => {
                debug!("Execution {} waiting for {:?}", self.execution_id(), resources);
                let acquire = limiter.acquire_all(&resources, self.resource_timeout);
                match self.drive(acquire, receiver, &mut ctl).await {
                    Some(tokens) => tokens.map_err(OrchestratorError::ResourceUnavailable)?,
                    None => {
                        warn!(
                            "Execution {} cancelled while waiting for resources",
                            self.execution_id()
                        );
                        return Ok(RunOutcome::Cancelled);
                    }
                }
            }
            _ => Vec::new(),
        };

        let browser = if self.playbook.needs_browser() {
            Some(SessionGuard::open(Arc::clone(&self.sessions), SessionKind::Browser).await?)
        } else {
            None
        };
        let designer = if self.playbook.needs_designer() {
            Some(SessionGuard::open(Arc::clone(&self.sessions), SessionKind::Designer).await?)
        } else {
            None
        };

        let sessions = ActiveSessions {
            browser: browser.as_ref().and_then(|g| g.handle().cloned()),
            designer: designer.as_ref().and_then(|g| g.handle().cloned()),
        };
        *self.browser_session.write() = sessions.browser.clone();

        let outcome = self.run_steps(resolved, &sessions, receiver, &mut ctl).await;

        *self.browser_session.write() = None;
        if let Some(guard) = designer {
            guard.close().await;
        }
        if let Some(guard) = browser {
            guard.close().await;
        }
        Ok(outcome)
    }

    async fn run_steps(
        &self,
        resolved: &Parameters,
        sessions: &ActiveSessions,
        receiver: &mut ControlReceiver,
        ctl: &mut ControlState,
    ) -> RunOutcome {
        self.update(|state| state.status = ExecutionStatus::Running)
            .await;

        for step in &self.playbook.steps {
            while let Some(command) = receiver.try_recv() {
                self.apply(command, ctl);
            }

            if ctl.debug {
                if ctl.debug_credits > 0 {
                    ctl.debug_credits -= 1;
                } else {
                    info!("Breakpoint before step '{}'", step.id);
                    ctl.paused = true;
                    ctl.at_breakpoint = true;
                }
            }
            if ctl.paused && !ctl.cancelled {
                self.wait_while_paused(step, receiver, ctl).await;
            }
            if ctl.cancelled {
                return RunOutcome::Cancelled;
            }

            if ctl.skip_pending {
                ctl.skip_pending = false;
                receiver.update_flags(|flags| flags.skip_requested = false);
                self.skip_step(step).await;
                continue;
            }

            match self.run_step(step, resolved, sessions, receiver, ctl).await {
                StepOutcome::Completed => {}
                StepOutcome::Failed(message) if step.on_failure.halts() => {
                    return RunOutcome::Aborted {
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        message,
                    };
                }
                StepOutcome::Failed(_) => {
                    warn!(
                        "Step '{}' failed; continuing under {:?} policy",
                        step.id, step.on_failure
                    );
                }
                StepOutcome::Cancelled => return RunOutcome::Cancelled,
            }
        }

        RunOutcome::Finished
    }

    fn apply(&self, command: ControlCommand, ctl: &mut ControlState) {
        debug!("Execution {} received {:?}", self.execution_id(), command);
        match command {
            ControlCommand::Pause => ctl.paused = true,
            ControlCommand::Resume => {
                ctl.paused = false;
                if ctl.debug {
                    ctl.debug_credits += 1;
                }
            }
            ControlCommand::SkipCurrentStep => ctl.skip_pending = true,
            ControlCommand::EnableDebug => {
                ctl.debug = true;
                self.state.write().debug_mode = true;
            }
            ControlCommand::DisableDebug => {
                ctl.debug = false;
                ctl.debug_credits = 0;
                if ctl.at_breakpoint {
                    ctl.paused = false;
                }
                self.state.write().debug_mode = false;
            }
            ControlCommand::Cancel => ctl.cancelled = true,
        }
    }

    async fn wait_while_paused(
        &self,
        step: &PlaybookStep,
        receiver: &mut ControlReceiver,
        ctl: &mut ControlState,
    ) {
        info!("Execution {} paused before step '{}'", self.execution_id(), step.id);
        self.timeline.lock().record(&step.id, TimelineEventKind::Paused);
        receiver.update_flags(|flags| flags.paused = true);
        self.update(|state| state.status = ExecutionStatus::Paused)
            .await;

        while ctl.paused && !ctl.cancelled {
            match receiver.recv().await {
                Some(command) => self.apply(command, ctl),
                None => ctl.cancelled = true,
            }
        }

        ctl.at_breakpoint = false;
        if ctl.debug && ctl.debug_credits > 0 {
            ctl.debug_credits -= 1;
        }
        receiver.update_flags(|flags| flags.paused = false);
        self.timeline.lock().record(&step.id, TimelineEventKind::Resumed);

        if !ctl.cancelled {
            info!("Execution {} resumed", self.execution_id());
            self.update(|state| state.status = ExecutionStatus::Running)
                .await;
        }
    }

    async fn skip_step(&self, step: &PlaybookStep) {
        info!("Skipping step '{}' on request", step.id);
        self.timeline.lock().record(&step.id, TimelineEventKind::StepSkipped);
        self.update_step(&step.id, |result| {
            result.status = StepStatus::Skipped;
            result.completed_at = Some(Utc::now());
        })
        .await;
    }

    async fn run_step(
        &self,
        step: &PlaybookStep,
        resolved: &Parameters,
        sessions: &ActiveSessions,
        receiver: &mut ControlReceiver,
        ctl: &mut ControlState,
    ) -> StepOutcome {
        info!("Starting step '{}' ({})", step.id, step.step_type);
        self.timeline.lock().record(&step.id, TimelineEventKind::StepStarted);
        self.update_step(&step.id, |result| {
            *result = StepResult::pending(&step.id, &step.name);
            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());
        })
        .await;

        let Some(executor) = self.registry.get(step.step_type) else {
            let message = format!("No executor registered for {}", step.step_type);
            return self.fail_step(step, 0, message).await;
        };

        let parameters = substitute_placeholders(&step.parameters, resolved);
        let timeout = Duration::from_secs(step.timeout);
        let attempts = step.retry_count.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let invocation = StepInvocation {
                execution_id: self.execution_id().to_string(),
                step_id: step.id.clone(),
                step_type: step.step_type,
                parameters: parameters.clone(),
                timeout,
                attempt,
                timeouts: self.timeouts.clone(),
                browser_session: sessions.browser.clone(),
                designer_session: sessions.designer.clone(),
            };
            let bounded = tokio::time::timeout(timeout, executor.execute(&invocation));

            let Some(result) = self.drive(bounded, receiver, ctl).await else {
                warn!("Step '{}' abandoned: execution cancelled", step.id);
                self.timeline.lock().record(&step.id, TimelineEventKind::StepSkipped);
                self.update_step(&step.id, |result| {
                    result.status = StepStatus::Skipped;
                    result.error = Some(CANCELLED_MESSAGE.to_string());
                    result.completed_at = Some(Utc::now());
                    result.attempts = attempt;
                })
                .await;
                return StepOutcome::Cancelled;
            };

            match result {
                Ok(Ok(output)) => {
                    info!("Step '{}' completed", step.id);
                    self.timeline.lock().record(&step.id, TimelineEventKind::StepCompleted);
                    self.update_step(&step.id, |result| {
                        result.status = StepStatus::Completed;
                        result.output = Some(output);
                        result.completed_at = Some(Utc::now());
                        result.attempts = attempt;
                    })
                    .await;
                    return StepOutcome::Completed;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = StepError::Timeout(timeout).to_string(),
            }

            if attempt < attempts {
                warn!(
                    "Step '{}' attempt {}/{} failed: {}; retrying",
                    step.id, attempt, attempts, last_error
                );
            }
        }

        self.fail_step(step, attempts, last_error).await
    }

    async fn fail_step(&self, step: &PlaybookStep, attempts: u32, message: String) -> StepOutcome {
        error!("Step '{}' failed: {}", step.id, message);
        self.timeline.lock().record(&step.id, TimelineEventKind::StepFailed);
        let recorded = message.clone();
        self.update_step(&step.id, |result| {
            result.status = StepStatus::Failed;
            result.error = Some(recorded);
            result.completed_at = Some(Utc::now());
            result.attempts = attempts;
        })
        .await;
        StepOutcome::Failed(message)
    }

    /// Polls `future` while applying control commands. Returns `None` if the
    /// execution was cancelled first; the future is dropped in that case.
    async fn drive<F: Future>(
        &self,
        future: F,
        receiver: &mut ControlReceiver,
        ctl: &mut ControlState,
    ) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            let command = tokio::select! {
                output = &mut future => return Some(output),
                command = receiver.recv() => command,
            };
            match command {
                Some(command) => {
                    self.apply(command, ctl);
                    if ctl.cancelled {
                        return None;
                    }
                }
                None => return Some(future.await),
            }
        }
    }

    async fn finish(&self, outcome: Result<RunOutcome>) -> Result<ExecutionState> {
        let (status, message, result) = match outcome {
            Ok(RunOutcome::Finished) => {
                let failed = self.state.read().failed_steps();
                let message = (!failed.is_empty()).then(|| {
                    format!(
                        "{} step(s) failed and were tolerated: {}",
                        failed.len(),
                        failed.join(", ")
                    )
                });
                (ExecutionStatus::Completed, message, Ok(()))
            }
            Ok(RunOutcome::Aborted {
                step_id,
                step_name,
                message,
            }) => (
                ExecutionStatus::Failed,
                Some(format!("Step '{}' failed: {}", step_id, message)),
                Err(OrchestratorError::StepFailed {
                    step_id,
                    step_name,
                    message,
                }),
            ),
            Ok(RunOutcome::Cancelled) => (
                ExecutionStatus::Cancelled,
                Some(CANCELLED_MESSAGE.to_string()),
                Err(OrchestratorError::Cancelled(self.execution_id().to_string())),
            ),
            Err(e) => (ExecutionStatus::Failed, Some(e.to_string()), Err(e)),
        };

        let snapshot = self
            .update(|state| {
                state.error = message;
                state.finish(status);
            })
            .await;

        info!(
            "Playbook '{}' finished: {:?} ({} completed, {} failed, {} skipped)",
            snapshot.playbook_name,
            snapshot.status,
            snapshot.count(StepStatus::Completed),
            snapshot.count(StepStatus::Failed),
            snapshot.count(StepStatus::Skipped)
        );

        result.map(|()| snapshot)
    }

    async fn update(&self, mutate: impl FnOnce(&mut ExecutionState)) -> ExecutionState {
        let snapshot = {
            let mut state = self.state.write();
            mutate(&mut state);
            state.clone()
        };
        self.publish(&snapshot).await;
        snapshot
    }

    async fn update_step(&self, step_id: &str, mutate: impl FnOnce(&mut StepResult)) {
        self.update(|state| {
            if let Some(result) = state.step_result_mut(step_id) {
                mutate(result);
            }
        })
        .await;
    }

    async fn publish(&self, snapshot: &ExecutionState) {
        if let Some(callback) = &self.on_update {
            callback(snapshot);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(snapshot).await {
                warn!("Failed to persist execution {}: {}", snapshot.execution_id, e);
            }
        }
    }
}

/// Marks the execution cancelled if `execute_playbook` is dropped mid-run.
struct DropGuard<'a> {
    engine: &'a PlaybookEngine,
    armed: bool,
}

impl Drop for DropGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let snapshot = {
            let mut state = self.engine.state.write();
            if state.is_finished() {
                return;
            }
            for result in &mut state.step_results {
                if result.status == StepStatus::Running {
                    result.status = StepStatus::Skipped;
                    result.error = Some(CANCELLED_MESSAGE.to_string());
                    result.completed_at = Some(Utc::now());
                }
            }
            state.error = Some(CANCELLED_MESSAGE.to_string());
            state.finish(ExecutionStatus::Cancelled);
            state.clone()
        };
        *self.engine.browser_session.write() = None;
        warn!("Execution {} dropped before completion", snapshot.execution_id);

        if let Some(callback) = &self.engine.on_update {
            callback(&snapshot);
        }
        if let (Some(store), Ok(runtime)) = (&self.engine.store, tokio::runtime::Handle::try_current()) {
            let store = Arc::clone(store);
            runtime.spawn(async move {
                if let Err(e) = store.save(&snapshot).await {
                    warn!("Failed to persist execution {}: {}", snapshot.execution_id, e);
                }
            });
        }
    }
}
