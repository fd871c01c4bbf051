//! Step Executors
//!
//! Each step type is handled by a [`StepExecutor`] looked up in a
//! [`StepExecutorRegistry`]. The engine builds a [`StepInvocation`] per
//! attempt with placeholders already substituted and the active sessions
//! attached.
//!
//! Only the utility executors ship with the crate. Gateway, browser,
//! perspective and designer executors drive external systems and are
//! registered by the embedding application.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use thiserror::Error;

use super::session::SessionHandle;
use crate::playbook::{Playbook, StepType};

/// Timeouts for long-running external operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub gateway_restart: Duration,
    pub module_install: Duration,
    pub browser_operation: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            gateway_restart: Duration::from_secs(120),
            module_install: Duration::from_secs(300),
            browser_operation: Duration::from_millis(30_000),
        }
    }
}

impl TimeoutConfig {
    /// Applies overrides keyed by timeout name.
    ///
    /// `gateway_restart` and `module_install` are seconds,
    /// `browser_operation` is milliseconds. Unknown names are ignored.
    pub fn with_overrides(mut self, overrides: &HashMap<String, u64>) -> Self {
        for (name, value) in overrides {
            match name.as_str() {
                "gateway_restart" => self.gateway_restart = Duration::from_secs(*value),
                "module_install" => self.module_install = Duration::from_secs(*value),
                "browser_operation" => self.browser_operation = Duration::from_millis(*value),
                other => warn!("Ignoring unknown timeout override '{}'", other),
            }
        }
        self
    }
}

/// Why a step attempt failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },
}

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub execution_id: String,
    pub step_id: String,
    pub step_type: StepType,
    /// Parameters with placeholders substituted
    pub parameters: HashMap<String, Value>,
    pub timeout: Duration,
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub timeouts: TimeoutConfig,
    pub browser_session: Option<SessionHandle>,
    pub designer_session: Option<SessionHandle>,
}

impl StepInvocation {
    pub fn new(execution_id: impl Into<String>, step_id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_id: step_id.into(),
            step_type,
            parameters: HashMap::new(),
            timeout: Duration::from_secs(300),
            attempt: 1,
            timeouts: TimeoutConfig::default(),
            browser_session: None,
            designer_session: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Returns a required string parameter.
    pub fn str_param(&self, name: &str) -> Result<&str, StepError> {
        match self.parameters.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(StepError::InvalidParameter {
                name: name.to_string(),
                message: format!("expected a string, got {}", other),
            }),
            None => Err(StepError::InvalidParameter {
                name: name.to_string(),
                message: "missing".to_string(),
            }),
        }
    }

    /// Returns a numeric parameter, accepting numeric strings.
    pub fn f64_param(&self, name: &str) -> Option<f64> {
        match self.parameters.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Performs one step type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs one attempt and returns the step output.
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, StepError>;
}

/// Executor backed by a synchronous closure.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F> StepExecutor for FnExecutor<F>
where
    F: Fn(&StepInvocation) -> Result<Value, StepError> + Send + Sync,
{
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        (self.0)(invocation)
    }
}

/// Step executors keyed by step type.
#[derive(Clone, Default)]
pub struct StepExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl StepExecutorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the utility executors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StepType::UtilitySleep, SleepExecutor);
        registry.register(StepType::UtilityLog, LogExecutor);
        registry.register(StepType::UtilitySetVariable, SetVariableExecutor);
        registry
    }

    /// Registers an executor, replacing any previous one for the type.
    pub fn register(&mut self, step_type: StepType, executor: impl StepExecutor + 'static) {
        if self
            .executors
            .insert(step_type, Arc::new(executor))
            .is_some()
        {
            debug!("Replaced executor for {}", step_type);
        }
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step_type).cloned()
    }

    pub fn supports(&self, step_type: StepType) -> bool {
        self.executors.contains_key(&step_type)
    }

    /// Returns `(step_id, step_type)` for every step without an executor.
    pub fn missing_for(&self, playbook: &Playbook) -> Vec<(String, StepType)> {
        playbook
            .steps
            .iter()
            .filter(|step| !self.supports(step.step_type))
            .map(|step| (step.id.clone(), step.step_type))
            .collect()
    }

    /// Registered step types, sorted by tag.
    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.executors.keys().copied().collect();
        types.sort_by_key(|t| t.tag());
        types
    }
}

impl fmt::Debug for StepExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutorRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

/// `utility.sleep`: waits `seconds` (default 1).
#[derive(Debug, Default)]
pub struct SleepExecutor;

#[async_trait]
impl StepExecutor for SleepExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        let seconds = invocation.f64_param("seconds").unwrap_or(1.0);
        let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
            StepError::InvalidParameter {
                name: "seconds".to_string(),
                message: format!("must be a non-negative duration in range, got {}", seconds),
            }
        })?;

        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_seconds": seconds }))
    }
}

/// `utility.log`: writes `message` to the log at `level` (default info).
#[derive(Debug, Default)]
pub struct LogExecutor;

#[async_trait]
impl StepExecutor for LogExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        let message = invocation.str_param("message")?;
        let level = invocation.str_param("level").unwrap_or("info");

        match level {
            "debug" => debug!("[{}] {}", invocation.step_id, message),
            "warn" | "warning" => warn!("[{}] {}", invocation.step_id, message),
            "error" => error!("[{}] {}", invocation.step_id, message),
            _ => info!("[{}] {}", invocation.step_id, message),
        }
        Ok(json!({ "message": message }))
    }
}

/// `utility.set_variable`: returns `{ name: value }` as the step output.
#[derive(Debug, Default)]
pub struct SetVariableExecutor;

#[async_trait]
impl StepExecutor for SetVariableExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> Result<Value, StepError> {
        let name = invocation.str_param("name")?;
        let value = invocation
            .parameters
            .get("value")
            .cloned()
            .unwrap_or(Value::Null);

        let mut output = serde_json::Map::new();
        output.insert(name.to_string(), value);
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::PlaybookStep;

    #[test]
    fn test_timeout_defaults_and_overrides() {
        let defaults = TimeoutConfig::default();
        assert_eq!(defaults.gateway_restart, Duration::from_secs(120));
        assert_eq!(defaults.module_install, Duration::from_secs(300));
        assert_eq!(defaults.browser_operation, Duration::from_millis(30_000));

        let overrides = HashMap::from([
            ("gateway_restart".to_string(), 30),
            ("browser_operation".to_string(), 500),
            ("unknown".to_string(), 1),
        ]);
        let config = TimeoutConfig::default().with_overrides(&overrides);
        assert_eq!(config.gateway_restart, Duration::from_secs(30));
        assert_eq!(config.browser_operation, Duration::from_millis(500));
        assert_eq!(config.module_install, Duration::from_secs(300));
    }

    #[test]
    fn test_registry_reports_missing_executors() {
        let registry = StepExecutorRegistry::with_builtins();
        let playbook = Playbook::new("mixed")
            .with_step(PlaybookStep::new("log", "Log", StepType::UtilityLog))
            .with_step(PlaybookStep::new("login", "Login", StepType::GatewayLogin));

        let missing = registry.missing_for(&playbook);
        assert_eq!(missing, vec![("login".to_string(), StepType::GatewayLogin)]);
    }

    #[test]
    fn test_registry_register_replaces() {
        let mut registry = StepExecutorRegistry::new();
        assert!(!registry.supports(StepType::GatewayPing));

        registry.register(
            StepType::GatewayPing,
            FnExecutor(|_: &StepInvocation| Ok(json!("pong"))),
        );
        assert!(registry.supports(StepType::GatewayPing));
        assert_eq!(registry.step_types(), vec![StepType::GatewayPing]);
    }

    #[tokio::test]
    async fn test_set_variable_executor() {
        let invocation = StepInvocation::new("e", "s", StepType::UtilitySetVariable)
            .with_parameter("name", "target")
            .with_parameter("value", 42);

        let output = SetVariableExecutor.execute(&invocation).await.unwrap();
        assert_eq!(output, json!({ "target": 42 }));
    }

    #[tokio::test]
    async fn test_log_executor_requires_message() {
        let invocation = StepInvocation::new("e", "s", StepType::UtilityLog);
        let result = LogExecutor.execute(&invocation).await;
        assert!(matches!(result, Err(StepError::InvalidParameter { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_executor_accepts_numeric_string() {
        let invocation =
            StepInvocation::new("e", "s", StepType::UtilitySleep).with_parameter("seconds", "2");

        let output = SleepExecutor.execute(&invocation).await.unwrap();
        assert_eq!(output["slept_seconds"], 2.0);
    }

    #[tokio::test]
    async fn test_sleep_executor_rejects_negative() {
        let invocation =
            StepInvocation::new("e", "s", StepType::UtilitySleep).with_parameter("seconds", -1);
        assert!(SleepExecutor.execute(&invocation).await.is_err());
    }

    #[tokio::test]
    async fn test_sleep_executor_rejects_out_of_range() {
        let invocation =
            StepInvocation::new("e", "s", StepType::UtilitySleep).with_parameter("seconds", 1e20);
        match SleepExecutor.execute(&invocation).await {
            Err(StepError::InvalidParameter { name, .. }) => assert_eq!(name, "seconds"),
            other => panic!("expected invalid parameter, got {:?}", other),
        }
    }
}
