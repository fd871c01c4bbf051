//! Execution Runner
//!
//! Bridges queued or batched requests, which only name a playbook path, to
//! a [`PlaybookEngine`]: loads the playbook, folds the gateway URL and
//! credential name into the parameters, and runs the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::control::StateManager;
use super::credentials::CredentialVault;
use super::engine::{PlaybookEngine, UpdateCallback};
use super::session::{DetachedSessionProvider, SessionProvider};
use super::step::{StepExecutorRegistry, TimeoutConfig};
use crate::error::Result;
use crate::playbook::{
    ExecutionState, ExecutionStore, ParameterType, Parameters, Playbook, PlaybookLoader,
};
use crate::scheduling::ResourceLimiter;

/// Parameter names the gateway URL is folded into, in order of preference.
const GATEWAY_URL_PARAMETERS: &[&str] = &["gateway_url", "url"];

/// A request to run one playbook.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub playbook_path: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub credential_name: Option<String>,
    /// Pre-assigned execution id, so callers can control the run by id
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl ExecutionRequest {
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

    /// Parameters with the gateway URL and credential name folded in.
    ///
    /// Explicit parameters win. The gateway URL fills the first declared
    /// `gateway_url`/`url` parameter; the credential name fills the first
    /// declared credential parameter.
    pub fn effective_parameters(&self, playbook: &Playbook) -> Parameters {
        let mut parameters = self.parameters.clone();

        if let Some(url) = self.gateway_url.as_deref().filter(|u| !u.is_empty()) {
            if let Some(name) = GATEWAY_URL_PARAMETERS
                .iter()
                .find(|name| playbook.get_parameter(name).is_some())
            {
                parameters
                    .entry(name.to_string())
                    .or_insert_with(|| Value::String(url.to_string()));
            }
        }

        if let Some(credential) = self.credential_name.as_deref().filter(|c| !c.is_empty()) {
            if let Some(param) = playbook
                .parameters
                .iter()
                .find(|p| p.param_type == ParameterType::Credential)
            {
                parameters
                    .entry(param.name.clone())
                    .or_insert_with(|| Value::String(credential.to_string()));
            }
        }

        parameters
    }
}

/// Runs execution requests to completion.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionState>;
}

/// Runs requests through a fresh [`PlaybookEngine`] each.
pub struct EngineRunner {
    loader: Arc<dyn PlaybookLoader>,
    registry: Arc<StepExecutorRegistry>,
    vault: Arc<dyn CredentialVault>,
    sessions: Arc<dyn SessionProvider>,
    timeouts: TimeoutConfig,
    limiter: Option<(Arc<ResourceLimiter>, Option<Duration>)>,
    store: Option<Arc<dyn ExecutionStore>>,
    state_manager: Option<Arc<StateManager>>,
    on_update: Option<UpdateCallback>,
}

impl EngineRunner {
    pub fn new(
        loader: Arc<dyn PlaybookLoader>,
        registry: Arc<StepExecutorRegistry>,
        vault: Arc<dyn CredentialVault>,
    ) -> Self {
        Self {
            loader,
            registry,
            vault,
            sessions: Arc::new(DetachedSessionProvider),
            timeouts: TimeoutConfig::default(),
            limiter: None,
            store: None,
            state_manager: None,
            on_update: None,
        }
    }

    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = provider;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Engines acquire their resource tokens from `limiter`.
    pub fn with_resource_limiter(
        mut self,
        limiter: Arc<ResourceLimiter>,
        timeout: Option<Duration>,
    ) -> Self {
        self.limiter = Some((limiter, timeout));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_state_manager(mut self, manager: Arc<StateManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    pub fn on_update(mut self, callback: UpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    /// Builds an engine for a request without running it.
    pub fn build_engine(&self, request: &ExecutionRequest) -> Result<(PlaybookEngine, Parameters)> {
        let playbook = self.loader.load(&request.playbook_path)?;
        let parameters = request.effective_parameters(&playbook);

        let mut engine = PlaybookEngine::new(playbook, Arc::clone(&self.registry), Arc::clone(&self.vault))
            .with_session_provider(Arc::clone(&self.sessions))
            .with_timeouts(self.timeouts.clone());
        if let Some(id) = &request.execution_id {
            engine = engine.with_execution_id(id.clone());
        }
        if let Some((limiter, timeout)) = &self.limiter {
            engine = engine.with_resource_limiter(Arc::clone(limiter), *timeout);
        }
        if let Some(store) = &self.store {
            engine = engine.with_store(Arc::clone(store));
        }
        if let Some(manager) = &self.state_manager {
            engine = engine.with_state_manager(Arc::clone(manager));
        }
        if let Some(callback) = &self.on_update {
            engine = engine.on_update(Arc::clone(callback));
        }
        if request.debug {
            let id = engine.execution_id().to_string();
            engine.enable_debug(&id);
        }

        debug!(
            "Built engine {} for '{}'",
            engine.execution_id(),
            request.playbook_path
        );
        Ok((engine, parameters))
    }
}

#[async_trait]
impl ExecutionRunner for EngineRunner {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionState> {
        let (engine, parameters) = self.build_engine(&request)?;
        info!(
            "Running '{}' as execution {}",
            request.playbook_path,
            engine.execution_id()
        );
        engine.execute_playbook(parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::credentials::{Credential, InMemoryVault};
    use crate::playbook::{ExecutionStatus, PlaybookParameter, PlaybookStep, StepType};
    use serde_json::json;

    struct StaticLoader(Playbook);

    impl PlaybookLoader for StaticLoader {
        fn load(&self, _: &str) -> Result<Playbook> {
            Ok(self.0.clone())
        }
    }

    fn gateway_playbook() -> Playbook {
        Playbook::new("gateway")
            .with_parameter(PlaybookParameter::new("gateway_url", ParameterType::String))
            .with_parameter(PlaybookParameter::new("admin", ParameterType::Credential))
            .with_step(
                PlaybookStep::new("log", "Log", StepType::UtilityLog)
                    .with_parameter("message", "{{ admin.username }}@{{ gateway_url }}"),
            )
    }

    #[test]
    fn test_effective_parameters_fold_in_request_fields() {
        let request = ExecutionRequest::new("gateway.yaml")
            .with_gateway_url("http://gw:8088")
            .with_credential("prod");

        let params = request.effective_parameters(&gateway_playbook());
        assert_eq!(params["gateway_url"], "http://gw:8088");
        assert_eq!(params["admin"], "prod");
    }

    #[test]
    fn test_explicit_parameters_win() {
        let request = ExecutionRequest::new("gateway.yaml")
            .with_parameter("gateway_url", "http://explicit:8088")
            .with_gateway_url("http://gw:8088");

        let params = request.effective_parameters(&gateway_playbook());
        assert_eq!(params["gateway_url"], json!("http://explicit:8088"));
    }

    #[test]
    fn test_undeclared_targets_are_not_invented() {
        let playbook = Playbook::new("plain").with_step(PlaybookStep::new("a", "A", StepType::UtilityLog));
        let request = ExecutionRequest::new("plain.yaml")
            .with_gateway_url("http://gw:8088")
            .with_credential("prod");

        assert!(request.effective_parameters(&playbook).is_empty());
    }

    #[tokio::test]
    async fn test_engine_runner_executes_request() {
        let vault = InMemoryVault::new();
        vault.insert(Credential::new("prod", "admin", "pw"));
        let runner = EngineRunner::new(
            Arc::new(StaticLoader(gateway_playbook())),
            Arc::new(StepExecutorRegistry::with_builtins()),
            Arc::new(vault),
        );

        let mut request = ExecutionRequest::new("gateway.yaml")
            .with_gateway_url("http://gw:8088")
            .with_credential("prod");
        request.execution_id = Some("exec-fixed".to_string());

        let state = runner.run(request).await.unwrap();
        assert_eq!(state.execution_id, "exec-fixed");
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_engine_runner_propagates_load_errors() {
        let runner = EngineRunner::new(
            Arc::new(crate::playbook::YamlPlaybookLoader::new()),
            Arc::new(StepExecutorRegistry::with_builtins()),
            Arc::new(InMemoryVault::new()),
        );

        let err = runner
            .run(ExecutionRequest::new("/nonexistent/playbook.yaml"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
