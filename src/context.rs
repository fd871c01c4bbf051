//! Application Context
//!
//! Builds the shared services once from an [`OrchestratorConfig`] and hands
//! them out by `Arc`. Tests and embedders construct their own context
//! instead of reaching for process-wide instances.

use std::sync::Arc;

use log::info;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::execution::{
    CredentialVault, DetachedSessionProvider, EngineRunner, ExecutionRunner, PlaybookEngine,
    SessionProvider, StateManager, StepExecutorRegistry,
};
use crate::playbook::{
    ExecutionStore, JsonExecutionStore, Playbook, PlaybookLoader, YamlPlaybookLoader,
};
use crate::scheduling::{
    ExecutionConfig, ExecutionQueue, ParallelExecution, ParallelExecutionManager, ResourceLimiter,
};

/// External systems the services are wired to.
pub struct Collaborators {
    pub registry: Arc<StepExecutorRegistry>,
    pub vault: Arc<dyn CredentialVault>,
    pub sessions: Arc<dyn SessionProvider>,
    /// Defaults to a [`YamlPlaybookLoader`] rooted at the configured playbook dir
    pub loader: Option<Arc<dyn PlaybookLoader>>,
    /// Defaults to a [`JsonExecutionStore`] under the configured data dir
    pub store: Option<Arc<dyn ExecutionStore>>,
}

impl Collaborators {
    /// Built-in utility executors, no browser sessions.
    pub fn new(vault: Arc<dyn CredentialVault>) -> Self {
        Self {
            registry: Arc::new(StepExecutorRegistry::with_builtins()),
            vault,
            sessions: Arc::new(DetachedSessionProvider),
            loader: None,
            store: None,
        }
    }

    pub fn with_registry(mut self, registry: StepExecutorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = provider;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn PlaybookLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// The orchestrator's service graph.
pub struct AppContext {
    pub config: OrchestratorConfig,
    pub limiter: Arc<ResourceLimiter>,
    pub state_manager: Arc<StateManager>,
    pub store: Arc<dyn ExecutionStore>,
    pub queue: Arc<ExecutionQueue>,
    pub parallel: Arc<ParallelExecutionManager>,
    registry: Arc<StepExecutorRegistry>,
    vault: Arc<dyn CredentialVault>,
    sessions: Arc<dyn SessionProvider>,
    batch_runner: Arc<EngineRunner>,
}

impl AppContext {
    /// Validates the config and builds every service.
    ///
    /// Queued executions acquire their own resource tokens. Batch members
    /// are gated by the parallel manager, so their runner has no limiter.
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(config.build_limiter());
        let state_manager = Arc::new(StateManager::new());
        let store: Arc<dyn ExecutionStore> = match collaborators.store {
            Some(store) => store,
            None => Arc::new(JsonExecutionStore::new(&config.data_dir)),
        };
        let loader: Arc<dyn PlaybookLoader> = match collaborators.loader {
            Some(loader) => loader,
            None => Arc::new(YamlPlaybookLoader::with_root(&config.playbook_dir)),
        };

        let runner = |limited: bool| {
            let runner = EngineRunner::new(
                Arc::clone(&loader),
                Arc::clone(&collaborators.registry),
                Arc::clone(&collaborators.vault),
            )
            .with_session_provider(Arc::clone(&collaborators.sessions))
            .with_timeouts(config.timeout_config())
            .with_store(Arc::clone(&store))
            .with_state_manager(Arc::clone(&state_manager));
            if limited {
                runner.with_resource_limiter(Arc::clone(&limiter), config.resource_timeout())
            } else {
                runner
            }
        };

        let queue_runner: Arc<dyn ExecutionRunner> = Arc::new(runner(true));
        let batch_runner = Arc::new(runner(false));
        let queue = Arc::new(ExecutionQueue::new(queue_runner, config.max_concurrent));
        let parallel = Arc::new(
            ParallelExecutionManager::new(config.max_parallel, Arc::clone(&limiter))
                .with_resource_timeout(config.resource_timeout()),
        );

        info!(
            "Orchestrator ready (queue: {} concurrent, batches: {} parallel)",
            config.max_concurrent, config.max_parallel
        );

        Ok(Self {
            config,
            limiter,
            state_manager,
            store,
            queue,
            parallel,
            registry: collaborators.registry,
            vault: collaborators.vault,
            sessions: collaborators.sessions,
            batch_runner,
        })
    }

    /// Starts the queue worker.
    pub fn start(&self) {
        self.queue.start();
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Engine for a directly supplied playbook, wired to the shared services.
    pub fn engine(&self, playbook: Playbook) -> PlaybookEngine {
        PlaybookEngine::new(playbook, Arc::clone(&self.registry), Arc::clone(&self.vault))
            .with_session_provider(Arc::clone(&self.sessions))
            .with_timeouts(self.config.timeout_config())
            .with_resource_limiter(Arc::clone(&self.limiter), self.config.resource_timeout())
            .with_store(Arc::clone(&self.store))
            .with_state_manager(Arc::clone(&self.state_manager))
    }

    /// Runs a batch through the parallel manager.
    pub async fn run_batch(
        &self,
        configs: Vec<ExecutionConfig>,
        fail_fast: bool,
    ) -> Result<Vec<ParallelExecution>> {
        let runner = Arc::clone(&self.batch_runner);
        self.parallel
            .run_parallel(
                configs,
                move |config| {
                    let runner = Arc::clone(&runner);
                    async move { runner.run(config.into()).await }
                },
                fail_fast,
            )
            .await
    }
}
