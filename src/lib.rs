//! PlayRunner - Playbook Execution Orchestrator
//!
//! Runs multi-step playbooks against SCADA gateways and their browser-based
//! consoles under bounded concurrency and shared resource limits. Running
//! executions can be paused, resumed, stepped through or cancelled.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`playbook`]: Playbook definitions, loading, validation and execution state
//! - [`execution`]: Step-by-step playbook engine and its control plane
//! - [`scheduling`]: Resource limiter, priority queue and parallel batches
//! - [`monitoring`]: Execution timeline
//! - [`config`] and [`context`]: Settings and the shared service graph
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use playrunner::execution::{InMemoryVault, PlaybookEngine, StepExecutorRegistry};
//! use playrunner::load_playbook;
//!
//! #[tokio::main]
//! async fn main() -> playrunner::Result<()> {
//!     // Load a playbook from YAML
//!     let playbook = load_playbook("playbooks/gateway_health.yaml")?;
//!
//!     // Create the engine with the built-in utility executors
//!     let engine = PlaybookEngine::new(
//!         playbook,
//!         Arc::new(StepExecutorRegistry::with_builtins()),
//!         Arc::new(InMemoryVault::new()),
//!     );
//!
//!     // Execute the playbook
//!     let state = engine.execute_playbook(Default::default()).await?;
//!     println!("{:?}", state.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod playbook;
pub mod scheduling;

// Re-export commonly used types
pub use config::OrchestratorConfig;
pub use context::{AppContext, Collaborators};
pub use error::{OrchestratorError, Result};
pub use execution::engine::PlaybookEngine;
pub use playbook::model::{Playbook, PlaybookStep, StepType};
pub use playbook::parser::load_playbook;
pub use scheduling::{ExecutionQueue, ParallelExecutionManager, Priority, ResourceLimiter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PlayRunner";
