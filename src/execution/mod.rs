//! Playbook Execution Module
//!
//! Runs playbooks step by step and exposes the control plane used to
//! steer running executions.
//!
//! # Architecture
//!
//! - [`engine`]: Single-playbook engine with retries, policies and control
//! - [`control`]: Control commands, per-execution handles and the state manager
//! - [`step`]: Step executor trait, registry and built-in utility executors
//! - [`credentials`]: Credential vault collaborator
//! - [`session`]: Browser/designer session collaborator
//! - [`runner`]: Request-to-engine bridge used by the queue and batches

pub mod control;
pub mod credentials;
pub mod engine;
pub mod runner;
pub mod session;
pub mod step;

pub use control::{ControlCommand, ControlFlags, ExecutionControl, StateManager};
pub use credentials::{Credential, CredentialVault, InMemoryVault};
pub use engine::{PlaybookEngine, UpdateCallback};
pub use runner::{EngineRunner, ExecutionRequest, ExecutionRunner};
pub use session::{DetachedSessionProvider, SessionHandle, SessionKind, SessionProvider};
pub use step::{
    FnExecutor, StepError, StepExecutor, StepExecutorRegistry, StepInvocation, TimeoutConfig,
};
