//! Error Types
//!
//! A single error enum covers every failure the orchestrator can surface.
//! Variants are grouped by how callers are expected to react:
//!
//! - configuration errors are fatal and raised before any step runs
//! - step errors are gated by the step's on-failure policy
//! - resource exhaustion is reported, never a crash
//! - cancellation is tracked separately from failure

use thiserror::Error;

use crate::scheduling::resource::ResourceType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The main error type for the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A required playbook parameter was not supplied and has no default.
    #[error("Missing required parameter '{parameter}'")]
    MissingParameter { parameter: String },

    /// A supplied parameter value does not match its declared type or validator.
    #[error("Invalid value for parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// A credential parameter references a credential the vault does not hold.
    #[error("Credential '{credential}' referenced by parameter '{parameter}' was not found")]
    CredentialNotFound {
        parameter: String,
        credential: String,
    },

    /// No executor is registered for a step's type.
    #[error("Step '{step}' uses step type '{step_type}' which has no registered executor")]
    UnknownStepExecutor { step: String, step_type: String },

    /// Playbook file could not be read or parsed.
    #[error("Failed to load playbook '{path}': {message}")]
    PlaybookLoad { path: String, message: String },

    /// Playbook structure is invalid.
    #[error("Playbook validation failed: {0}")]
    PlaybookValidation(String),

    /// Invalid orchestrator configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A step failed under the ABORT policy.
    #[error("Step '{step_id}' ({step_name}) failed: {message}")]
    StepFailed {
        step_id: String,
        step_name: String,
        message: String,
    },

    /// A resource token could not be acquired in time.
    #[error("Resource '{0}' unavailable: acquisition timed out")]
    ResourceUnavailable(ResourceType),

    /// The unit of work was cancelled.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// The engine has already run its playbook.
    #[error("Engine for execution '{0}' has already been started")]
    AlreadyStarted(String),

    /// A unit of work terminated abnormally.
    #[error("Execution task aborted: {0}")]
    TaskAborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    /// Returns true for errors that are raised before execution and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::CredentialNotFound { .. }
                | Self::UnknownStepExecutor { .. }
                | Self::PlaybookLoad { .. }
                | Self::PlaybookValidation(_)
                | Self::Config(_)
        )
    }

    /// Returns true if this error represents cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
