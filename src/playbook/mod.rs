//! Playbook Definition Module
//!
//! Data structures, loading, validation and execution state for playbooks.
//!
//! # Structure
//!
//! - [`model`]: Playbooks, steps, parameters and the closed step-type tag
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural checks, parameter validation, credential
//!   resolution and placeholder substitution
//! - [`state`]: Execution state records and their persistence

pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use model::{
    Domain, OnFailure, ParameterType, ParameterValidator, Playbook, PlaybookParameter,
    PlaybookStep, StepType,
};
pub use parser::{load_playbook, PlaybookLoader, YamlPlaybookLoader};
pub use state::{
    ExecutionState, ExecutionStatus, ExecutionStore, JsonExecutionStore, StepResult, StepStatus,
};
pub use validator::{
    preprocess_credential_parameters, substitute_placeholders, validate_parameters,
    validate_playbook, Parameters,
};
