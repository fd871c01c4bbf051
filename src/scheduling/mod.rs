//! Execution Scheduling Module
//!
//! Admission control for concurrent playbook executions.
//!
//! # Components
//!
//! - [`resource`]: Counting token pools per resource type
//! - [`queue`]: Priority queue with a concurrency ceiling and a dispatch worker
//! - [`parallel`]: Batch runner with slot and resource gating and fail-fast

pub mod parallel;
pub mod queue;
pub mod resource;

pub use parallel::{
    ExecutionConfig, ParallelExecution, ParallelExecutionManager, ParallelState, ParallelStatus,
};
pub use queue::{ExecutionQueue, Priority, QueueState, QueueStatus, QueuedExecution};
pub use resource::{ResourceGuard, ResourceLimiter, ResourceStatus, ResourceType};
