//! Execution Monitoring Module
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step and pause timing for Gantt charts

pub mod timeline;

pub use timeline::{ExecutionTimeline, StepSpan, TimelineEvent, TimelineEventKind};
