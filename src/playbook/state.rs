//! Execution State
//!
//! In-memory record of one playbook execution plus the persistence
//! collaborator used to store snapshots of it.
//!
//! `JsonExecutionStore` saves each execution to
//! `{data_dir}/executions/{execution_id}.json` after every mutation, so the
//! latest state survives a crash and past runs can be listed.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::Playbook;
use crate::error::{OrchestratorError, Result};

/// Lifecycle status of a playbook execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Started,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one step.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Number of executor attempts made
    #[serde(default)]
    pub attempts: u32,
}

impl StepResult {
    /// Creates a pending result for a step.
    pub fn pending(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            attempts: 0,
        }
    }
}

/// State of one playbook execution.
///
/// Created when an execution starts and mutated only by the engine that
/// owns it. Once the status is terminal the state no longer changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionState {
    pub execution_id: String,
    pub playbook_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_steps: usize,
    /// One result per step, in playbook order
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub debug_mode: bool,
    /// Human-readable summary of what went wrong, if anything
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionState {
    /// Creates a pending state with every step pre-populated as PENDING.
    pub fn new(execution_id: impl Into<String>, playbook: &Playbook) -> Self {
        Self {
            execution_id: execution_id.into(),
            playbook_name: playbook.name.clone(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_steps: playbook.steps.len(),
            step_results: playbook
                .steps
                .iter()
                .map(|s| StepResult::pending(&s.id, &s.name))
                .collect(),
            domain: playbook.domain_tag(),
            debug_mode: false,
            error: None,
        }
    }

    /// Replaces the result with the same step id, or appends it if absent.
    pub fn upsert_step_result(&mut self, result: StepResult) {
        match self
            .step_results
            .iter_mut()
            .find(|r| r.step_id == result.step_id)
        {
            Some(existing) => *existing = result,
            None => self.step_results.push(result),
        }
    }

    /// Gets a step result by step id.
    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Gets a mutable step result by step id.
    pub fn step_result_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.step_results.iter_mut().find(|r| r.step_id == step_id)
    }

    /// Number of steps with the given status.
    pub fn count(&self, status: StepStatus) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    /// Ids of failed steps, in order.
    pub fn failed_steps(&self) -> Vec<String> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Moves the execution to a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Returns true if the execution has finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Durable storage for execution snapshots.
///
/// Not required for in-memory orchestration; used for audit and history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Stores the latest snapshot of an execution.
    async fn save(&self, state: &ExecutionState) -> Result<()>;

    /// Loads an execution by id.
    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>>;

    /// Lists stored executions, newest first.
    async fn list(&self) -> Result<Vec<ExecutionState>>;
}

/// Stores executions as pretty-printed JSON files.
#[derive(Debug, Clone)]
pub struct JsonExecutionStore {
    dir: PathBuf,
}

impl JsonExecutionStore {
    /// Creates a store rooted at `{data_dir}/executions`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("executions"),
        }
    }

    /// Returns the directory holding execution files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }
}

#[async_trait]
impl ExecutionStore for JsonExecutionStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.file_for(&state.execution_id);
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&path, json).await?;

        debug!("Saved execution state to {}", path.display());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        let path = self.file_for(execution_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let state: ExecutionState = serde_json::from_str(&content)?;
                info!("Loaded execution state from {}", path.display());
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::Io(e)),
        };

        let mut states = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<ExecutionState>(&content) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Ignoring unreadable execution file {}: {}", path.display(), e),
            }
        }

        states.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::model::{PlaybookStep, StepType};
    use tempfile::tempdir;

    fn sample_playbook() -> Playbook {
        Playbook::new("sample")
            .with_metadata("domain", "utility")
            .with_step(PlaybookStep::new("one", "One", StepType::UtilityLog))
            .with_step(PlaybookStep::new("two", "Two", StepType::UtilitySleep))
    }

    #[test]
    fn test_state_prepopulates_pending_results() {
        let state = ExecutionState::new("exec-1", &sample_playbook());
        assert_eq!(state.status, ExecutionStatus::Pending);
        assert_eq!(state.total_steps, 2);
        assert_eq!(state.count(StepStatus::Pending), 2);
        assert_eq!(state.domain.as_deref(), Some("utility"));
    }

    #[test]
    fn test_upsert_replaces_existing_result() {
        let mut state = ExecutionState::new("exec-1", &sample_playbook());
        let mut result = StepResult::pending("one", "One");
        result.status = StepStatus::Completed;
        state.upsert_step_result(result);

        assert_eq!(state.step_results.len(), 2);
        assert_eq!(state.step_result("one").unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn test_upsert_appends_unknown_step() {
        let mut state = ExecutionState::new("exec-1", &sample_playbook());
        state.upsert_step_result(StepResult::pending("three", "Three"));
        assert_eq!(state.step_results.len(), 3);
    }

    #[test]
    fn test_finish_sets_terminal_status() {
        let mut state = ExecutionState::new("exec-1", &sample_playbook());
        assert!(!state.is_finished());
        state.finish(ExecutionStatus::Cancelled);
        assert!(state.is_finished());
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn test_failed_steps_lists_in_order() {
        let mut state = ExecutionState::new("exec-1", &sample_playbook());
        state.step_result_mut("two").unwrap().status = StepStatus::Failed;
        state.step_result_mut("one").unwrap().status = StepStatus::Failed;
        assert_eq!(state.failed_steps(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_json_store_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let store = JsonExecutionStore::new(temp_dir.path());
        let state = ExecutionState::new("exec-42", &sample_playbook());

        store.save(&state).await.unwrap();
        assert!(store.dir().join("exec-42.json").exists());

        let loaded = store.load("exec-42").await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, "exec-42");
        assert_eq!(loaded.step_results.len(), 2);
    }

    #[tokio::test]
    async fn test_json_store_load_missing_returns_none() {
        let temp_dir = tempdir().unwrap();
        let store = JsonExecutionStore::new(temp_dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_list_skips_garbage() {
        let temp_dir = tempdir().unwrap();
        let store = JsonExecutionStore::new(temp_dir.path());
        store
            .save(&ExecutionState::new("a", &sample_playbook()))
            .await
            .unwrap();
        store
            .save(&ExecutionState::new("b", &sample_playbook()))
            .await
            .unwrap();
        fs::write(store.dir().join("junk.json"), "not json").unwrap();
        fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let states = store.list().await.unwrap();
        assert_eq!(states.len(), 2);
    }

    #[tokio::test]
    async fn test_json_store_list_without_directory() {
        let temp_dir = tempdir().unwrap();
        let store = JsonExecutionStore::new(temp_dir.path().join("missing"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
