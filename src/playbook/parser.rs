//! Playbook Loading
//!
//! Reads playbook definitions from YAML (or JSON) files and validates their
//! structure before they reach an engine.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::model::Playbook;
use super::validator::validate_playbook;
use crate::error::{OrchestratorError, Result};

/// Resolves a playbook reference to a playbook.
///
/// The queue and the parallel manager only carry playbook paths; a loader
/// turns those into playbooks at execution time.
pub trait PlaybookLoader: Send + Sync {
    fn load(&self, reference: &str) -> Result<Playbook>;
}

/// Loads playbook files, resolving relative paths against a root directory.
#[derive(Debug, Clone, Default)]
pub struct YamlPlaybookLoader {
    root: Option<PathBuf>,
}

impl YamlPlaybookLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative references against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Path a reference resolves to.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        match &self.root {
            Some(root) if path.is_relative() && !path.exists() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl PlaybookLoader for YamlPlaybookLoader {
    fn load(&self, reference: &str) -> Result<Playbook> {
        load_playbook(self.resolve(reference))
    }
}

/// Loads and validates a playbook file.
///
/// Files ending in `.json` are parsed as JSON, everything else as YAML.
///
/// # Example
///
/// ```rust,no_run
/// use playrunner::playbook::load_playbook;
///
/// fn main() -> playrunner::Result<()> {
///     let playbook = load_playbook("playbooks/gateway_login.yaml")?;
///     println!("Loaded {} steps", playbook.len());
///     Ok(())
/// }
/// ```
pub fn load_playbook(path: impl AsRef<Path>) -> Result<Playbook> {
    let path = path.as_ref();
    info!("Loading playbook from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| OrchestratorError::PlaybookLoad {
        path: path.display().to_string(),
        message: format!("{}. Check that the file exists and is readable.", e),
    })?;
    debug!("Playbook content loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("json"));

    let playbook: Playbook = if is_json {
        serde_json::from_str(&content).map_err(|e| parse_error(path, e))?
    } else {
        serde_yaml::from_str(&content).map_err(|e| parse_error(path, e))?
    };

    validate_playbook(&playbook)?;
    info!(
        "Loaded playbook '{}' v{} ({} steps, {} parameters)",
        playbook.name,
        playbook.version,
        playbook.steps.len(),
        playbook.parameters.len()
    );
    Ok(playbook)
}

fn parse_error(path: &Path, error: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::PlaybookLoad {
        path: path.display().to_string(),
        message: format!("{}. Check the file format.", error),
    }
}
