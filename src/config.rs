//! Orchestrator Configuration
//!
//! Settings for the scheduling services, read from an optional YAML file and
//! then overridden from `PLAYRUNNER_*` environment variables.
//!
//! # Example
//!
//! ```yaml
//! max_concurrent: 2
//! max_parallel: 4
//! resource_limits:
//!   browser: 1
//!   gateway: 8
//! resource_timeout_secs: 60
//! timeouts:
//!   gateway_restart: 180
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::execution::TimeoutConfig;
use crate::scheduling::{ResourceLimiter, ResourceType};

const ENV_MAX_CONCURRENT: &str = "PLAYRUNNER_MAX_CONCURRENT";
const ENV_MAX_PARALLEL: &str = "PLAYRUNNER_MAX_PARALLEL";
const ENV_DATA_DIR: &str = "PLAYRUNNER_DATA_DIR";

/// Token counts per resource type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    pub browser: usize,
    pub gateway: usize,
    pub memory: usize,
    pub cpu: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            browser: 3,
            gateway: 10,
            memory: 5,
            cpu: num_cpus::get(),
        }
    }
}

impl ResourceLimits {
    pub fn get(&self, resource: ResourceType) -> usize {
        match resource {
            ResourceType::Browser => self.browser,
            ResourceType::Gateway => self.gateway,
            ResourceType::Memory => self.memory,
            ResourceType::Cpu => self.cpu,
        }
    }
}

/// Settings for the queue, the batch manager and the engines they run.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Queue concurrency ceiling
    pub max_concurrent: usize,
    /// Batch concurrency ceiling
    pub max_parallel: usize,
    pub resource_limits: ResourceLimits,
    /// Resource acquisition bound; `None` waits indefinitely
    pub resource_timeout_secs: Option<u64>,
    /// Named timeout overrides (`gateway_restart`, `module_install`, `browser_operation`)
    pub timeouts: HashMap<String, u64>,
    /// Where execution records are persisted
    pub data_dir: PathBuf,
    /// Root for relative playbook paths
    pub playbook_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_parallel: 5,
            resource_limits: ResourceLimits::default(),
            resource_timeout_secs: None,
            timeouts: HashMap::new(),
            data_dir: PathBuf::from(".playrunner"),
            playbook_dir: PathBuf::from("playbooks"),
        }
    }
}

impl OrchestratorConfig {
    /// Reads a YAML config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            OrchestratorError::Config(format!(
                "Invalid config file '{}': {}. Check the file format.",
                path.display(),
                e
            ))
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `PLAYRUNNER_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| env::var(name).ok())
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent = parse_count(ENV_MAX_CONCURRENT, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_PARALLEL) {
            self.max_parallel = parse_count(ENV_MAX_PARALLEL, &value)?;
        }
        if let Some(value) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(value);
        }
        Ok(())
    }

    /// Rejects settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(OrchestratorError::Config(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Limiter with one pool per resource type.
    pub fn build_limiter(&self) -> ResourceLimiter {
        ResourceLimiter::new(
            ResourceType::ALL
                .iter()
                .map(|&resource| (resource, self.resource_limits.get(resource))),
        )
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::default().with_overrides(&self.timeouts)
    }

    pub fn resource_timeout(&self) -> Option<Duration> {
        self.resource_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        OrchestratorError::Config(format!("{} must be a positive integer, got '{}'", name, value))
    })
}
