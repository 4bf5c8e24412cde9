use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::orchestration::RetryPolicy;
use crate::workflow::{ExecutionStrategy, ExpansionLimits, FailurePolicy, WorkflowConfig};
use crate::{clog_debug, Error, Result};

/// Default capacity of each workflow's progress channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// User configuration read from `~/.conductor/conductor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub store_dir: Option<String>,
    #[serde(default)]
    pub defaults: Defaults,
}

/// Seed values for every workflow built without an explicit config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub breadth: usize,
    pub depth: usize,
    pub timeout_seconds: u64,
    pub enable_retry: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: ExecutionStrategy,
    pub on_task_failure: FailurePolicy,
    pub workflow_timeout_seconds: Option<u64>,
    pub event_buffer: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        let workflow = WorkflowConfig::default();
        Self {
            breadth: workflow.breadth,
            depth: workflow.depth,
            timeout_seconds: workflow.timeout_seconds,
            enable_retry: workflow.enable_retry,
            max_retries: workflow.default_max_retries,
            base_delay_ms: workflow.retry.base_delay_ms,
            max_delay_ms: workflow.retry.max_delay_ms,
            strategy: workflow.strategy,
            on_task_failure: workflow.on_task_failure,
            workflow_timeout_seconds: workflow.workflow_timeout_seconds,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Directory holding one JSON file per stored workflow.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("workflows")),
        }
    }

    /// The workflow configuration implied by `[defaults]`.
    pub fn workflow_config(&self) -> WorkflowConfig {
        let d = &self.defaults;
        WorkflowConfig {
            breadth: d.breadth,
            depth: d.depth,
            timeout_seconds: d.timeout_seconds,
            enable_retry: d.enable_retry,
            default_max_retries: d.max_retries,
            retry: RetryPolicy {
                base_delay_ms: d.base_delay_ms,
                max_delay_ms: d.max_delay_ms,
            },
            strategy: d.strategy,
            on_task_failure: d.on_task_failure,
            workflow_timeout_seconds: d.workflow_timeout_seconds,
            expansion: ExpansionLimits::default(),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: breadth={}, depth={}, strategy={}, store_dir={:?}",
            config.defaults.breadth,
            config.defaults.depth,
            config.defaults.strategy,
            config.store_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                clog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
