//! Workflow definitions read from JSON or TOML files.
//!
//! ```toml
//! name = "report"
//!
//! [config]
//! breadth = 2
//!
//! [[tasks]]
//! name = "plan"
//! payload = { command = "echo '{\"topic\": \"rust\"}'" }
//!
//! [[tasks]]
//! name = "write"
//! depends_on = ["plan"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::clog_debug;
use crate::error::Result;

use super::{TaskSpec, WorkflowBuilder, WorkflowConfig};

/// Serializable input to [`WorkflowBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// When absent the caller's defaults apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<WorkflowConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowDefinition {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a definition, choosing the format by file extension.
    ///
    /// `.toml` files are parsed as TOML, everything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        clog_debug!(
            "Loading workflow definition from {} (toml={})",
            path.display(),
            is_toml
        );
        if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// A builder seeded with this definition; `defaults` applies when the
    /// definition carries no config of its own.
    pub fn into_builder(self, defaults: WorkflowConfig) -> WorkflowBuilder {
        let mut builder = WorkflowBuilder::new(&self.name)
            .description(&self.description)
            .config(self.config.unwrap_or(defaults));
        for spec in self.tasks {
            builder = builder.add_spec(spec);
        }
        builder
    }
}

impl WorkflowBuilder {
    pub fn from_definition(definition: WorkflowDefinition) -> Self {
        definition.into_builder(WorkflowConfig::default())
    }
}
