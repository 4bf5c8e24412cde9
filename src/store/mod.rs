//! Workflow persistence.
//!
//! The orchestration core never owns a global registry; whoever needs
//! workflows across calls injects a [`WorkflowStore`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use crate::workflow::{Workflow, WorkflowId};
use crate::{clog_debug, clog_warn, Error, Result};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a new workflow. Fails if the id is already stored.
    async fn create(&self, workflow: &Workflow) -> Result<()>;

    async fn get(&self, id: WorkflowId) -> Result<Workflow>;

    /// Replace a stored workflow.
    async fn update(&self, workflow: &Workflow) -> Result<()>;

    async fn delete(&self, id: WorkflowId) -> Result<()>;

    /// Every stored workflow, oldest first.
    async fn list(&self) -> Result<Vec<Workflow>>;
}

fn by_creation(workflows: &mut [Workflow]) {
    workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(Error::Validation(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: WorkflowId) -> Result<Workflow> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::WorkflowNotFound(id))
    }

    async fn update(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        match workflows.get_mut(&workflow.id) {
            Some(slot) => {
                *slot = workflow.clone();
                Ok(())
            }
            None => Err(Error::WorkflowNotFound(workflow.id)),
        }
    }

    async fn delete(&self, id: WorkflowId) -> Result<()> {
        self.workflows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::WorkflowNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Workflow>> {
        let mut all: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        by_creation(&mut all);
        Ok(all)
    }
}

/// One pretty-printed JSON file per workflow, named `<id>.json`.
///
/// Writes go through a temp file and a rename so a crash never leaves a
/// half-written workflow behind.
#[derive(Debug, Clone)]
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, workflow: &Workflow) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(workflow.id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, workflow.to_json()?).await?;
        fs::rename(&temp_path, &path).await?;
        clog_debug!("Workflow saved: {}", path.display());
        Ok(())
    }

    async fn exists(&self, id: WorkflowId) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(id)).await?)
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn create(&self, workflow: &Workflow) -> Result<()> {
        if self.exists(workflow.id).await? {
            return Err(Error::Validation(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        self.write(workflow).await
    }

    async fn get(&self, id: WorkflowId) -> Result<Workflow> {
        match fs::read_to_string(self.path_for(id)).await {
            Ok(contents) => Workflow::from_json(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::WorkflowNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, workflow: &Workflow) -> Result<()> {
        if !self.exists(workflow.id).await? {
            return Err(Error::WorkflowNotFound(workflow.id));
        }
        self.write(workflow).await
    }

    async fn delete(&self, id: WorkflowId) -> Result<()> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::WorkflowNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Workflow>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let loaded = match fs::read_to_string(&path).await {
                Ok(contents) => Workflow::from_json(&contents),
                Err(e) => Err(e.into()),
            };
            match loaded {
                Ok(workflow) => all.push(workflow),
                Err(e) => clog_warn!("Skipping unreadable workflow {}: {}", path.display(), e),
            }
        }
        by_creation(&mut all);
        Ok(all)
    }
}
