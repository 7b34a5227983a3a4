//! Workflow registry and instantiation.
//!
//! Workflows are named templates; `instantiate` walks the declared tree and
//! produces concrete pending tasks in the task store. Sequential children
//! are chained with dependency edges so they run in declaration order;
//! parallel children share none.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use uuid::Uuid;

use butler_domain::error::{Error, Result};
use butler_domain::task::{ExecutionMode, TaskSpec};
use butler_domain::workflow::{TaskDefinition, Workflow};

use crate::persist;
use crate::tasks::TaskStore;

pub struct WorkflowStore {
    inner: RwLock<HashMap<Uuid, Workflow>>,
    seq: std::sync::atomic::AtomicU64,
    persist_path: Option<PathBuf>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
            persist_path: None,
        }
    }

    pub fn with_persistence(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("workflows.json");
        let store = Self::new();
        if let Some(workflows) = persist::load_json::<Vec<Workflow>>(&path) {
            let count = workflows.len();
            let max_seq = workflows.iter().map(|w| w.seq).max().unwrap_or(0);
            let mut map = store.inner.write();
            for w in workflows {
                map.insert(w.id, w);
            }
            drop(map);
            store.seq.store(max_seq + 1, std::sync::atomic::Ordering::SeqCst);
            tracing::info!(count, "loaded workflows from disk");
        }
        Self { persist_path: Some(path), ..store }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let workflows: Vec<Workflow> = self.inner.read().values().cloned().collect();
        persist::save_json(path, &workflows)
    }

    pub fn register(&self, mut workflow: Workflow) -> Uuid {
        workflow.seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = workflow.id;
        self.inner.write().insert(id, workflow);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Workflow> {
        self.inner.read().get(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Workflow> {
        self.inner.read().values().find(|w| w.name == name).cloned()
    }

    pub fn list(&self) -> Vec<Workflow> {
        let mut out: Vec<Workflow> = self.inner.read().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Instantiate a workflow into a concrete task tree owned by
    /// `principal`. Returns the root task id.
    pub fn instantiate(
        &self,
        workflow_id: &Uuid,
        tasks: &TaskStore,
        principal: &str,
    ) -> Result<Uuid> {
        let workflow = self
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(format!("workflow {workflow_id}")))?;

        let root_spec = spec_from_definition(&workflow.root_definition, *workflow_id, principal);
        let root_id = tasks.create_task(root_spec)?;
        instantiate_children(&workflow.root_definition, root_id, *workflow_id, tasks, principal)?;
        tracing::info!(
            workflow = %workflow.name,
            root_task = %root_id,
            nodes = workflow.root_definition.node_count(),
            "workflow instantiated"
        );
        Ok(root_id)
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spec_from_definition(def: &TaskDefinition, workflow_id: Uuid, principal: &str) -> TaskSpec {
    let mut spec = TaskSpec::new(def.title.clone(), def.kind);
    spec.description = def.description.clone();
    spec.priority = def.priority;
    spec.execution_mode = def.execution_mode;
    spec.condition = def.condition.clone();
    spec.tolerate_failures = def.tolerate_failures;
    spec.max_retries = def.max_retries;
    spec.input = def.input.clone();
    spec.input_prompt = def.input_prompt.clone();
    spec.workflow_id = Some(workflow_id);
    spec.principal = principal.to_string();
    spec
}

fn instantiate_children(
    def: &TaskDefinition,
    parent_id: Uuid,
    workflow_id: Uuid,
    tasks: &TaskStore,
    principal: &str,
) -> Result<()> {
    if def.children.is_empty() {
        return Ok(());
    }
    let specs: Vec<TaskSpec> = def
        .children
        .iter()
        .map(|child| spec_from_definition(child, workflow_id, principal))
        .collect();
    let ids = tasks.spawn_subtasks(parent_id, specs, def.execution_mode)?;
    for (child_def, child_id) in def.children.iter().zip(ids) {
        instantiate_children(child_def, child_id, workflow_id, tasks, principal)?;
    }
    Ok(())
}
