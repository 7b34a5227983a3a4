//! Workflow model — named templates for task trees.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::{Condition, ExecutionMode, TaskKind};

/// A named template. Instantiation (in the store crate) walks
/// `root_definition` and produces a concrete task tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub root_definition: TaskDefinition,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub seq: u64,
}

impl Workflow {
    pub fn new(name: impl Into<String>, root_definition: TaskDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            root_definition,
            created_at: chrono::Utc::now(),
            seq: 0,
        }
    }
}

/// One node of a workflow template. Children inherit the declared
/// `execution_mode`: sequential children are chained with dependency
/// edges at instantiation time, parallel children share none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub kind: TaskKind,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub tolerate_failures: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub input: Value,
    /// Present iff the task should park for human input before running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
    #[serde(default)]
    pub children: Vec<TaskDefinition>,
}

fn default_priority() -> u8 {
    50
}

impl TaskDefinition {
    pub fn new(title: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            kind,
            priority: default_priority(),
            execution_mode: ExecutionMode::Sequential,
            condition: Condition::Always,
            tolerate_failures: false,
            max_retries: 3,
            input: Value::Null,
            input_prompt: None,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TaskDefinition>) -> Self {
        self.children = children;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Total node count including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TaskDefinition::node_count).sum::<usize>()
    }
}
