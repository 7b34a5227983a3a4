//! Task model — the unit of scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status / kind / mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    WaitingInput,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A dependency edge is satisfied when the predecessor completed, or
    /// terminated at all and the dependent's parent tolerates failures.
    pub fn satisfies_dependency(self, tolerate_failures: bool) -> bool {
        match self {
            Self::Completed => true,
            Self::Failed | Self::Cancelled => tolerate_failures,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Action,
    Analysis,
    Synthesis,
    Fetch,
    Transform,
    Validate,
    Notify,
}

impl TaskKind {
    /// LLM-typed kinds run through the conversation turn machinery rather
    /// than a registered tool handler.
    pub fn is_llm_typed(self) -> bool {
        matches!(self, Self::Research | Self::Analysis | Self::Synthesis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Sequential
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conditions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
}

/// Gate evaluated before a ready task starts.
///
/// `ParentOutputMatches` and `Always` are pure and evaluated in-process;
/// `LlmEvaluate` is resolved by the executor through its boolean-evaluator
/// seam (false on parse failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Always,
    ParentOutputMatches {
        path: String,
        op: MatchOp,
        value: Value,
    },
    LlmEvaluate {
        prompt: String,
    },
}

impl Default for Condition {
    fn default() -> Self {
        Self::Always
    }
}

impl Condition {
    /// Evaluate the pure variants against the parent's output.
    ///
    /// Returns `None` for `LlmEvaluate` (the caller must consult the LLM).
    /// A missing path or an absent parent output evaluates to false.
    pub fn evaluate_pure(&self, parent_output: Option<&Value>) -> Option<bool> {
        match self {
            Condition::Always => Some(true),
            Condition::LlmEvaluate { .. } => None,
            Condition::ParentOutputMatches { path, op, value } => {
                let Some(output) = parent_output else {
                    return Some(false);
                };
                let Some(actual) = json_path(output, path) else {
                    return Some(false);
                };
                Some(match op {
                    MatchOp::Eq => actual == value,
                    MatchOp::Ne => actual != value,
                    MatchOp::Contains => contains(actual, value),
                    MatchOp::Gt => compare_numeric(actual, value, |a, b| a > b),
                    MatchOp::Lt => compare_numeric(actual, value, |a, b| a < b),
                })
            }
        }
    }
}

/// Resolve a dot-separated path (`"result.items.0"`) into a JSON value.
pub fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut cursor = root;
    for segment in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|i| i == n),
        _ => false,
    }
}

fn compare_numeric(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Present iff the task was instantiated from a declared workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub principal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub kind: TaskKind,
    /// 0–100, higher runs first.
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub condition: Condition,
    /// Task ids that must be terminal before this becomes ready.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// When true, a failed or cancelled child does not fail this parent.
    #[serde(default)]
    pub tolerate_failures: bool,
    #[serde(default)]
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub waiting_for_input: bool,
    /// Present iff `waiting_for_input`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic insert/transition sequence for audit replay.
    #[serde(default)]
    pub seq: u64,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: spec.parent_id,
            workflow_id: spec.workflow_id,
            principal: spec.principal,
            conversation_id: spec.conversation_id,
            title: spec.title,
            description: spec.description,
            kind: spec.kind,
            priority: spec.priority.min(100),
            status: TaskStatus::Pending,
            execution_mode: spec.execution_mode,
            condition: spec.condition,
            dependencies: spec.dependencies,
            tolerate_failures: spec.tolerate_failures,
            input: spec.input,
            output: None,
            error: None,
            waiting_for_input: false,
            input_prompt: spec.input_prompt,
            retry_count: 0,
            max_retries: spec.max_retries,
            estimated_duration_ms: spec.estimated_duration_ms,
            actual_duration_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq: 0,
        }
    }

    /// Fire-and-forget tasks are not awaited by their parent.
    pub fn is_fire_and_forget(&self) -> bool {
        self.kind == TaskKind::Notify
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spec / patch / filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to create a task. Fields default to the least
/// surprising value so tool handlers can spawn with a few lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
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
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub tolerate_failures: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub principal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// When set, the executor parks the task as `waiting_input` with this
    /// prompt before the handler runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

fn default_priority() -> u8 {
    50
}

fn default_max_retries() -> u32 {
    3
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            kind,
            priority: default_priority(),
            execution_mode: ExecutionMode::default(),
            condition: Condition::default(),
            dependencies: Vec::new(),
            tolerate_failures: false,
            parent_id: None,
            workflow_id: None,
            principal: String::new(),
            conversation_id: None,
            input: Value::Null,
            max_retries: default_max_retries(),
            input_prompt: None,
            estimated_duration_ms: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(100);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

/// Patch applied by `update_task`; only permitted on non-terminal tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub input: Option<Value>,
    pub max_retries: Option<u32>,
    pub estimated_duration_ms: Option<u64>,
}

/// Query filter for `list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub parent_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub principal: Option<String>,
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(s) = self.status {
            if task.status != s {
                return false;
            }
        }
        if let Some(p) = self.parent_id {
            if task.parent_id != Some(p) {
                return false;
            }
        }
        if let Some(w) = self.workflow_id {
            if task.workflow_id != Some(w) {
                return false;
            }
        }
        if let Some(ref pr) = self.principal {
            if &task.principal != pr {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if task.priority > max {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at > before {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_is_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::WaitingInput.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_snake_case_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::WaitingInput).unwrap(),
            "\"waiting_input\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn dependency_satisfaction() {
        assert!(TaskStatus::Completed.satisfies_dependency(false));
        assert!(!TaskStatus::Failed.satisfies_dependency(false));
        assert!(TaskStatus::Failed.satisfies_dependency(true));
        assert!(TaskStatus::Cancelled.satisfies_dependency(true));
        assert!(!TaskStatus::Running.satisfies_dependency(true));
    }

    #[test]
    fn llm_typed_kinds() {
        assert!(TaskKind::Research.is_llm_typed());
        assert!(TaskKind::Analysis.is_llm_typed());
        assert!(TaskKind::Synthesis.is_llm_typed());
        assert!(!TaskKind::Fetch.is_llm_typed());
        assert!(!TaskKind::Notify.is_llm_typed());
    }

    #[test]
    fn json_path_traversal() {
        let v = json!({"result": {"items": [1, 2, 3], "ok": true}});
        assert_eq!(json_path(&v, "result.ok"), Some(&json!(true)));
        assert_eq!(json_path(&v, "result.items.1"), Some(&json!(2)));
        assert_eq!(json_path(&v, ""), Some(&v));
        assert!(json_path(&v, "result.missing").is_none());
        assert!(json_path(&v, "result.items.9").is_none());
    }

    #[test]
    fn condition_always_true() {
        assert_eq!(Condition::Always.evaluate_pure(None), Some(true));
    }

    #[test]
    fn condition_llm_defers() {
        let c = Condition::LlmEvaluate { prompt: "is it raining?".into() };
        assert_eq!(c.evaluate_pure(None), None);
    }

    #[test]
    fn condition_eq_and_ne() {
        let output = json!({"status": "ok", "count": 3});
        let eq = Condition::ParentOutputMatches {
            path: "status".into(),
            op: MatchOp::Eq,
            value: json!("ok"),
        };
        assert_eq!(eq.evaluate_pure(Some(&output)), Some(true));

        let ne = Condition::ParentOutputMatches {
            path: "count".into(),
            op: MatchOp::Ne,
            value: json!(4),
        };
        assert_eq!(ne.evaluate_pure(Some(&output)), Some(true));
    }

    #[test]
    fn condition_contains_string_and_array() {
        let output = json!({"summary": "all systems nominal", "tags": ["a", "b"]});
        let c = Condition::ParentOutputMatches {
            path: "summary".into(),
            op: MatchOp::Contains,
            value: json!("nominal"),
        };
        assert_eq!(c.evaluate_pure(Some(&output)), Some(true));

        let c = Condition::ParentOutputMatches {
            path: "tags".into(),
            op: MatchOp::Contains,
            value: json!("b"),
        };
        assert_eq!(c.evaluate_pure(Some(&output)), Some(true));
    }

    #[test]
    fn condition_numeric_comparison() {
        let output = json!({"score": 0.8});
        let gt = Condition::ParentOutputMatches {
            path: "score".into(),
            op: MatchOp::Gt,
            value: json!(0.5),
        };
        assert_eq!(gt.evaluate_pure(Some(&output)), Some(true));

        let lt = Condition::ParentOutputMatches {
            path: "score".into(),
            op: MatchOp::Lt,
            value: json!(0.5),
        };
        assert_eq!(lt.evaluate_pure(Some(&output)), Some(false));
    }

    #[test]
    fn condition_missing_path_is_false() {
        let output = json!({"a": 1});
        let c = Condition::ParentOutputMatches {
            path: "b".into(),
            op: MatchOp::Eq,
            value: json!(1),
        };
        assert_eq!(c.evaluate_pure(Some(&output)), Some(false));
        assert_eq!(c.evaluate_pure(None), Some(false));
    }

    #[test]
    fn spec_defaults() {
        let spec = TaskSpec::new("digest inbox", TaskKind::Research);
        assert_eq!(spec.priority, 50);
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.execution_mode, ExecutionMode::Sequential);
        assert_eq!(spec.condition, Condition::Always);
        assert!(!spec.tolerate_failures);
    }

    #[test]
    fn from_spec_clamps_priority() {
        let task = Task::from_spec(TaskSpec::new("t", TaskKind::Action).with_priority(200));
        assert_eq!(task.priority, 100);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn notify_is_fire_and_forget() {
        let task = Task::from_spec(TaskSpec::new("ping", TaskKind::Notify));
        assert!(task.is_fire_and_forget());
        let task = Task::from_spec(TaskSpec::new("work", TaskKind::Action));
        assert!(!task.is_fire_and_forget());
    }

    #[test]
    fn filter_by_status_and_priority_band() {
        let mut task = Task::from_spec(TaskSpec::new("t", TaskKind::Action).with_priority(70));
        task.status = TaskStatus::Pending;

        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            min_priority: Some(60),
            max_priority: Some(80),
            ..Default::default()
        };
        assert!(filter.matches(&task));

        let filter = TaskFilter {
            min_priority: Some(90),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }

    #[test]
    fn filter_by_principal() {
        let task = Task::from_spec(TaskSpec::new("t", TaskKind::Action).with_principal("alice"));
        let filter = TaskFilter {
            principal: Some("alice".into()),
            ..Default::default()
        };
        assert!(filter.matches(&task));
        let filter = TaskFilter {
            principal: Some("bob".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }

    #[test]
    fn task_serde_roundtrip() {
        let task = Task::from_spec(
            TaskSpec::new("roundtrip", TaskKind::Transform)
                .with_input(json!({"n": 1}))
                .with_condition(Condition::LlmEvaluate { prompt: "go?".into() }),
        );
        let encoded = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.condition, task.condition);
        assert_eq!(back.input, task.input);
    }
}
