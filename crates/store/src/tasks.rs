//! Task store — the durable task graph and its lifecycle invariants.
//!
//! The store is the only authority over task state: [`TaskStore::transition`]
//! is the sole path that mutates `status`, it is atomic under the store's
//! write lock, and it emits a [`TaskEvent`] to broadcast subscribers. The
//! dependency graph is kept acyclic at all times; terminal tasks are
//! immutable except for derived metrics.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use butler_domain::error::{Error, Result, TaskError};
use butler_domain::task::{ExecutionMode, Task, TaskFilter, TaskPatch, TaskSpec, TaskStatus};

use crate::persist;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        task_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
        seq: u64,
    },
    Transitioned {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        seq: u64,
    },
    Prioritized {
        task_id: Uuid,
        priority: u8,
    },
    InputProvided {
        task_id: Uuid,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transition fields
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optional payloads applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Set on success (`to = completed`).
    pub output: Option<Value>,
    /// Set on failure (`to = failed` or `cancelled`).
    pub error: Option<TaskError>,
    /// Set when parking for input (`to = waiting_input`).
    pub input_prompt: Option<String>,
    /// Bump `retry_count` (retry re-queues: `running -> pending`).
    pub increment_retry: bool,
}

impl TransitionFields {
    pub fn output(output: Value) -> Self {
        Self { output: Some(output), ..Default::default() }
    }

    pub fn error(error: TaskError) -> Self {
        Self { error: Some(error), ..Default::default() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskStore {
    inner: RwLock<HashMap<Uuid, Task>>,
    seq: AtomicU64,
    event_tx: broadcast::Sender<TaskEvent>,
    persist_path: Option<PathBuf>,
}

impl TaskStore {
    /// In-memory store (tests, ephemeral deployments).
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            event_tx,
            persist_path: None,
        }
    }

    /// Store backed by a JSON snapshot at `<state_dir>/tasks.json`.
    pub fn with_persistence(state_dir: &std::path::Path) -> Self {
        let path = state_dir.join("tasks.json");
        let store = Self::new();
        if let Some(tasks) = persist::load_json::<Vec<Task>>(&path) {
            let max_seq = tasks.iter().map(|t| t.seq).max().unwrap_or(0);
            let count = tasks.len();
            let mut map = store.inner.write();
            for t in tasks {
                map.insert(t.id, t);
            }
            drop(map);
            store.seq.store(max_seq + 1, Ordering::SeqCst);
            tracing::info!(count, "loaded tasks from disk");
        }
        Self { persist_path: Some(path), ..store }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Write the current snapshot to disk. No-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let tasks: Vec<Task> = self.inner.read().values().cloned().collect();
        persist::save_json(path, &tasks)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.event_tx.send(event);
    }

    // ── Creation ──────────────────────────────────────────────────

    /// Insert a task from a spec. Rejects a missing parent, missing
    /// dependencies, and self-dependency (a fresh id cannot otherwise
    /// create a cycle).
    pub fn create_task(&self, spec: TaskSpec) -> Result<Uuid> {
        let mut task = Task::from_spec(spec);
        {
            let mut map = self.inner.write();
            if let Some(parent_id) = task.parent_id {
                if !map.contains_key(&parent_id) {
                    return Err(Error::Validation(format!("parent task {parent_id} not found")));
                }
            }
            for dep in &task.dependencies {
                if !map.contains_key(dep) {
                    return Err(Error::Validation(format!("dependency {dep} not found")));
                }
            }
            task.seq = self.next_seq();
            map.insert(task.id, task.clone());
        }
        tracing::debug!(task_id = %task.id, title = %task.title, "task created");
        self.emit(TaskEvent::Created {
            task_id: task.id,
            parent_id: task.parent_id,
            seq: task.seq,
        });
        Ok(task.id)
    }

    /// Atomically insert several subtasks under a parent. With
    /// `ExecutionMode::Sequential`, each spec gains a dependency on its
    /// predecessor so the children run in declaration order.
    pub fn spawn_subtasks(
        &self,
        parent_id: Uuid,
        specs: Vec<TaskSpec>,
        mode: ExecutionMode,
    ) -> Result<Vec<Uuid>> {
        let mut created: Vec<Task> = Vec::with_capacity(specs.len());
        {
            let mut map = self.inner.write();
            let parent = map
                .get(&parent_id)
                .ok_or_else(|| Error::NotFound(format!("parent task {parent_id}")))?;
            if parent.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "cannot spawn under terminal parent {parent_id}"
                )));
            }
            let principal = parent.principal.clone();
            let conversation_id = parent.conversation_id;
            let workflow_id = parent.workflow_id;

            let mut prev: Option<Uuid> = None;
            for mut spec in specs {
                spec.parent_id = Some(parent_id);
                if spec.principal.is_empty() {
                    spec.principal = principal.clone();
                }
                if spec.conversation_id.is_none() {
                    spec.conversation_id = conversation_id;
                }
                if spec.workflow_id.is_none() {
                    spec.workflow_id = workflow_id;
                }
                if mode == ExecutionMode::Sequential {
                    if let Some(prev_id) = prev {
                        spec.dependencies.push(prev_id);
                    }
                }
                let mut task = Task::from_spec(spec);
                task.seq = self.next_seq();
                prev = Some(task.id);
                map.insert(task.id, task.clone());
                created.push(task);
            }
        }
        for task in &created {
            self.emit(TaskEvent::Created {
                task_id: task.id,
                parent_id: task.parent_id,
                seq: task.seq,
            });
        }
        Ok(created.into_iter().map(|t| t.id).collect())
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        self.inner.read().get(id).cloned()
    }

    pub fn get_task(&self, id: &Uuid) -> Result<Task> {
        self.get(id).ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Filtered read-only query, ordered by insert sequence.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let map = self.inner.read();
        let mut out: Vec<Task> = map.values().filter(|t| filter.matches(t)).cloned().collect();
        out.sort_by_key(|t| t.seq);
        out
    }

    pub fn children(&self, parent_id: &Uuid) -> Vec<Task> {
        let map = self.inner.read();
        let mut out: Vec<Task> = map
            .values()
            .filter(|t| t.parent_id == Some(*parent_id))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.seq);
        out
    }

    /// All transitive children of `id` (not including `id`), for cascade
    /// cancellation.
    pub fn descendants(&self, id: &Uuid) -> Vec<Uuid> {
        let map = self.inner.read();
        let mut out = Vec::new();
        let mut frontier = vec![*id];
        while let Some(current) = frontier.pop() {
            for t in map.values() {
                if t.parent_id == Some(current) {
                    out.push(t.id);
                    frontier.push(t.id);
                }
            }
        }
        out
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.inner.read().values().filter(|t| t.status == status).count()
    }

    // ── Mutation ──────────────────────────────────────────────────

    /// Patch a non-terminal task. Status is never patched here.
    pub fn update_task(&self, id: &Uuid, patch: TaskPatch) -> Result<Task> {
        let mut map = self.inner.write();
        let task = map.get_mut(id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if task.status.is_terminal() {
            return Err(Error::Validation(format!("task {id} is terminal")));
        }
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority.min(100);
        }
        if let Some(input) = patch.input {
            task.input = input;
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(est) = patch.estimated_duration_ms {
            task.estimated_duration_ms = Some(est);
        }
        Ok(task.clone())
    }

    /// The only path that mutates `status`. Atomic; emits a task event.
    ///
    /// Rejects: unknown task, `from` mismatch, transitions out of a
    /// terminal status, lifecycle edges outside the allowed set, and
    /// completing a parent that still has non-terminal awaited children.
    pub fn transition(
        &self,
        id: &Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task> {
        let (task, seq) = {
            let mut map = self.inner.write();

            // Parent completion guard needs a read of the children while
            // the write lock is held, so collect first.
            if to == TaskStatus::Completed {
                let blocking: Vec<Uuid> = map
                    .values()
                    .filter(|t| {
                        t.parent_id == Some(*id)
                            && !t.status.is_terminal()
                            && !t.is_fire_and_forget()
                    })
                    .map(|t| t.id)
                    .collect();
                if !blocking.is_empty() {
                    return Err(Error::Validation(format!(
                        "task {id} has {} non-terminal children",
                        blocking.len()
                    )));
                }
            }

            let task = map.get_mut(id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if task.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "task {id} is terminal ({:?})",
                    task.status
                )));
            }
            if task.status != from {
                return Err(Error::Validation(format!(
                    "task {id} is {:?}, expected {:?}",
                    task.status, from
                )));
            }
            if !allowed_edge(from, to) {
                return Err(Error::Validation(format!(
                    "illegal transition {from:?} -> {to:?}"
                )));
            }

            let now = Utc::now();
            task.status = to;
            match to {
                TaskStatus::Running => {
                    if task.started_at.is_none() {
                        task.started_at = Some(now);
                    }
                    task.waiting_for_input = false;
                }
                TaskStatus::WaitingInput => {
                    task.waiting_for_input = true;
                    task.input_prompt = fields.input_prompt.clone();
                }
                TaskStatus::Pending => {
                    task.waiting_for_input = false;
                    task.input_prompt = None;
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    task.completed_at = Some(now);
                    task.waiting_for_input = false;
                    if let Some(started) = task.started_at {
                        task.actual_duration_ms =
                            Some((now - started).num_milliseconds().max(0) as u64);
                    }
                }
            }
            if let Some(output) = fields.output {
                task.output = Some(output);
            }
            if let Some(error) = fields.error {
                task.error = Some(error);
            }
            if fields.increment_retry {
                task.retry_count += 1;
            }
            let seq = self.next_seq();
            task.seq = seq;
            (task.clone(), seq)
        };

        tracing::debug!(task_id = %id, ?from, ?to, "task transitioned");
        self.emit(TaskEvent::Transitioned { task_id: *id, from, to, seq });
        Ok(task)
    }

    /// Add a dependency edge `a -> b` (b depends on a). Rejects unknown
    /// tasks, self-edges, and edges that would create a cycle.
    pub fn add_dependency(&self, a: &Uuid, b: &Uuid) -> Result<()> {
        if a == b {
            return Err(Error::Validation("self-dependency".into()));
        }
        let mut map = self.inner.write();
        if !map.contains_key(a) {
            return Err(Error::NotFound(format!("task {a}")));
        }
        if !map.contains_key(b) {
            return Err(Error::NotFound(format!("task {b}")));
        }
        // Cycle check: would `a` (transitively) depend on `b`?
        if reaches(&map, a, b) {
            return Err(Error::Validation(format!("dependency {a} -> {b} creates a cycle")));
        }
        let task = map.get_mut(b).expect("checked above");
        if !task.dependencies.contains(a) {
            task.dependencies.push(*a);
        }
        Ok(())
    }

    /// Bump a task's priority strictly above every currently-pending
    /// task's. Repeated calls keep stacking, so the most recent
    /// `prioritize` wins; ties (saturation) fall back to `created_at`.
    pub fn prioritize(&self, id: &Uuid) -> Result<u8> {
        let priority = {
            let mut map = self.inner.write();
            let max_pending = map
                .values()
                .filter(|t| t.status == TaskStatus::Pending && t.id != *id)
                .map(|t| t.priority)
                .max()
                .unwrap_or(0);
            let task = map.get_mut(id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if task.status.is_terminal() {
                return Err(Error::Validation(format!("task {id} is terminal")));
            }
            task.priority = task.priority.max(max_pending.saturating_add(1));
            task.priority
        };
        self.emit(TaskEvent::Prioritized { task_id: *id, priority });
        Ok(priority)
    }

    /// Deliver human input to a `waiting_input` task and re-queue it.
    pub fn provide_input(&self, id: &Uuid, payload: Value) -> Result<()> {
        {
            let mut map = self.inner.write();
            let task = map.get_mut(id).ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if task.status != TaskStatus::WaitingInput {
                return Err(Error::Validation(format!(
                    "task {id} is not waiting for input ({:?})",
                    task.status
                )));
            }
            match &mut task.input {
                Value::Object(map) => {
                    map.insert("input".into(), payload);
                }
                other => {
                    *other = serde_json::json!({ "input": payload });
                }
            }
        }
        self.transition(id, TaskStatus::WaitingInput, TaskStatus::Pending, TransitionFields::default())?;
        self.emit(TaskEvent::InputProvided { task_id: *id });
        Ok(())
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle edges permitted by the model. `running -> pending` is the
/// retry re-queue.
fn allowed_edge(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, WaitingInput)
            | (Running, Pending)
            | (WaitingInput, Pending)
            | (WaitingInput, Cancelled)
    )
}

/// Does `from` transitively depend on `target`?
fn reaches(map: &HashMap<Uuid, Task>, from: &Uuid, target: &Uuid) -> bool {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut frontier = vec![*from];
    while let Some(current) = frontier.pop() {
        if &current == target {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(task) = map.get(&current) {
            frontier.extend(task.dependencies.iter().copied());
        }
    }
    false
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
