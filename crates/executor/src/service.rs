//! Executor service — ready-queue scheduling over a bounded worker pool.
//!
//! Observable states: `stopped`, `running`, `paused`, `draining`. A ready
//! task is a pending task whose dependencies are terminal-ok (or tolerated)
//! and whose condition evaluates true; ready tasks start in (priority desc,
//! created_at asc, id asc) order, up to `W` concurrent workers.
//!
//! Slot accounting follows the suspension rules: the slot is held across
//! LLM streaming and tool calls (inside the handler), and released while a
//! parent awaits children or a task waits for human input.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

use butler_domain::config::ExecutorConfig;
use butler_domain::error::{Error, ErrorKind, Result, TaskError};
use butler_domain::task::{Condition, ExecutionMode, Task, TaskFilter, TaskSpec, TaskStatus};
use butler_store::{TaskStore, TransitionFields};

use crate::backoff::backoff_delay;
use crate::cancel::{CancelMap, CancelToken};
use crate::handler::{BoolEvaluator, HandlerCtx, HandlerOutcome, SpawnSink, TaskHandler};
use crate::ready::{cmp_ready, dep_state, DepState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Stopped,
    Running,
    Paused,
    Draining,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Executor {
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
    evaluator: Arc<dyn BoolEvaluator>,
    config: ExecutorConfig,
    state: watch::Sender<ExecutorState>,
    slots: Arc<Semaphore>,
    cancels: CancelMap,
    wake: Arc<Notify>,
    /// Tasks currently claimed by a worker (running or parked on children).
    in_flight: Mutex<HashSet<Uuid>>,
    /// Earliest re-claim instant for tasks in retry backoff.
    retry_after: Mutex<HashMap<Uuid, tokio::time::Instant>>,
    /// Ready-queue depth measured by the last scheduling pass.
    ready_depth: AtomicUsize,
}

impl Executor {
    pub fn new(
        store: Arc<TaskStore>,
        handler: Arc<dyn TaskHandler>,
        evaluator: Arc<dyn BoolEvaluator>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let config = config.clamped();
        let (state, _) = watch::channel(ExecutorState::Stopped);
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.workers)),
            store,
            handler,
            evaluator,
            config,
            state,
            cancels: CancelMap::new(),
            wake: Arc::new(Notify::new()),
            in_flight: Mutex::new(HashSet::new()),
            retry_after: Mutex::new(HashMap::new()),
            ready_depth: AtomicUsize::new(0),
        })
    }

    // ── Control surface ───────────────────────────────────────────

    pub fn status(&self) -> ExecutorState {
        *self.state.borrow()
    }

    /// Start the scheduling loop. Errors if not currently stopped.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.status() != ExecutorState::Stopped {
            return Err(Error::Validation(format!(
                "executor is {:?}, expected stopped",
                self.status()
            )));
        }
        let _ = self.state.send(ExecutorState::Running);
        let exec = Arc::clone(self);
        tokio::spawn(async move { exec.run_loop().await });
        Ok(())
    }

    /// Stop scheduling immediately. Running workers finish cooperatively.
    pub fn stop(&self) {
        let _ = self.state.send(ExecutorState::Stopped);
        self.wake.notify_one();
    }

    pub fn pause(&self) {
        if self.status() == ExecutorState::Running {
            let _ = self.state.send(ExecutorState::Paused);
            self.wake.notify_one();
        }
    }

    pub fn resume(&self) {
        if self.status() == ExecutorState::Paused {
            let _ = self.state.send(ExecutorState::Running);
            self.wake.notify_one();
        }
    }

    /// Claim no new tasks; transition to `stopped` once in-flight work ends.
    pub fn drain(&self) {
        let current = self.status();
        if current == ExecutorState::Running || current == ExecutorState::Paused {
            let _ = self.state.send(ExecutorState::Draining);
            self.wake.notify_one();
        }
    }

    /// Cooperatively cancel a task and cascade to its descendants.
    /// Idempotent: interrupting a terminal task is a no-op.
    pub fn interrupt(&self, id: &Uuid) -> Result<()> {
        let task = self.store.get_task(id)?;
        self.cancel_one(&task);
        for descendant in self.store.descendants(id) {
            if let Some(t) = self.store.get(&descendant) {
                self.cancel_one(&t);
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    fn cancel_one(&self, task: &Task) {
        let err = TaskError {
            kind: ErrorKind::Cancellation,
            message: "interrupted".into(),
        };
        let result = match task.status {
            TaskStatus::Pending => self.store.transition(
                &task.id,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                TransitionFields::error(err),
            ),
            TaskStatus::WaitingInput => self.store.transition(
                &task.id,
                TaskStatus::WaitingInput,
                TaskStatus::Cancelled,
                TransitionFields::error(err),
            ),
            TaskStatus::Running => {
                let r = self.store.transition(
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::Cancelled,
                    TransitionFields::error(err),
                );
                // Deliver the signal so the worker unwinds at its next
                // suspension point; its eventual report is advisory.
                self.cancels.cancel(&task.id);
                r
            }
            // Terminal: idempotent no-op.
            _ => return,
        };
        if let Err(e) = result {
            tracing::debug!(task_id = %task.id, error = %e, "interrupt raced a transition");
        } else {
            tracing::info!(task_id = %task.id, "task interrupted");
        }
    }

    /// Bump a task above everything pending and wake the scheduler.
    pub fn prioritize(&self, id: &Uuid) -> Result<u8> {
        let priority = self.store.prioritize(id)?;
        self.wake.notify_one();
        Ok(priority)
    }

    /// Deliver human input to a `waiting_input` task and re-queue it.
    pub fn provide_input(&self, id: &Uuid, payload: Value) -> Result<()> {
        self.store.provide_input(id, payload)?;
        self.wake.notify_one();
        Ok(())
    }

    /// True when the ready queue exceeds `W * K`; tool-initiated spawns
    /// are refused while this holds.
    pub fn is_backpressured(&self) -> bool {
        let depth = self
            .ready_depth
            .load(Ordering::Relaxed)
            .max(self.store.count_with_status(TaskStatus::Pending));
        depth > self.config.backpressure_limit()
    }

    // ── Scheduling loop ───────────────────────────────────────────

    async fn run_loop(self: Arc<Self>) {
        let mut events = self.store.subscribe();
        let mut state_rx = self.state.subscribe();
        tracing::info!(workers = self.config.workers, "executor started");

        loop {
            let current_state = *state_rx.borrow();
            match current_state {
                ExecutorState::Stopped => break,
                ExecutorState::Paused => {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                ExecutorState::Draining => {
                    if self.in_flight.lock().is_empty() {
                        let _ = self.state.send(ExecutorState::Stopped);
                        break;
                    }
                }
                ExecutorState::Running => {
                    self.schedule_pass().await;
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                result = events.recv() => {
                    if matches!(result, Err(broadcast::error::RecvError::Closed)) {
                        break;
                    }
                }
                _ = state_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.config.tick_ms)) => {}
            }
        }
        tracing::info!("executor stopped");
    }

    async fn schedule_pass(self: &Arc<Self>) {
        let ready = self.collect_ready().await;
        self.ready_depth.store(ready.len(), Ordering::Relaxed);

        for task in ready {
            if self.status() != ExecutorState::Running {
                break;
            }
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                // Full parallelism: remaining ready tasks stay pending in
                // priority order.
                break;
            };
            self.in_flight.lock().insert(task.id);
            self.retry_after.lock().remove(&task.id);
            match self.store.transition(
                &task.id,
                TaskStatus::Pending,
                TaskStatus::Running,
                TransitionFields::default(),
            ) {
                Ok(claimed) => {
                    let exec = Arc::clone(self);
                    let span = tracing::info_span!("task", task_id = %claimed.id, kind = ?claimed.kind);
                    tokio::spawn(exec.run_worker(claimed, permit).instrument(span));
                }
                Err(e) => {
                    tracing::debug!(task_id = %task.id, error = %e, "claim raced a transition");
                    self.in_flight.lock().remove(&task.id);
                    drop(permit);
                }
            }
        }
    }

    /// Collect ready tasks in scheduling order. Tasks whose dependencies
    /// failed without tolerance, or whose condition is conclusively false,
    /// are cancelled here (skipped branches).
    async fn collect_ready(&self) -> Vec<Task> {
        let pending = self.store.list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        });
        let now = tokio::time::Instant::now();
        let mut ready = Vec::new();

        for task in pending {
            if self.in_flight.lock().contains(&task.id) {
                continue;
            }
            if self
                .retry_after
                .lock()
                .get(&task.id)
                .is_some_and(|at| *at > now)
            {
                continue;
            }

            let dep_statuses: Vec<TaskStatus> = task
                .dependencies
                .iter()
                .filter_map(|d| self.store.get(d))
                .map(|t| t.status)
                .collect();
            match dep_state(&dep_statuses, task.tolerate_failures) {
                DepState::Waiting => continue,
                DepState::Blocked => {
                    self.skip_task(&task, "dependency failed");
                    continue;
                }
                DepState::Satisfied => {}
            }

            match self.condition_holds(&task).await {
                ConditionOutcome::True => ready.push(task),
                ConditionOutcome::NotYet => {}
                ConditionOutcome::False => {
                    self.skip_task(&task, "condition evaluated false");
                }
            }
        }

        ready.sort_by(cmp_ready);
        ready
    }

    fn skip_task(&self, task: &Task, reason: &str) {
        let err = TaskError {
            kind: ErrorKind::Cancellation,
            message: reason.into(),
        };
        if let Err(e) = self.store.transition(
            &task.id,
            TaskStatus::Pending,
            TaskStatus::Cancelled,
            TransitionFields::error(err),
        ) {
            tracing::debug!(task_id = %task.id, error = %e, "skip raced a transition");
        } else {
            tracing::debug!(task_id = %task.id, reason, "task skipped");
        }
    }

    /// Evaluate a task's condition. `ParentOutputMatches` reads the output
    /// of the task's final dependency when it has one (the previous step
    /// of a chain), otherwise its parent's output; evaluation waits until
    /// that source can no longer change.
    async fn condition_holds(&self, task: &Task) -> ConditionOutcome {
        match &task.condition {
            Condition::Always => ConditionOutcome::True,
            Condition::LlmEvaluate { prompt } => {
                if self.evaluator.evaluate(prompt).await {
                    ConditionOutcome::True
                } else {
                    ConditionOutcome::False
                }
            }
            Condition::ParentOutputMatches { .. } => {
                let source = if let Some(dep_id) = task.dependencies.last() {
                    match self.store.get(dep_id) {
                        Some(dep) if dep.status.is_terminal() => dep.output,
                        Some(_) => return ConditionOutcome::NotYet,
                        None => None,
                    }
                } else if let Some(parent_id) = task.parent_id {
                    match self.store.get(&parent_id) {
                        Some(parent) if parent.output.is_some() || parent.status.is_terminal() => {
                            parent.output
                        }
                        Some(_) => return ConditionOutcome::NotYet,
                        None => None,
                    }
                } else {
                    None
                };
                match task.condition.evaluate_pure(source.as_ref()) {
                    Some(true) => ConditionOutcome::True,
                    _ => ConditionOutcome::False,
                }
            }
        }
    }

    // ── Worker ────────────────────────────────────────────────────

    async fn run_worker(self: Arc<Self>, task: Task, permit: OwnedSemaphorePermit) {
        let task_id = task.id;
        let parent_id = task.parent_id;
        let cancel = self.cancels.register(task_id);
        if let Some(pid) = parent_id {
            if self.cancels.is_active(&pid) {
                self.cancels.add_to_group(pid, task_id);
            }
        }

        if let Err(e) = self.execute(task, cancel, permit).await {
            tracing::warn!(%task_id, error = %e, "worker error");
        }

        if let Some(pid) = parent_id {
            self.cancels.remove_from_group(&pid, &task_id);
        }
        self.cancels.remove(&task_id);
        self.in_flight.lock().remove(&task_id);
        self.wake.notify_one();
    }

    async fn execute(
        self: &Arc<Self>,
        task: Task,
        cancel: CancelToken,
        permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        // Human-in-the-loop gate: park before the handler runs when input
        // is required but not yet provided. The slot is released.
        if let Some(prompt) = task.input_prompt.clone() {
            if task.input.get("input").is_none() {
                drop(permit);
                self.store.transition(
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::WaitingInput,
                    TransitionFields {
                        input_prompt: Some(prompt),
                        ..Default::default()
                    },
                )?;
                return Ok(());
            }
        }

        let ctx = HandlerCtx {
            cancel: cancel.clone(),
            principal: task.principal.clone(),
            spawner: Arc::clone(self) as Arc<dyn SpawnSink>,
        };

        let outcome = match self.config.task_timeout_ms {
            Some(ms) => {
                tokio::select! {
                    out = self.handler.run(task.clone(), ctx) => out,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        // Deadline timers are modeled as cancellations.
                        tracing::warn!(task_id = %task.id, timeout_ms = ms, "task deadline exceeded");
                        drop(permit);
                        let _ = self.interrupt(&task.id);
                        return Ok(());
                    }
                }
            }
            None => self.handler.run(task.clone(), ctx).await,
        };

        // If the task was interrupted while the handler ran, its status is
        // already terminal; the worker's report is advisory.
        if cancel.is_cancelled() {
            if let Some(current) = self.store.get(&task.id) {
                if current.status.is_terminal() {
                    tracing::debug!(task_id = %task.id, "advisory report after cancellation");
                    return Ok(());
                }
            }
        }

        match outcome {
            Ok(HandlerOutcome::AwaitInput { prompt }) => {
                drop(permit);
                self.store.transition(
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::WaitingInput,
                    TransitionFields {
                        input_prompt: Some(prompt),
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
            Ok(HandlerOutcome::Complete(output)) => {
                drop(permit);
                self.settle_with_children(&task, Some(output)).await
            }
            Ok(HandlerOutcome::AwaitChildren) => {
                drop(permit);
                self.settle_with_children(&task, None).await
            }
            Err(err) => {
                drop(permit);
                self.handle_failure(&task, err)
            }
        }
    }

    /// Await any live (non fire-and-forget) children with the slot
    /// released, then settle the parent: all-ok aggregates outputs, a
    /// failed child fails the parent unless it tolerates failures.
    async fn settle_with_children(&self, task: &Task, own_output: Option<Value>) -> Result<()> {
        let mut events = self.store.subscribe();
        loop {
            // The interrupt path may have terminated us meanwhile.
            let Some(current) = self.store.get(&task.id) else {
                return Ok(());
            };
            if current.status != TaskStatus::Running {
                return Ok(());
            }

            let children: Vec<Task> = self
                .store
                .children(&task.id)
                .into_iter()
                .filter(|c| !c.is_fire_and_forget())
                .collect();

            if children.iter().all(|c| c.status.is_terminal()) {
                let failed = children
                    .iter()
                    .filter(|c| matches!(c.status, TaskStatus::Failed | TaskStatus::Cancelled))
                    .count();
                let result = if failed > 0 && !task.tolerate_failures {
                    self.store.transition(
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                        TransitionFields::error(TaskError {
                            kind: ErrorKind::Permanent,
                            message: format!("{failed} child task(s) failed"),
                        }),
                    )
                } else {
                    self.store.transition(
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Completed,
                        TransitionFields::output(aggregate_output(own_output, &children)),
                    )
                };
                if let Err(e) = result {
                    tracing::debug!(task_id = %task.id, error = %e, "settle raced a transition");
                }
                return Ok(());
            }

            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(Duration::from_millis(self.config.tick_ms)) => {}
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, task: &Task, err: Error) -> Result<()> {
        if err.is_cancellation() {
            let fields = TransitionFields::error(TaskError::from_error(&err));
            if let Err(e) = self.store.transition(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Cancelled,
                fields,
            ) {
                tracing::debug!(task_id = %task.id, error = %e, "cancel report raced");
            }
            return Ok(());
        }

        let retriable = err.is_retriable() || matches!(err, Error::Backpressure(_));
        if retriable && task.retry_count < task.max_retries {
            let attempt = task.retry_count + 1;
            let delay = backoff_delay(self.config.backoff_base_ms, attempt);
            tracing::info!(
                task_id = %task.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying task"
            );
            // Order matters: arm the backoff before re-queueing so the
            // scheduler cannot claim the task early.
            self.retry_after
                .lock()
                .insert(task.id, tokio::time::Instant::now() + delay);
            self.store.transition(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Pending,
                TransitionFields {
                    increment_retry: true,
                    ..Default::default()
                },
            )?;
            let exec = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                exec.wake.notify_one();
            });
            return Ok(());
        }

        let final_err = if retriable { err.into_permanent() } else { err };
        tracing::warn!(task_id = %task.id, error = %final_err, "task failed");
        self.store.transition(
            &task.id,
            TaskStatus::Running,
            TaskStatus::Failed,
            TransitionFields::error(TaskError::from_error(&final_err)),
        )?;
        Ok(())
    }
}

/// Tool-initiated spawns go through the executor so backpressure applies.
impl SpawnSink for Executor {
    fn spawn(
        &self,
        parent_id: Uuid,
        specs: Vec<TaskSpec>,
        mode: ExecutionMode,
    ) -> Result<Vec<Uuid>> {
        if self.is_backpressured() {
            return Err(Error::Backpressure(format!(
                "ready queue exceeds {} tasks",
                self.config.backpressure_limit()
            )));
        }
        let ids = self.store.spawn_subtasks(parent_id, specs, mode)?;
        self.wake.notify_one();
        Ok(ids)
    }
}

enum ConditionOutcome {
    True,
    False,
    /// The condition's source output can still change; check again later.
    NotYet,
}

/// Parent output aggregation: own output plus each completed child's
/// output, in child insertion order.
fn aggregate_output(own_output: Option<Value>, children: &[Task]) -> Value {
    if children.is_empty() {
        return own_output.unwrap_or(Value::Null);
    }
    let child_outputs: Vec<Value> = children
        .iter()
        .filter(|c| c.status == TaskStatus::Completed)
        .map(|c| {
            json!({
                "task_id": c.id,
                "title": c.title,
                "output": c.output,
            })
        })
        .collect();
    json!({
        "output": own_output,
        "children": child_outputs,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use butler_domain::task::{MatchOp, TaskKind};
    use std::sync::atomic::AtomicU32;

    /// Test handler driven by the task's input payload:
    /// - `{"sleep_ms": n}` sleeps before completing
    /// - `{"fail": "transient"}` fails transiently on every attempt
    /// - `{"fail_until": n}` fails transiently until attempt n
    /// - `{"fail": "permanent"}` fails permanently
    /// - `{"spawn": [...specs], "spawn_mode": "parallel"}` spawns children
    ///   and awaits them
    /// Started task titles are recorded in order.
    struct ScriptedHandler {
        started: Mutex<Vec<String>>,
        attempts: Mutex<HashMap<Uuid, u32>>,
    }

    impl ScriptedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Mutex::new(Vec::new()),
                attempts: Mutex::new(HashMap::new()),
            })
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn run(&self, task: Task, ctx: HandlerCtx) -> Result<HandlerOutcome> {
            self.started.lock().push(task.title.clone());
            let attempt = {
                let mut attempts = self.attempts.lock();
                let counter = attempts.entry(task.id).or_insert(0);
                *counter += 1;
                *counter
            };

            if let Some(ms) = task.input.get("sleep_ms").and_then(Value::as_u64) {
                let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
                while tokio::time::Instant::now() < deadline {
                    if ctx.cancel.is_cancelled() {
                        return Err(Error::Cancelled("handler observed cancellation".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }

            if let Some(until) = task.input.get("fail_until").and_then(Value::as_u64) {
                if u64::from(attempt) < until {
                    return Err(Error::Transient(format!("attempt {attempt} failed")));
                }
            }
            match task.input.get("fail").and_then(Value::as_str) {
                Some("transient") => return Err(Error::Transient("flaky".into())),
                Some("permanent") => return Err(Error::Permanent("broken".into())),
                _ => {}
            }

            if let Some(children) = task.input.get("spawn").and_then(Value::as_array) {
                let specs: Vec<TaskSpec> = children
                    .iter()
                    .map(|c| serde_json::from_value(c.clone()).unwrap())
                    .collect();
                ctx.spawner.spawn(task.id, specs, ExecutionMode::Parallel)?;
                return Ok(HandlerOutcome::AwaitChildren);
            }

            Ok(HandlerOutcome::Complete(json!({"echo": task.title})))
        }
    }

    struct FixedEvaluator(bool);

    #[async_trait::async_trait]
    impl BoolEvaluator for FixedEvaluator {
        async fn evaluate(&self, _prompt: &str) -> bool {
            self.0
        }
    }

    fn test_config(workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            tick_ms: 10,
            backoff_base_ms: 10,
            ..Default::default()
        }
    }

    fn setup(workers: usize) -> (Arc<TaskStore>, Arc<ScriptedHandler>, Arc<Executor>) {
        let store = Arc::new(TaskStore::new());
        let handler = ScriptedHandler::new();
        let exec = Executor::new(
            Arc::clone(&store),
            handler.clone(),
            Arc::new(FixedEvaluator(true)),
            test_config(workers),
        );
        (store, handler, exec)
    }

    async fn wait_status(store: &TaskStore, id: &Uuid, status: TaskStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if store.get(id).map(|t| t.status) == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {status:?}; task = {:?}",
                store.get(id)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spec(title: &str) -> TaskSpec {
        TaskSpec::new(title, TaskKind::Action).with_principal("tester")
    }

    #[tokio::test]
    async fn runs_a_task_to_completion() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();
        let id = store.create_task(spec("solo")).unwrap();
        wait_status(&store, &id, TaskStatus::Completed).await;
        let task = store.get(&id).unwrap();
        assert_eq!(task.output, Some(json!({"echo": "solo"})));
        assert!(task.actual_duration_ms.is_some());
        exec.stop();
    }

    #[tokio::test]
    async fn sequential_chain_runs_in_order() {
        let (store, handler, exec) = setup(4);
        exec.start().unwrap();

        let a = store.create_task(spec("a")).unwrap();
        let b = store.create_task(spec("b").with_dependencies(vec![a])).unwrap();
        let c = store.create_task(spec("c").with_dependencies(vec![b])).unwrap();

        wait_status(&store, &c, TaskStatus::Completed).await;
        assert_eq!(handler.started(), vec!["a", "b", "c"]);
        // Happens-before: a terminal before b started.
        let a_task = store.get(&a).unwrap();
        let b_task = store.get(&b).unwrap();
        assert!(a_task.completed_at.unwrap() <= b_task.started_at.unwrap());
        exec.stop();
    }

    #[tokio::test]
    async fn failed_dependency_cancels_dependents() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let a = store
            .create_task(spec("a").with_input(json!({"fail": "permanent"})))
            .unwrap();
        let b = store.create_task(spec("b").with_dependencies(vec![a])).unwrap();

        wait_status(&store, &a, TaskStatus::Failed).await;
        wait_status(&store, &b, TaskStatus::Cancelled).await;
        let b_task = store.get(&b).unwrap();
        assert_eq!(b_task.error.unwrap().kind, ErrorKind::Cancellation);
        exec.stop();
    }

    #[tokio::test]
    async fn tolerated_failed_dependency_still_runs() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let a = store
            .create_task(spec("a").with_input(json!({"fail": "permanent"})))
            .unwrap();
        let mut b_spec = spec("b").with_dependencies(vec![a]);
        b_spec.tolerate_failures = true;
        let b = store.create_task(b_spec).unwrap();

        wait_status(&store, &b, TaskStatus::Completed).await;
        exec.stop();
    }

    #[tokio::test]
    async fn prioritize_reorders_pending_tasks() {
        let (store, handler, exec) = setup(2);

        // Two slot-occupying tasks plus three queued at equal priority.
        let blocker1 = store
            .create_task(spec("blocker1").with_input(json!({"sleep_ms": 150})).with_priority(90))
            .unwrap();
        let blocker2 = store
            .create_task(spec("blocker2").with_input(json!({"sleep_ms": 150})).with_priority(90))
            .unwrap();
        let t1 = store.create_task(spec("t1").with_priority(10)).unwrap();
        let t2 = store.create_task(spec("t2").with_priority(10)).unwrap();
        let t3 = store.create_task(spec("t3").with_priority(10)).unwrap();

        exec.start().unwrap();
        // Wait until both blockers hold the two slots.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(&blocker1).unwrap().status != TaskStatus::Running
            || store.get(&blocker2).unwrap().status != TaskStatus::Running
        {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        exec.prioritize(&t3).unwrap();

        wait_status(&store, &t1, TaskStatus::Completed).await;
        wait_status(&store, &t2, TaskStatus::Completed).await;
        wait_status(&store, &t3, TaskStatus::Completed).await;

        let started = handler.started();
        let pos = |title: &str| started.iter().position(|t| t == title).unwrap();
        // T3 was prioritized; T1 and T2 keep created_at order.
        assert!(pos("t3") < pos("t1"));
        assert!(pos("t1") < pos("t2"));
        exec.stop();
    }

    #[tokio::test]
    async fn parent_with_failing_child_fails_after_all_terminal() {
        let (store, _, exec) = setup(4);
        exec.start().unwrap();

        let parent = store
            .create_task(spec("parent").with_input(json!({
                "spawn": [
                    {"title": "x", "kind": "action", "principal": "tester"},
                    {"title": "y", "kind": "action", "principal": "tester", "input": {"fail": "permanent"}, "max_retries": 0},
                    {"title": "z", "kind": "action", "principal": "tester"},
                ]
            })))
            .unwrap();

        wait_status(&store, &parent, TaskStatus::Failed).await;
        // Children are all terminal by the time the parent settles.
        for child in store.children(&parent) {
            assert!(child.status.is_terminal());
        }
        exec.stop();
    }

    #[tokio::test]
    async fn tolerant_parent_aggregates_surviving_outputs() {
        let (store, _, exec) = setup(4);
        exec.start().unwrap();

        let mut parent_spec = spec("parent").with_input(json!({
            "spawn": [
                {"title": "x", "kind": "action", "principal": "tester"},
                {"title": "y", "kind": "action", "principal": "tester", "input": {"fail": "permanent"}, "max_retries": 0},
            ]
        }));
        parent_spec.tolerate_failures = true;
        let parent = store.create_task(parent_spec).unwrap();

        wait_status(&store, &parent, TaskStatus::Completed).await;
        let out = store.get(&parent).unwrap().output.unwrap();
        let children = out["children"].as_array().unwrap();
        // Only the surviving child's output is aggregated.
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["title"], "x");
        exec.stop();
    }

    #[tokio::test]
    async fn waiting_input_parks_and_resumes() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let mut s = spec("gated");
        s.input_prompt = Some("proceed?".into());
        let id = store.create_task(s).unwrap();

        wait_status(&store, &id, TaskStatus::WaitingInput).await;
        // Slot is released while parked.
        assert_eq!(exec.slots.available_permits(), 2);
        let task = store.get(&id).unwrap();
        assert!(task.waiting_for_input);
        assert_eq!(task.input_prompt.as_deref(), Some("proceed?"));

        exec.provide_input(&id, json!({"choice": "yes"})).unwrap();
        wait_status(&store, &id, TaskStatus::Completed).await;
        exec.stop();
    }

    #[tokio::test]
    async fn interrupt_cancels_running_task_and_descendants() {
        let (store, _, exec) = setup(4);
        exec.start().unwrap();

        let parent = store
            .create_task(spec("parent").with_input(json!({
                "spawn": [
                    {"title": "slow", "kind": "action", "principal": "tester", "input": {"sleep_ms": 2000}},
                ]
            })))
            .unwrap();

        // Wait until the child is running.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let children = store.children(&parent);
            if children.iter().any(|c| c.status == TaskStatus::Running) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        exec.interrupt(&parent).unwrap();
        wait_status(&store, &parent, TaskStatus::Cancelled).await;
        for child in store.children(&parent) {
            wait_status(&store, &child.id, TaskStatus::Cancelled).await;
        }

        // Idempotent.
        exec.interrupt(&parent).unwrap();
        assert_eq!(store.get(&parent).unwrap().status, TaskStatus::Cancelled);
        exec.stop();
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let id = store
            .create_task(spec("flaky").with_input(json!({"fail_until": 3})))
            .unwrap();
        wait_status(&store, &id, TaskStatus::Completed).await;
        assert_eq!(store.get(&id).unwrap().retry_count, 2);
        exec.stop();
    }

    #[tokio::test]
    async fn exhausted_retries_become_permanent_failure() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let mut s = spec("doomed").with_input(json!({"fail": "transient"}));
        s.max_retries = 1;
        let id = store.create_task(s).unwrap();

        wait_status(&store, &id, TaskStatus::Failed).await;
        let task = store.get(&id).unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Permanent);
        exec.stop();
    }

    #[tokio::test]
    async fn condition_false_skips_task() {
        let (store, handler, exec) = setup(2);
        exec.start().unwrap();

        let a = store.create_task(spec("a")).unwrap();
        let gated = store
            .create_task(spec("gated").with_dependencies(vec![a]).with_condition(
                Condition::ParentOutputMatches {
                    path: "echo".into(),
                    op: MatchOp::Eq,
                    value: json!("not-a"),
                },
            ))
            .unwrap();

        wait_status(&store, &gated, TaskStatus::Cancelled).await;
        assert!(!handler.started().contains(&"gated".to_string()));
        exec.stop();
    }

    #[tokio::test]
    async fn condition_true_on_dependency_output_runs() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let a = store.create_task(spec("a")).unwrap();
        let gated = store
            .create_task(spec("gated").with_dependencies(vec![a]).with_condition(
                Condition::ParentOutputMatches {
                    path: "echo".into(),
                    op: MatchOp::Eq,
                    value: json!("a"),
                },
            ))
            .unwrap();

        wait_status(&store, &gated, TaskStatus::Completed).await;
        exec.stop();
    }

    #[tokio::test]
    async fn llm_condition_false_skips() {
        let store = Arc::new(TaskStore::new());
        let handler = ScriptedHandler::new();
        let exec = Executor::new(
            Arc::clone(&store),
            handler.clone(),
            Arc::new(FixedEvaluator(false)),
            test_config(2),
        );
        exec.start().unwrap();

        let id = store
            .create_task(spec("judged").with_condition(Condition::LlmEvaluate {
                prompt: "should this run?".into(),
            }))
            .unwrap();
        wait_status(&store, &id, TaskStatus::Cancelled).await;
        assert!(handler.started().is_empty());
        exec.stop();
    }

    #[tokio::test]
    async fn pause_holds_work_resume_releases() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();
        exec.pause();
        assert_eq!(exec.status(), ExecutorState::Paused);

        let id = store.create_task(spec("held")).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Pending);

        exec.resume();
        wait_status(&store, &id, TaskStatus::Completed).await;
        exec.stop();
    }

    #[tokio::test]
    async fn drain_finishes_in_flight_then_stops() {
        let (store, _, exec) = setup(2);
        exec.start().unwrap();

        let id = store
            .create_task(spec("slow").with_input(json!({"sleep_ms": 100})))
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(&id).unwrap().status != TaskStatus::Running {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        exec.drain();
        wait_status(&store, &id, TaskStatus::Completed).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while exec.status() != ExecutorState::Stopped {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (_, _, exec) = setup(1);
        exec.start().unwrap();
        assert!(exec.start().is_err());
        exec.stop();
    }

    #[tokio::test]
    async fn backpressure_rejects_tool_spawns() {
        let (store, _, exec) = setup(1);
        // Executor not started: everything stays pending.
        let parent = store.create_task(spec("parent")).unwrap();
        let limit = test_config(1).backpressure_limit();
        for i in 0..=limit {
            store.create_task(spec(&format!("fill-{i}"))).unwrap();
        }

        let err = exec
            .spawn(parent, vec![spec("overflow")], ExecutionMode::Parallel)
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure(_)));
    }

    #[tokio::test]
    async fn full_parallelism_keeps_overflow_pending() {
        let (store, _, exec) = setup(1);
        exec.start().unwrap();

        let slow = store
            .create_task(spec("slow").with_input(json!({"sleep_ms": 120})).with_priority(90))
            .unwrap();
        let queued = store.create_task(spec("queued")).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(&slow).unwrap().status != TaskStatus::Running {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // One slot, so the second task holds at pending.
        assert_eq!(store.get(&queued).unwrap().status, TaskStatus::Pending);

        wait_status(&store, &queued, TaskStatus::Completed).await;
        exec.stop();
    }

    #[tokio::test]
    async fn handler_await_input_outcome_parks_task() {
        struct AskingHandler(AtomicU32);

        #[async_trait::async_trait]
        impl TaskHandler for AskingHandler {
            async fn run(&self, task: Task, _ctx: HandlerCtx) -> Result<HandlerOutcome> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(HandlerOutcome::AwaitInput { prompt: "which one?".into() })
                } else {
                    Ok(HandlerOutcome::Complete(json!({
                        "chose": task.input["input"]["choice"]
                    })))
                }
            }
        }

        let store = Arc::new(TaskStore::new());
        let exec = Executor::new(
            Arc::clone(&store),
            Arc::new(AskingHandler(AtomicU32::new(0))),
            Arc::new(FixedEvaluator(true)),
            test_config(2),
        );
        exec.start().unwrap();

        let id = store.create_task(spec("asker")).unwrap();
        wait_status(&store, &id, TaskStatus::WaitingInput).await;
        exec.provide_input(&id, json!({"choice": "b"})).unwrap();
        wait_status(&store, &id, TaskStatus::Completed).await;
        assert_eq!(store.get(&id).unwrap().output.unwrap()["chose"], "b");
        exec.stop();
    }
}
