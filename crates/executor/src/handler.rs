//! Worker seams: the task handler trait and the boolean evaluator used
//! for `llm_evaluate` conditions.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use butler_domain::error::Result;
use butler_domain::task::{ExecutionMode, Task, TaskSpec};

use crate::cancel::CancelToken;

/// What a handler produced for one task.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The task's own work is done; the executor still awaits any live
    /// children before the task completes.
    Complete(Value),
    /// The handler spawned children and has no output of its own.
    AwaitChildren,
    /// Park the task until `provide_input` delivers a payload.
    AwaitInput { prompt: String },
}

/// Capability to spawn follow-up tasks, subject to scheduler backpressure.
pub trait SpawnSink: Send + Sync {
    /// Spawn subtasks under `parent_id`. Returns `Error::Backpressure`
    /// when the ready queue is saturated.
    fn spawn(&self, parent_id: Uuid, specs: Vec<TaskSpec>, mode: ExecutionMode) -> Result<Vec<Uuid>>;
}

/// Per-invocation context handed to a task handler.
pub struct HandlerCtx {
    pub cancel: CancelToken,
    pub principal: String,
    pub spawner: Arc<dyn SpawnSink>,
}

/// The worker seam. One implementation routes on `task.kind`: LLM-typed
/// kinds go through the conversation turn machinery, action-typed kinds
/// through the tool registry.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: Task, ctx: HandlerCtx) -> Result<HandlerOutcome>;
}

/// Boolean contract for `llm_evaluate` conditions: implementations ask the
/// LLM and must resolve parse failures to `false`.
#[async_trait::async_trait]
pub trait BoolEvaluator: Send + Sync {
    async fn evaluate(&self, prompt: &str) -> bool;
}

/// Evaluator used when no LLM is wired: every `llm_evaluate` condition is
/// treated as unparseable, i.e. `false`.
pub struct NullEvaluator;

#[async_trait::async_trait]
impl BoolEvaluator for NullEvaluator {
    async fn evaluate(&self, _prompt: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_evaluator_is_false() {
        assert!(!NullEvaluator.evaluate("anything at all").await);
    }
}
