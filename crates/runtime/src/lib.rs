//! Butler runtime — wires the stores, executor, triggers, tool registry,
//! LLM pipeline, and retrieval into one process, and exposes the surface
//! the UI/API layer consumes.
//!
//! Entry point: [`Butler::builder`] constructs the state; [`Butler::start`]
//! brings the executor and trigger service up.

pub mod bus;
pub mod handlers;
pub mod observability;
pub mod state;
pub mod turn;

pub use bus::{BusEvent, EventBus};
pub use observability::init_tracing;
pub use state::{AppState, AppStateBuilder};
pub use turn::{submit_user_message, TurnEvent};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use butler_domain::config::Config;
use butler_domain::conversation::{Attachment, Conversation};
use butler_domain::error::Result;
use butler_domain::task::{Task, TaskFilter, TaskSpec};
use butler_domain::trigger::Trigger;
use butler_domain::workflow::Workflow;
use butler_executor::ExecutorState;
use butler_knowledge::{ContextBundle, IngestReport, IngestSource};

/// The assembled personal-assistant core.
pub struct Butler {
    pub state: AppState,
}

impl Butler {
    pub fn builder(config: Config) -> AppStateBuilder {
        AppStateBuilder::new(config)
    }

    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the executor and the trigger scan loop, and bridge bus
    /// events into the trigger service.
    pub fn start(&self) -> Result<()> {
        self.state.executor.start()?;
        tokio::spawn(Arc::clone(&self.state.triggers).run());
        bus::bridge_to_triggers(&self.state.bus, Arc::clone(&self.state.triggers));
        Ok(())
    }

    // ── Task lifecycle ────────────────────────────────────────────

    pub fn create_task(&self, spec: TaskSpec) -> Result<Uuid> {
        self.state.tasks.create_task(spec)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.state.tasks.list(filter)
    }

    pub fn prioritize(&self, task_id: &Uuid) -> Result<u8> {
        self.state.executor.prioritize(task_id)
    }

    pub fn interrupt(&self, task_id: &Uuid) -> Result<()> {
        self.state.executor.interrupt(task_id)
    }

    pub fn provide_input(&self, task_id: &Uuid, payload: Value) -> Result<()> {
        self.state.executor.provide_input(task_id, payload)
    }

    // ── Executor control ──────────────────────────────────────────

    pub fn stop(&self) {
        self.state.executor.stop();
    }

    pub fn pause(&self) {
        self.state.executor.pause();
    }

    pub fn resume(&self) {
        self.state.executor.resume();
    }

    pub fn status(&self) -> ExecutorState {
        self.state.executor.status()
    }

    // ── Conversations ─────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        principal: impl Into<String>,
        title: impl Into<String>,
    ) -> Conversation {
        self.state.conversations.create(principal, title)
    }

    /// Submit a user message; returns the assistant message id and the
    /// turn event stream.
    pub fn submit_user_message(
        &self,
        conversation_id: Uuid,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<(Uuid, mpsc::Receiver<TurnEvent>)> {
        turn::submit_user_message(self.state.clone(), conversation_id, content, attachments)
    }

    // ── Workflows ─────────────────────────────────────────────────

    pub fn register_workflow(&self, workflow: Workflow) -> Uuid {
        self.state.workflows.register(workflow)
    }

    /// Instantiate a workflow into a concrete task tree; the executor
    /// picks it up immediately.
    pub fn instantiate_workflow(&self, workflow_id: &Uuid, principal: &str) -> Result<Uuid> {
        self.state
            .workflows
            .instantiate(workflow_id, &self.state.tasks, principal)
    }

    // ── Triggers ──────────────────────────────────────────────────

    pub fn register_trigger(&self, trigger: Trigger) -> Result<Uuid> {
        self.state.triggers.register(trigger)
    }

    pub fn fire_trigger(&self, trigger_id: &Uuid) -> Result<Option<Uuid>> {
        self.state.triggers.fire_manual(trigger_id, Uuid::new_v4())
    }

    // ── Knowledge ─────────────────────────────────────────────────

    pub async fn ingest(&self, source: IngestSource) -> Result<IngestReport> {
        self.state.ingestor.ingest(source).await
    }

    pub async fn query(&self, text: &str) -> Result<ContextBundle> {
        self.state
            .retrieval
            .retrieve(text, "", self.state.config.retrieval.context_budget_tokens)
            .await
    }

    // ── Persistence ───────────────────────────────────────────────

    pub fn save_all(&self) -> Result<()> {
        self.state.save_all()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// End-to-end tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
