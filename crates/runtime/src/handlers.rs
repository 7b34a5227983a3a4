//! Task handlers: kind routing for executor workers, plus the boolean
//! evaluator behind `llm_evaluate` conditions.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};

use butler_domain::config::Config;
use butler_domain::error::{Error, Result};
use butler_domain::stream::OutputEvent;
use butler_domain::task::{Task, TaskKind};
use butler_domain::tool::ToolCallRequest;
use butler_domain::usage::UsageRecord;
use butler_executor::handler::{BoolEvaluator, HandlerCtx, HandlerOutcome, TaskHandler};
use butler_knowledge::RetrievalOrchestrator;
use butler_llm::{parse_stream, AcceptAll, GenerateParams, GenerateRequest, LlmClient};
use butler_store::UsageStore;
use butler_tools::{Dispatcher, ToolCtx};

use crate::bus::EventBus;
use crate::turn::RegistryValidator;

/// Marker on the implicit conversation-scoped parent task; it parks on
/// `waiting_input` and only collects children.
pub const CONVERSATION_CONTAINER_KEY: &str = "conversation_container";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kind router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes executor work by task kind: LLM-typed kinds (research,
/// analysis, synthesis) go through a grounded LLM call; action-typed
/// kinds dispatch a configured tool, or complete trivially when the task
/// is pure orchestration structure.
pub struct KindRouter {
    pub llm: Arc<dyn LlmClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub retrieval: Arc<RetrievalOrchestrator>,
    pub usage: Arc<UsageStore>,
    pub bus: Arc<EventBus>,
    pub config: Arc<Config>,
}

#[async_trait::async_trait]
impl TaskHandler for KindRouter {
    async fn run(&self, task: Task, ctx: HandlerCtx) -> Result<HandlerOutcome> {
        if task.input.get(CONVERSATION_CONTAINER_KEY).is_some() {
            return Ok(HandlerOutcome::AwaitChildren);
        }
        if task.kind.is_llm_typed() {
            return self.run_llm_task(&task, &ctx).await;
        }
        self.run_action_task(&task, &ctx).await
    }
}

impl KindRouter {
    /// One grounded LLM call: retrieve context for the task, generate,
    /// dispatch any emitted tool calls, fold everything into the output.
    async fn run_llm_task(&self, task: &Task, ctx: &HandlerCtx) -> Result<HandlerOutcome> {
        let query = if task.description.is_empty() {
            task.title.clone()
        } else {
            task.description.clone()
        };
        let bundle = self
            .retrieval
            .retrieve(&query, &task.principal, self.config.retrieval.context_budget_tokens)
            .await?;

        let mut prompt = String::new();
        prompt.push_str(&self.config.turn.system_directives);
        prompt.push_str("\n\n");
        if !bundle.is_empty() {
            prompt.push_str("## Context\n\n");
            prompt.push_str(&bundle.render());
        }
        prompt.push_str(&format!("## Task\n\n{}\n", query));
        if !task.input.is_null() {
            prompt.push_str(&format!("\nInput:\n{}\n", task.input));
        }

        let started = std::time::Instant::now();
        let stream = self
            .llm
            .generate(GenerateRequest {
                model: self.config.llm.model.clone(),
                prompt,
                params: GenerateParams::default(),
            })
            .await?;

        let validator = Arc::new(RegistryValidator(self.dispatcher.registry().clone()));
        let mut events = parse_stream(stream, validator);
        let mut content = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        let mut usage = butler_domain::stream::Usage::default();
        while let Some(event) = events.next().await {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled("task cancelled during generation".into()));
            }
            match event? {
                OutputEvent::Content { delta } => content.push_str(&delta),
                OutputEvent::ToolCall { call } => calls.push(call),
                OutputEvent::End { usage: u } => usage = u,
                OutputEvent::Error { kind, message } => {
                    tracing::warn!(task_id = %task.id, ?kind, %message, "parse error in task output");
                }
            }
        }

        self.usage.record(UsageRecord::new(
            &self.config.llm.model,
            &usage,
            started.elapsed().as_millis() as u64,
        ));

        // Dispatch whatever the model asked for; results ride along in
        // the task output.
        let mut tool_results = Vec::new();
        for call in &calls {
            let tool_ctx = ToolCtx {
                cancel: ctx.cancel.clone(),
                principal: ctx.principal.clone(),
                conversation_id: task.conversation_id,
                parent_task: Some(task.id),
                spawner: Arc::clone(&ctx.spawner),
            };
            let outcome = self.dispatcher.dispatch(call, &tool_ctx).await;
            tool_results.push(match outcome.result {
                Ok(value) => json!({"call_id": outcome.call_id, "ok": value}),
                Err(e) => json!({"call_id": outcome.call_id, "error": e.to_string()}),
            });
        }

        // Tool calls may have spawned subtasks; the executor awaits any
        // live children before settling the task.
        Ok(HandlerOutcome::Complete(json!({
            "content": content,
            "tool_results": tool_results,
        })))
    }

    /// Action-typed task: dispatch the configured tool, or complete as a
    /// structural node. `notify` additionally publishes to the event bus.
    async fn run_action_task(&self, task: &Task, ctx: &HandlerCtx) -> Result<HandlerOutcome> {
        if task.kind == TaskKind::Notify {
            self.bus.publish(
                "notifications",
                json!({
                    "task_id": task.id,
                    "title": task.title,
                    "body": task.input.get("message").cloned().unwrap_or(Value::Null),
                }),
            );
        }

        let Some(tool_spec) = task.input.get("tool") else {
            // Pure orchestration node (workflow structure, containers).
            return Ok(HandlerOutcome::Complete(json!({
                "status": "ok",
                "task": task.title,
            })));
        };

        let call = ToolCallRequest {
            id: format!("task-{}", task.id),
            tool_type: tool_spec
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("input.tool.type missing".into()))?
                .to_string(),
            parameters: tool_spec.get("parameters").cloned().unwrap_or(json!({})),
        };
        let tool_ctx = ToolCtx {
            cancel: ctx.cancel.clone(),
            principal: ctx.principal.clone(),
            conversation_id: task.conversation_id,
            parent_task: Some(task.id),
            spawner: Arc::clone(&ctx.spawner),
        };
        let outcome = self.dispatcher.dispatch(&call, &tool_ctx).await;
        match outcome.result {
            Ok(value) => Ok(HandlerOutcome::Complete(value)),
            Err(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// llm_evaluate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Boolean contract for AI-evaluated conditions: ask for strict JSON,
/// fall back to a bare true/false token scan, and resolve any parse
/// failure to `false`.
pub struct LlmConditionEvaluator {
    pub llm: Arc<dyn LlmClient>,
    pub usage: Arc<UsageStore>,
    pub model: String,
}

#[async_trait::async_trait]
impl BoolEvaluator for LlmConditionEvaluator {
    async fn evaluate(&self, prompt: &str) -> bool {
        let full_prompt = format!(
            "Answer strictly with JSON: {{\"result\": true|false}}.\n\n{prompt}"
        );
        let started = std::time::Instant::now();
        let stream = match self
            .llm
            .generate(GenerateRequest {
                model: self.model.clone(),
                prompt: full_prompt,
                params: GenerateParams { temperature: Some(0.0), max_tokens: Some(16) },
            })
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "condition evaluation call failed");
                return false;
            }
        };

        // Strip any wire framing, keep the content.
        let mut events = parse_stream(stream, Arc::new(AcceptAll));
        let mut text = String::new();
        let mut usage = butler_domain::stream::Usage::default();
        while let Some(event) = events.next().await {
            match event {
                Ok(OutputEvent::Content { delta }) => text.push_str(&delta),
                Ok(OutputEvent::End { usage: u }) => usage = u,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "condition evaluation stream failed");
                    return false;
                }
            }
        }
        self.usage.record(UsageRecord::new(
            &self.model,
            &usage,
            started.elapsed().as_millis() as u64,
        ));
        parse_bool_answer(&text)
    }
}

/// Lenient boolean extraction; `false` on any ambiguity.
pub(crate) fn parse_bool_answer(text: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if let Some(result) = value.get("result").and_then(Value::as_bool) {
            return result;
        }
    }
    let lowered = text.to_lowercase();
    let has_true = lowered.contains("true");
    let has_false = lowered.contains("false");
    has_true && !has_false
}
