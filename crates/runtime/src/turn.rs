//! Conversation turn driver — ties retrieval, the LLM call, output
//! parsing, tool dispatch, and task spawning into one streamed turn.
//!
//! Entry point: [`submit_user_message`] appends the user message, spawns
//! the async turn, and returns the assistant message id plus a channel of
//! [`TurnEvent`]s for SSE-style consumption.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use butler_domain::conversation::{Attachment, Message, Role, ToolCallRecord, ToolCallStatus};
use butler_domain::error::{Error, Result};
use butler_domain::stream::{OutputEvent, Usage};
use butler_domain::task::{ExecutionMode, TaskFilter, TaskKind, TaskSpec};
use butler_domain::tool::ToolCallRequest;
use butler_domain::usage::UsageRecord;
use butler_executor::handler::SpawnSink;
use butler_executor::CancelToken;
use butler_llm::{parse_stream, GenerateParams, GenerateRequest};
use butler_llm::{ToolCallValidator, TOOL_CALL_DELIMITER};
use butler_tools::{DispatchOutcome, ToolCtx, ToolRegistry};

use crate::handlers::CONVERSATION_CONTAINER_KEY;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry-backed tool-call validation for the parser.
pub struct RegistryValidator(pub ToolRegistry);

impl ToolCallValidator for RegistryValidator {
    fn validate(&self, call: &ToolCallRequest) -> Result<()> {
        self.0.validate(&call.tool_type, &call.parameters)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — the streamed event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a single conversation turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Incremental assistant text.
    AssistantDelta { text: String },
    /// The model requested a tool.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    /// A dispatched tool finished.
    ToolResult {
        call_id: String,
        tool_name: String,
        content: Value,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// A tool result spawned a background task.
    TaskSpawned { task_id: Uuid },
    /// Token usage for the turn's LLM call.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
    },
    /// The finalized assistant message.
    Final { message_id: Uuid, content: String },
    /// The turn failed; any streamed partial content is preserved.
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn: append the user message, stream the assistant response,
/// dispatch tools, and finalize. Returns the assistant message id and the
/// event receiver.
pub fn submit_user_message(
    state: AppState,
    conversation_id: Uuid,
    content: String,
    attachments: Vec<Attachment>,
) -> Result<(Uuid, mpsc::Receiver<TurnEvent>)> {
    let conversation = state
        .conversations
        .get(&conversation_id)
        .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;

    // History snapshot from before this turn.
    let history = state
        .conversations
        .tail(&conversation_id, state.config.turn.max_history);

    let mut user_msg = Message::new(conversation_id, Role::User, content.clone());
    user_msg.attachments = attachments;
    state.conversations.append(user_msg)?;

    // Placeholder assistant message; streamed content lands here.
    let assistant_msg = state
        .conversations
        .append(Message::new(conversation_id, Role::Assistant, ""))?;
    let assistant_id = assistant_msg.id;

    let (tx, rx) = mpsc::channel(64);
    let span = tracing::info_span!(
        "turn",
        conversation_id = %conversation_id,
        assistant_id = %assistant_id,
    );
    tokio::spawn(
        async move {
            run_turn_inner(
                state,
                conversation.principal,
                conversation_id,
                assistant_id,
                history,
                content,
                tx,
            )
            .await;
        }
        .instrument(span),
    );

    Ok((assistant_id, rx))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn run_turn_inner(
    state: AppState,
    principal: String,
    conversation_id: Uuid,
    assistant_id: Uuid,
    history: Vec<Message>,
    user_content: String,
    tx: mpsc::Sender<TurnEvent>,
) {
    // ── 1. Retrieval ──────────────────────────────────────────────
    let budget = state.config.retrieval.context_budget_tokens;
    let bundle = match state
        .retrieval
        .retrieve(&user_content, &principal, budget)
        .await
    {
        Ok(bundle) => Some(bundle),
        Err(e) => {
            tracing::warn!(error = %e, "retrieval failed; continuing without context");
            None
        }
    };

    // ── 2. Prompt composition ─────────────────────────────────────
    let prompt = compose_prompt(&state, bundle.as_ref(), &history, &user_content);

    // ── 3. LLM call ───────────────────────────────────────────────
    let started = std::time::Instant::now();
    let stream = match state
        .llm
        .generate(GenerateRequest {
            model: state.config.llm.model.clone(),
            prompt,
            params: GenerateParams::default(),
        })
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            fail_turn(&state, &tx, assistant_id, conversation_id, "", &e).await;
            return;
        }
    };

    // ── 4. Stream through the output parser ───────────────────────
    let validator = Arc::new(RegistryValidator(state.dispatcher.registry().clone()));
    let mut events = parse_stream(stream, validator);

    let mut content = String::new();
    let mut calls: Vec<ToolCallRequest> = Vec::new();
    let mut parse_errors = 0usize;
    let mut usage = Usage::default();

    while let Some(event) = events.next().await {
        match event {
            Ok(OutputEvent::Content { delta }) => {
                let _ = tx.send(TurnEvent::AssistantDelta { text: delta.clone() }).await;
                content.push_str(&delta);
            }
            Ok(OutputEvent::ToolCall { call }) => {
                let _ = tx
                    .send(TurnEvent::ToolCallStarted {
                        call_id: call.id.clone(),
                        tool_name: call.tool_type.clone(),
                        arguments: call.parameters.clone(),
                    })
                    .await;
                calls.push(call);
            }
            Ok(OutputEvent::End { usage: u }) => usage = u,
            Ok(OutputEvent::Error { kind, message }) => {
                tracing::warn!(?kind, %message, "parse error in turn");
                parse_errors += 1;
            }
            Err(e) => {
                // Transport error: the turn fails, streamed partial
                // content is preserved on the assistant message.
                fail_turn(&state, &tx, assistant_id, conversation_id, &content, &e).await;
                return;
            }
        }
    }

    // A parse failure only fails the turn when it prevented all content.
    if content.is_empty() && calls.is_empty() && parse_errors > 0 {
        let err = Error::Parse("model output had no usable content".into());
        fail_turn(&state, &tx, assistant_id, conversation_id, "", &err).await;
        return;
    }

    // ── 5. Finalize assistant message ─────────────────────────────
    let display = state.sanitizer.sanitize(&content);
    let mut assistant_msg = match load_message(&state, conversation_id, assistant_id) {
        Some(msg) => msg,
        None => return,
    };
    assistant_msg.content = display.clone();
    assistant_msg.tool_calls = calls
        .iter()
        .map(|c| ToolCallRecord::pending(&c.id, &c.tool_type, c.parameters.clone(), assistant_id))
        .collect();
    if let Err(e) = state.conversations.update(&assistant_msg) {
        tracing::warn!(error = %e, "failed to update assistant message");
    }

    // ── 6. Usage accounting ───────────────────────────────────────
    let mut record = UsageRecord::new(
        &state.config.llm.model,
        &usage,
        started.elapsed().as_millis() as u64,
    )
    .for_conversation(conversation_id, Some(assistant_id));
    if let Some(pricing) = state.config.llm.pricing.get(&state.config.llm.model) {
        record.estimated_cost_usd =
            pricing.estimate_cost(usage.prompt_tokens, usage.completion_tokens);
    }
    state.usage.record(record);
    let _ = tx
        .send(TurnEvent::Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
        .await;

    // ── 7. Tool dispatch ──────────────────────────────────────────
    let cancel = CancelToken::new();
    let outcomes = dispatch_calls(&state, &principal, conversation_id, &calls, &cancel).await;

    let mut critical_failure: Option<String> = None;
    for (call, outcome) in calls.iter().zip(outcomes) {
        let is_error = outcome.is_error();
        if is_error && outcome.critical {
            critical_failure = Some(format!(
                "critical tool '{}' failed: {}",
                outcome.tool_type,
                outcome.result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
            ));
        }

        // Fold the outcome into the assistant message's call record.
        let (result_value, status) = match &outcome.result {
            Ok(value) => (value.clone(), ToolCallStatus::Ok),
            Err(e) => (json!({"error": e.to_string()}), ToolCallStatus::Error),
        };
        if let Some(record) = assistant_msg.tool_calls.iter_mut().find(|r| r.id == call.id) {
            record.status = status;
            record.duration_ms = Some(outcome.duration_ms);
            match &outcome.result {
                Ok(value) => record.result = Some(value.clone()),
                Err(e) => record.error = Some(e.to_string()),
            }
        }

        // Spawn-task markers become subtasks under the conversation's
        // implicit parent.
        let mut result_for_message = result_value.clone();
        if let Some(spawn_params) = result_value.get("spawn_task") {
            match spawn_conversation_subtask(&state, conversation_id, &principal, spawn_params) {
                Ok(task_id) => {
                    let _ = tx.send(TurnEvent::TaskSpawned { task_id }).await;
                    result_for_message = json!({"spawned_task_id": task_id});
                }
                Err(e) => {
                    tracing::warn!(error = %e, "spawn_task failed");
                    result_for_message = json!({"error": e.to_string()});
                }
            }
        }

        // Append the tool-role message that answers this call.
        let mut tool_msg = Message::new(conversation_id, Role::Tool, "");
        tool_msg.tool_results.push(json!({
            "call_id": call.id,
            "tool_name": call.tool_type,
            "content": result_for_message,
            "is_error": is_error,
        }));
        if let Err(e) = state.conversations.append(tool_msg) {
            tracing::warn!(error = %e, "failed to append tool message");
        }

        let _ = tx
            .send(TurnEvent::ToolResult {
                call_id: call.id.clone(),
                tool_name: call.tool_type.clone(),
                content: result_for_message,
                is_error,
            })
            .await;
    }

    if let Err(e) = state.conversations.update(&assistant_msg) {
        tracing::warn!(error = %e, "failed to update assistant message");
    }

    // ── 8. Finalize ───────────────────────────────────────────────
    if let Some(message) = critical_failure {
        let _ = tx.send(TurnEvent::Error { message }).await;
        return;
    }
    let _ = tx
        .send(TurnEvent::Final { message_id: assistant_id, content: display })
        .await;
}

/// Dispatch all calls concurrently, results in call order.
async fn dispatch_calls(
    state: &AppState,
    principal: &str,
    conversation_id: Uuid,
    calls: &[ToolCallRequest],
    cancel: &CancelToken,
) -> Vec<DispatchOutcome> {
    let futures: Vec<_> = calls
        .iter()
        .map(|call| {
            let ctx = ToolCtx {
                cancel: cancel.clone(),
                principal: principal.to_string(),
                conversation_id: Some(conversation_id),
                parent_task: None,
                spawner: Arc::clone(&state.executor) as Arc<dyn SpawnSink>,
            };
            let dispatcher = Arc::clone(&state.dispatcher);
            let call = call.clone();
            async move {
                let span = tracing::info_span!("tool.call", tool_name = %call.tool_type);
                dispatcher.dispatch(&call, &ctx).instrument(span).await
            }
        })
        .collect();
    futures_util::future::join_all(futures).await
}

/// Mark the turn failed: preserve any partial content on the assistant
/// message with an error indicator, and emit `TurnEvent::Error`.
async fn fail_turn(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    assistant_id: Uuid,
    conversation_id: Uuid,
    partial: &str,
    err: &Error,
) {
    tracing::warn!(error = %err, "turn failed");
    if let Some(mut msg) = load_message(state, conversation_id, assistant_id) {
        let indicator = json!({"error": {"kind": err.kind(), "message": err.to_string()}});
        msg.content = if partial.is_empty() {
            format!("⚠️ {err}")
        } else {
            format!("{partial}\n\n⚠️ {err}")
        };
        msg.tool_results = vec![indicator];
        if let Err(e) = state.conversations.update(&msg) {
            tracing::warn!(error = %e, "failed to record turn failure");
        }
    }
    let _ = tx.send(TurnEvent::Error { message: err.to_string() }).await;
}

fn load_message(state: &AppState, conversation_id: Uuid, id: Uuid) -> Option<Message> {
    state
        .conversations
        .messages(&conversation_id)
        .into_iter()
        .find(|m| m.id == id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt composition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn compose_prompt(
    state: &AppState,
    bundle: Option<&butler_knowledge::ContextBundle>,
    history: &[Message],
    user_content: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&state.config.turn.system_directives);
    prompt.push_str("\n\n");
    prompt.push_str(&render_tool_instructions(state.dispatcher.registry()));

    if let Some(bundle) = bundle {
        if !bundle.is_empty() {
            prompt.push_str("\n## Context\n\n");
            prompt.push_str(&bundle.render());
        }
    }

    let truncated = truncate_history(
        history,
        state.config.turn.max_history,
        state.config.turn.preserved_window,
    );
    if !truncated.is_empty() {
        prompt.push_str("\n## Conversation\n\n");
        prompt.push_str(&render_history(truncated));
    }

    prompt.push_str("\nuser: ");
    prompt.push_str(user_content);
    prompt.push('\n');
    prompt
}

/// Tool instructions quote [`TOOL_CALL_DELIMITER`] directly, so the system
/// prompt and the parser cannot drift apart.
fn render_tool_instructions(registry: &ToolRegistry) -> String {
    let defs = registry.definitions();
    let mut out = String::from(
        "Respond with a JSON array of tool calls (possibly empty), then the \
         delimiter, then your markdown answer.\n",
    );
    out.push_str(&format!("Delimiter: {TOOL_CALL_DELIMITER}\n"));
    if !defs.is_empty() {
        out.push_str("Available tools:\n");
        for def in defs {
            out.push_str(&format!(
                "- {}: {} parameters: {}\n",
                def.name, def.description, def.parameters
            ));
        }
    }
    out
}

/// Least-recent-first truncation with a preserved window: the most recent
/// `max_history.max(preserved_window)` messages survive.
fn truncate_history(msgs: &[Message], max_history: usize, preserved_window: usize) -> &[Message] {
    let keep = max_history.max(preserved_window);
    let skip = msgs.len().saturating_sub(keep);
    &msgs[skip..]
}

fn render_history(msgs: &[Message]) -> String {
    let mut out = String::new();
    for msg in msgs {
        if msg.content.is_empty() && msg.tool_results.is_empty() {
            continue;
        }
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        if msg.role == Role::Tool {
            let results = serde_json::to_string(&msg.tool_results).unwrap_or_default();
            out.push_str(&format!("{role}: {results}\n"));
        } else {
            out.push_str(&format!("{role}: {}\n", msg.content));
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation-scoped task spawning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Find (or create) the conversation's implicit parent task. It parks on
/// `waiting_input` so it stays non-terminal and holds no slot while the
/// conversation is alive.
fn ensure_conversation_container(
    state: &AppState,
    conversation_id: Uuid,
    principal: &str,
) -> Result<Uuid> {
    let existing = state
        .tasks
        .list(&TaskFilter::default())
        .into_iter()
        .find(|t| {
            t.conversation_id == Some(conversation_id)
                && !t.status.is_terminal()
                && t.input.get(CONVERSATION_CONTAINER_KEY).is_some()
        });
    if let Some(task) = existing {
        return Ok(task.id);
    }

    let mut spec = TaskSpec::new("conversation tasks", TaskKind::Action)
        .with_principal(principal)
        .with_input(json!({ CONVERSATION_CONTAINER_KEY: true }));
    spec.conversation_id = Some(conversation_id);
    spec.input_prompt = Some("awaiting conversation activity".into());
    state.tasks.create_task(spec)
}

/// Create a subtask from a `spawn_task` tool marker, under the implicit
/// conversation-scoped parent, through the executor (so backpressure
/// applies). Retries once with a fresh container if the old one raced to
/// a terminal state.
fn spawn_conversation_subtask(
    state: &AppState,
    conversation_id: Uuid,
    principal: &str,
    params: &Value,
) -> Result<Uuid> {
    let title = params
        .get("title")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("spawn_task.title missing".into()))?;
    let kind: TaskKind = serde_json::from_value(
        params.get("kind").cloned().unwrap_or_else(|| json!("research")),
    )
    .map_err(|e| Error::Validation(format!("spawn_task.kind invalid: {e}")))?;

    let mut spec = TaskSpec::new(title, kind).with_principal(principal);
    spec.conversation_id = Some(conversation_id);
    if let Some(description) = params.get("description").and_then(Value::as_str) {
        spec.description = description.to_string();
    }
    if let Some(priority) = params.get("priority").and_then(Value::as_u64) {
        spec.priority = priority.min(100) as u8;
    }
    if let Some(input) = params.get("input") {
        spec.input = input.clone();
    }

    for attempt in 0..2 {
        let container = ensure_conversation_container(state, conversation_id, principal)?;
        match state
            .executor
            .spawn(container, vec![spec.clone()], ExecutionMode::Parallel)
        {
            Ok(ids) => return Ok(ids[0]),
            Err(Error::Validation(_)) if attempt == 0 => {
                // The container settled between lookup and spawn; a fresh
                // one is created on the retry.
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Validation("conversation container unavailable".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppStateBuilder;
    use butler_domain::config::Config;
    use butler_domain::stream::{BoxStream, GenerateChunk};
    use butler_llm::MockLlm;

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn state_with_responses(responses: Vec<String>) -> AppState {
        AppStateBuilder::new(Config::default())
            .llm(Arc::new(MockLlm::new(responses)))
            .build()
            .unwrap()
    }

    fn final_content(events: &[TurnEvent]) -> Option<String> {
        events.iter().find_map(|e| match e {
            TurnEvent::Final { content, .. } => Some(content.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn plain_turn_completes() {
        let state = state_with_responses(vec!["[]\n\n✂️🐱\n\nHello there.".into()]);
        let conv = state.conversations.create("alice", "chat");
        let (assistant_id, rx) =
            submit_user_message(state.clone(), conv.id, "hi".into(), vec![]).unwrap();

        let events = drain(rx).await;
        assert_eq!(final_content(&events).as_deref(), Some("Hello there."));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Usage { .. })));

        let msgs = state.conversations.messages(&conv.id);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].id, assistant_id);
        assert_eq!(msgs[1].content, "Hello there.");

        // One usage record, linked to the conversation.
        let records = state.usage.for_conversation(&conv.id);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn spawn_task_tool_creates_conversation_subtask() {
        let wire = "[{\"id\":\"c1\",\"type\":\"spawn_task\",\"parameters\":{\"title\":\"dig into rust streams\",\"kind\":\"research\"}}]\n\n✂️🐱\n\nI queued a research task.".into();
        let state = state_with_responses(vec![wire]);
        let conv = state.conversations.create("alice", "chat");
        let (_, rx) = submit_user_message(state.clone(), conv.id, "go".into(), vec![]).unwrap();

        let events = drain(rx).await;
        assert!(final_content(&events).is_some());
        let spawned = events.iter().find_map(|e| match e {
            TurnEvent::TaskSpawned { task_id } => Some(*task_id),
            _ => None,
        });
        let task_id = spawned.expect("a task should be spawned");

        let task = state.tasks.get(&task_id).unwrap();
        assert_eq!(task.title, "dig into rust streams");
        assert_eq!(task.kind, TaskKind::Research);
        assert_eq!(task.conversation_id, Some(conv.id));
        assert_eq!(task.principal, "alice");
        // Under the implicit conversation-scoped container.
        let parent = state.tasks.get(&task.parent_id.unwrap()).unwrap();
        assert!(parent.input.get(CONVERSATION_CONTAINER_KEY).is_some());

        // Pairing invariant: the assistant's declared calls match the
        // following tool-role messages.
        assert!(state.conversations.verify_tool_pairing(&conv.id).is_empty());
    }

    #[tokio::test]
    async fn second_spawn_reuses_container() {
        let wire = |title: &str| {
            format!(
                "[{{\"id\":\"c1\",\"type\":\"spawn_task\",\"parameters\":{{\"title\":\"{title}\",\"kind\":\"fetch\"}}}}]\n\n✂️🐱\n\nok"
            )
        };
        let state = state_with_responses(vec![wire("one"), wire("two")]);
        let conv = state.conversations.create("alice", "chat");

        let (_, rx) = submit_user_message(state.clone(), conv.id, "a".into(), vec![]).unwrap();
        drain(rx).await;
        let (_, rx) = submit_user_message(state.clone(), conv.id, "b".into(), vec![]).unwrap();
        drain(rx).await;

        let containers: Vec<_> = state
            .tasks
            .list(&TaskFilter::default())
            .into_iter()
            .filter(|t| t.input.get(CONVERSATION_CONTAINER_KEY).is_some())
            .collect();
        assert_eq!(containers.len(), 1);
        assert_eq!(state.tasks.children(&containers[0].id).len(), 2);
    }

    #[tokio::test]
    async fn unknown_tool_call_is_rejected_not_dispatched() {
        let wire = "[{\"id\":\"c1\",\"type\":\"made_up\",\"parameters\":{}}]\n\n✂️🐱\n\nstill answering".into();
        let state = state_with_responses(vec![wire]);
        let conv = state.conversations.create("alice", "chat");
        let (_, rx) = submit_user_message(state.clone(), conv.id, "x".into(), vec![]).unwrap();

        let events = drain(rx).await;
        // Invalid call never started.
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::ToolCallStarted { .. })));
        assert_eq!(final_content(&events).as_deref(), Some("still answering"));
    }

    #[tokio::test]
    async fn malformed_output_with_no_content_fails_turn() {
        let state = state_with_responses(vec!["[{\"id\": \"t1\", \"type\"".into()]);
        let conv = state.conversations.create("alice", "chat");
        let (_, rx) = submit_user_message(state.clone(), conv.id, "x".into(), vec![]).unwrap();

        let events = drain(rx).await;
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        assert!(final_content(&events).is_none());
        // The conversation remains usable: the assistant message carries
        // the error indicator.
        let msgs = state.conversations.messages(&conv.id);
        assert!(msgs[1].content.contains("⚠️"));
    }

    struct FailingMidStream;

    #[async_trait::async_trait]
    impl butler_llm::LlmClient for FailingMidStream {
        async fn generate(
            &self,
            _req: GenerateRequest,
        ) -> Result<BoxStream<'static, Result<GenerateChunk>>> {
            let stream = async_stream::stream! {
                yield Ok(GenerateChunk::Text("[]✂️🐱partial answer".into()));
                yield Err(Error::Transient("connection reset".into()));
            };
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn transport_error_preserves_partial_content() {
        let state = AppStateBuilder::new(Config::default())
            .llm(Arc::new(FailingMidStream))
            .build()
            .unwrap();
        let conv = state.conversations.create("alice", "chat");
        let (_, rx) = submit_user_message(state.clone(), conv.id, "x".into(), vec![]).unwrap();

        let events = drain(rx).await;
        assert!(events.iter().any(|e| matches!(e, TurnEvent::AssistantDelta { .. })));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        assert!(final_content(&events).is_none());

        let msgs = state.conversations.messages(&conv.id);
        assert!(msgs[1].content.contains("partial answer"));
        assert!(msgs[1].content.contains("⚠️"));
    }

    #[test]
    fn truncate_history_keeps_recent_window() {
        let conv = Uuid::new_v4();
        let msgs: Vec<Message> = (0..10)
            .map(|i| Message::new(conv, Role::User, format!("m{i}")))
            .collect();
        let kept = truncate_history(&msgs, 4, 2);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].content, "m6");
        assert_eq!(kept[3].content, "m9");

        // Preserved window floors the cap.
        let kept = truncate_history(&msgs, 0, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].content, "m7");

        // Short histories pass through.
        let kept = truncate_history(&msgs[..2], 10, 2);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn tool_instructions_quote_the_delimiter() {
        let state = state_with_responses(vec![]);
        let instructions = render_tool_instructions(state.dispatcher.registry());
        assert!(instructions.contains(TOOL_CALL_DELIMITER));
        assert!(instructions.contains("spawn_task"));
        // Disabled tools are not advertised.
        assert!(!instructions.contains("autoexec"));
    }
}
