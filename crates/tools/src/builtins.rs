//! Built-in tools every deployment registers.

use std::sync::Arc;

use serde_json::{json, Value};

use butler_domain::error::{Error, Result};
use butler_domain::tool::{ToolCapabilities, ToolDefinition};

use crate::dispatch::{ToolCtx, ToolHandler};
use crate::registry::ToolRegistryBuilder;

/// `spawn_task` — the LLM's handle on the task engine. The handler only
/// echoes a spawn marker; the turn driver interprets it and creates the
/// subtask under the conversation-scoped parent.
pub struct SpawnTaskTool;

#[async_trait::async_trait]
impl ToolHandler for SpawnTaskTool {
    async fn invoke(&self, params: &Value, _ctx: &ToolCtx) -> Result<Value> {
        Ok(json!({ "spawn_task": params }))
    }
}

/// `autoexec` — local command execution. Registered disabled; dispatch
/// rejects it before this handler can run. The rejection also guards a
/// registry that was built without the disabled flag by mistake.
pub struct AutoexecTool;

#[async_trait::async_trait]
impl ToolHandler for AutoexecTool {
    async fn invoke(&self, _params: &Value, _ctx: &ToolCtx) -> Result<Value> {
        Err(Error::Validation("autoexec is not available".into()))
    }
}

fn spawn_task_definition() -> ToolDefinition {
    ToolDefinition {
        name: "spawn_task".into(),
        description: "Create a background task. The task runs asynchronously; \
                      its result is reported back into the conversation."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Short task title" },
                "kind": {
                    "type": "string",
                    "enum": ["research", "action", "analysis", "synthesis",
                             "fetch", "transform", "validate", "notify"],
                    "description": "Task kind"
                },
                "description": { "type": "string", "description": "What to do" },
                "priority": { "type": "integer", "minimum": 0, "maximum": 100 },
                "input": { "type": "object", "description": "Structured task input" }
            },
            "required": ["title", "kind"]
        }),
        capabilities: ToolCapabilities { side_effecting: true, ..Default::default() },
    }
}

fn autoexec_definition() -> ToolDefinition {
    ToolDefinition {
        name: "autoexec".into(),
        description: "Execute a local command.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" }
            },
            "required": ["command"]
        }),
        capabilities: ToolCapabilities {
            side_effecting: true,
            disabled: true,
            ..Default::default()
        },
    }
}

/// Registry builder pre-loaded with the built-in tools. Integrations add
/// their own tools before `build()`.
pub fn builtin_registry() -> Result<ToolRegistryBuilder> {
    ToolRegistryBuilder::new()
        .register(spawn_task_definition(), Arc::new(SpawnTaskTool))?
        .register(autoexec_definition(), Arc::new(AutoexecTool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use butler_domain::task::{ExecutionMode, TaskSpec};
    use butler_domain::tool::ToolCallRequest;
    use butler_executor::handler::SpawnSink;
    use butler_executor::CancelToken;
    use uuid::Uuid;

    struct NullSpawner;

    impl SpawnSink for NullSpawner {
        fn spawn(
            &self,
            _parent_id: Uuid,
            _specs: Vec<TaskSpec>,
            _mode: ExecutionMode,
        ) -> Result<Vec<Uuid>> {
            Ok(Vec::new())
        }
    }

    fn ctx() -> ToolCtx {
        ToolCtx {
            cancel: CancelToken::new(),
            principal: "tester".into(),
            conversation_id: None,
            parent_task: None,
            spawner: Arc::new(NullSpawner),
        }
    }

    #[tokio::test]
    async fn spawn_task_echoes_marker() {
        let dispatcher = Dispatcher::new(builtin_registry().unwrap().build());
        let call = ToolCallRequest {
            id: "c1".into(),
            tool_type: "spawn_task".into(),
            parameters: json!({"title": "dig deeper", "kind": "research"}),
        };
        let out = dispatcher.dispatch(&call, &ctx()).await;
        let value = out.result.unwrap();
        assert_eq!(value["spawn_task"]["title"], "dig deeper");
    }

    #[tokio::test]
    async fn spawn_task_validates_kind() {
        let dispatcher = Dispatcher::new(builtin_registry().unwrap().build());
        let call = ToolCallRequest {
            id: "c1".into(),
            tool_type: "spawn_task".into(),
            parameters: json!({"title": "x", "kind": "daydream"}),
        };
        let out = dispatcher.dispatch(&call, &ctx()).await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn autoexec_is_disabled_by_default() {
        let registry = builtin_registry().unwrap().build();
        // Not advertised to the LLM...
        assert!(registry.definitions().iter().all(|d| d.name != "autoexec"));
        // ...and dispatch refuses it.
        let dispatcher = Dispatcher::new(registry);
        let call = ToolCallRequest {
            id: "c1".into(),
            tool_type: "autoexec".into(),
            parameters: json!({"command": "ls"}),
        };
        let out = dispatcher.dispatch(&call, &ctx()).await;
        assert!(matches!(out.result, Err(Error::Validation(_))));
    }
}
