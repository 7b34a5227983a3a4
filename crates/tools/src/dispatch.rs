//! Tool dispatch: validate, invoke, classify, retry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use butler_domain::error::{Error, Result};
use butler_domain::tool::ToolCallRequest;
use butler_executor::handler::SpawnSink;
use butler_executor::CancelToken;

use crate::registry::ToolRegistry;

/// Retries applied to `idempotent` tools on transient failure.
const MAX_TOOL_RETRIES: u32 = 2;
const RETRY_DELAY_MS: u64 = 100;

/// Context handed to every tool handler invocation.
pub struct ToolCtx {
    pub cancel: CancelToken,
    pub principal: String,
    pub conversation_id: Option<Uuid>,
    /// The task follow-up spawns attach under (the calling task, or the
    /// conversation-scoped parent for turn-driven calls).
    pub parent_task: Option<Uuid>,
    pub spawner: Arc<dyn SpawnSink>,
}

/// External collaborator seam: each integration (mail, calendar, files,
/// search, browser control, ...) implements `invoke`; the core never sees
/// its wire protocol.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, params: &Value, ctx: &ToolCtx) -> Result<Value>;
}

/// One dispatched call's outcome, ready to fold into a `ToolCallRecord`.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub call_id: String,
    pub tool_type: String,
    pub result: Result<Value>,
    pub duration_ms: u64,
    /// Declared `critical` tools fail the whole turn on error.
    pub critical: bool,
}

impl DispatchOutcome {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch one validated tool call.
    ///
    /// 1. Locate the tool; unknown or disabled tools are `Validation`.
    /// 2. Validate parameters against the registered schema.
    /// 3. Invoke with (parameters, cancellation token, principal context).
    /// 4. Idempotent tools retry transient failures; others never do.
    pub async fn dispatch(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> DispatchOutcome {
        let started = std::time::Instant::now();
        let result = self.dispatch_inner(call, ctx).await;
        let critical = self
            .registry
            .get(&call.tool_type)
            .map(|t| t.definition.capabilities.critical)
            .unwrap_or(false);
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            tracing::warn!(tool = %call.tool_type, call_id = %call.id, error = %e, "tool call failed");
        } else {
            tracing::debug!(tool = %call.tool_type, call_id = %call.id, duration_ms, "tool call ok");
        }
        DispatchOutcome {
            call_id: call.id.clone(),
            tool_type: call.tool_type.clone(),
            result,
            duration_ms,
            critical,
        }
    }

    async fn dispatch_inner(&self, call: &ToolCallRequest, ctx: &ToolCtx) -> Result<Value> {
        let tool = self
            .registry
            .get(&call.tool_type)
            .ok_or_else(|| Error::Validation(format!("unknown tool '{}'", call.tool_type)))?;
        if tool.definition.capabilities.disabled {
            return Err(Error::Validation(format!(
                "tool '{}' is disabled",
                call.tool_type
            )));
        }
        self.registry.validate(&call.tool_type, &call.parameters)?;

        let retries = if tool.definition.capabilities.idempotent {
            MAX_TOOL_RETRIES
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled("tool call cancelled".into()));
            }
            match tool.handler.invoke(&call.parameters, ctx).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(
                        tool = %call.tool_type,
                        attempt,
                        error = %e,
                        "retrying idempotent tool"
                    );
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt)))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
