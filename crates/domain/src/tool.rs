//! Tool definitions and capability flags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capability flags declared at registration time. The dispatcher and the
/// executor consult these; they are never mutated after startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    /// Safe to retry on transient failure.
    #[serde(default)]
    pub idempotent: bool,
    /// Mutates external state.
    #[serde(default)]
    pub side_effecting: bool,
    /// Returns a task handle instead of an inline result.
    #[serde(default)]
    pub long_running: bool,
    /// A dispatch error fails the whole turn.
    #[serde(default)]
    pub critical: bool,
    /// Registered but not invocable.
    #[serde(default)]
    pub disabled: bool,
}

/// Tool definition exposed to the LLM and used for parameter validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    #[serde(default)]
    pub capabilities: ToolCapabilities,
}

/// A request emitted by the LLM for a registered tool, before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_default_all_false() {
        let caps = ToolCapabilities::default();
        assert!(!caps.idempotent);
        assert!(!caps.side_effecting);
        assert!(!caps.long_running);
        assert!(!caps.critical);
        assert!(!caps.disabled);
    }

    #[test]
    fn definition_deserializes_without_capabilities() {
        let json = serde_json::json!({
            "name": "web_search",
            "description": "Search the web",
            "parameters": {"type": "object"},
        });
        let def: ToolDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.capabilities, ToolCapabilities::default());
    }

    #[test]
    fn call_request_uses_type_on_the_wire() {
        let req: ToolCallRequest = serde_json::from_str(
            r#"{"id":"t1","type":"web_search","parameters":{"q":"cats"}}"#,
        )
        .unwrap();
        assert_eq!(req.tool_type, "web_search");
        assert_eq!(req.parameters["q"], "cats");
        let back = serde_json::to_string(&req).unwrap();
        assert!(back.contains("\"type\":\"web_search\""));
    }
}
