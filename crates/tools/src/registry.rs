//! Immutable tool registry with compiled parameter schemas.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use butler_domain::error::{Error, Result};
use butler_domain::tool::ToolDefinition;

use crate::dispatch::ToolHandler;

pub(crate) struct RegisteredTool {
    pub definition: ToolDefinition,
    pub validator: jsonschema::Validator,
    pub handler: Arc<dyn ToolHandler>,
}

/// Build-time registry assembly. Duplicate names and invalid schemas are
/// rejected at registration, not at dispatch.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistryBuilder").finish_non_exhaustive()
    }
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        if self.tools.contains_key(&definition.name) {
            return Err(Error::Validation(format!(
                "tool '{}' registered twice",
                definition.name
            )));
        }
        let validator = jsonschema::validator_for(&definition.parameters).map_err(|e| {
            Error::Validation(format!("tool '{}' schema invalid: {e}", definition.name))
        })?;
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool { definition, validator, handler },
        );
        Ok(self)
    }

    /// Freeze the registry. No tools can be added afterwards.
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: Arc::new(self.tools) }
    }
}

/// Immutable after startup; shared freely between the parser, the turn
/// driver, and the dispatcher.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions exposed to the LLM. Disabled tools are omitted.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| !t.definition.capabilities.disabled)
            .map(|t| t.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered names (disabled included), used by display sanitation.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate parameters against the registered schema. Unknown tools
    /// and schema mismatches are `Error::Validation`.
    pub fn validate(&self, tool_type: &str, parameters: &Value) -> Result<()> {
        let tool = self
            .get(tool_type)
            .ok_or_else(|| Error::Validation(format!("unknown tool '{tool_type}'")))?;
        if let Err(e) = tool.validator.validate(parameters) {
            return Err(Error::Validation(format!(
                "tool '{tool_type}' parameters rejected: {e}"
            )));
        }
        Ok(())
    }
}
