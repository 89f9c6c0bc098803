use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use ckit_core::errors::ExecutionError;
use ckit_core::schema::CompiledSchema;

use crate::error::EngineError;
use crate::tool::{Tool, ToolDefinition};

/// A tool together with its compiled parameter schema.
pub struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: CompiledSchema,
}

impl RegisteredTool {
    pub fn tool(&self) -> &Arc<dyn Tool> {
        &self.tool
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    /// Check params against the compiled schema, listing every offending path.
    pub fn validate(&self, params: &Value) -> Result<(), ExecutionError> {
        let issues = self.schema.check(params);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Validation {
                tool: self.tool.name().to_string(),
                issues,
            })
        }
    }
}

/// Collects tools at startup. Schemas compile here, once.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, EngineError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(EngineError::DuplicateTool(name));
        }
        let schema =
            CompiledSchema::compile(&tool.parameters_schema()).map_err(|source| {
                EngineError::Schema {
                    tool: name.clone(),
                    source,
                }
            })?;
        self.tools.insert(name, RegisteredTool { tool, schema });
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Immutable name → tool mapping, shared read-only by every request.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}
