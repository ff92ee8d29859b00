//! Capability registry shared across tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use strum::Display;

use super::tool::Tool;
use crate::provider::ToolDefinition;

/// Where a tool came from. Higher variants win name collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ToolSource {
    /// Placeholder for a capability the host has not wired up.
    Stub,
    /// Local built-in.
    Builtin,
    /// External capability server.
    External,
}

/// Read-mostly map of tools by name, one entry per source.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Vec<(ToolSource, Arc<dyn Tool>)>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` from `source`, replacing an earlier tool with the same
    /// name from the same source.
    pub fn register(&self, source: ToolSource, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let entries = tools.entry(tool.name().to_string()).or_default();
        entries.retain(|(existing, _)| *existing != source);
        entries.push((source, tool));
        entries.sort_by(|a, b| b.0.cmp(&a.0));
    }

    pub fn register_all(&self, source: ToolSource, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.register(source, tool);
        }
    }

    /// Remove every tool a source registered (e.g. an external server went away).
    pub fn unregister_source(&self, source: ToolSource) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        for entries in tools.values_mut() {
            entries.retain(|(existing, _)| *existing != source);
        }
        tools.retain(|_, entries| !entries.is_empty());
    }

    /// Highest-priority tool registered under `name`.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.resolve(name).map(|(_, tool)| tool)
    }

    pub fn resolve(&self, name: &str) -> Option<(ToolSource, Arc<dyn Tool>)> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools
            .get(name)
            .and_then(|entries| entries.first())
            .map(|(source, tool)| (*source, tool.clone()))
    }

    /// One tool per name (highest priority), sorted by name.
    pub fn all_tools(&self) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Arc<dyn Tool>> = tools
            .values()
            .filter_map(|entries| entries.first().map(|(_, tool)| tool.clone()))
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// Catalogue sent to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.all_tools()
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema().schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.all_tools().iter().map(|t| t.name().to_string()).collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::ToolSchema;
    use crate::tools::tool::FnTool;
    use serde_json::json;

    fn named(name: &str, marker: &'static str) -> Arc<dyn Tool> {
        Arc::new(FnTool::new(name, marker, ToolSchema::empty(), move |_, _| async move {
            Ok(json!(marker))
        }))
    }

    #[test]
    fn external_beats_builtin_beats_stub() {
        let registry = ToolRegistry::new();
        registry.register(ToolSource::Stub, named("browser_open", "stub"));
        registry.register(ToolSource::Builtin, named("browser_open", "builtin"));
        assert_eq!(registry.get_tool("browser_open").unwrap().description(), "builtin");

        registry.register(ToolSource::External, named("browser_open", "external"));
        let (source, tool) = registry.resolve("browser_open").unwrap();
        assert_eq!(source, ToolSource::External);
        assert_eq!(tool.description(), "external");

        registry.unregister_source(ToolSource::External);
        assert_eq!(registry.get_tool("browser_open").unwrap().description(), "builtin");
        assert_eq!(registry.all_tools().len(), 1);
        assert!(registry.get_tool("missing").is_none());
    }
}
