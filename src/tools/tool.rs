//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::schema::ToolSchema;
use crate::error::StewardError;

/// Externally visible effects a tool may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SideEffect {
    FilesystemWrite,
    ProcessSpawn,
    NetworkEgress,
}

/// Context available during tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub task_id: String,
    pub call_id: String,
    /// Root against which relative paths resolve.
    pub workspace: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Resolve `path` against the workspace when it is relative.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        match &self.workspace {
            Some(root) if candidate.is_relative() => root.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }
}

/// Core tool trait. Implement to expose a capability to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schema(&self) -> &ToolSchema;

    fn side_effects(&self) -> &[SideEffect] {
        &[]
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, StewardError>;
}

type ToolHandler = dyn Fn(
        ToolArguments,
        ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, StewardError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct FnTool {
    name: String,
    description: String,
    schema: ToolSchema,
    side_effects: Vec<SideEffect>,
    handler: Arc<ToolHandler>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, StewardError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            side_effects: Vec::new(),
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn with_side_effects(mut self, effects: impl IntoIterator<Item = SideEffect>) -> Self {
        self.side_effects = effects.into_iter().collect();
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, StewardError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("side_effects", &self.side_effects)
            .finish()
    }
}
