//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgentController, RunResult, TaskEvent, TaskEventPayload, TaskHandle, TaskRequest, TaskStatus,
    WorkspaceContext,
};
pub use crate::config::{AgentSettings, StewardConfig};
pub use crate::error::{Result, StewardError};
pub use crate::models::{ModelConfig, ProviderKind};
pub use crate::provider::ModelProvider;
pub use crate::suspend::{Resolution, SuspendReason};
pub use crate::tools::{Tool, ToolArguments, ToolContext, ToolRegistry};
pub use crate::types::{Message, Role, Usage};
