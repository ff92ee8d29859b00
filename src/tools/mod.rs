//! Tool system: capability registry, execution gateway, adaptive retry.

pub mod arguments;
pub mod artifacts;
pub mod builtin;
pub mod gateway;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod tool;

pub use arguments::ToolArguments;
pub use gateway::{ToolGateway, ToolOutcome};
pub use registry::{ToolRegistry, ToolSource};
pub use retry::{AdaptiveRetry, BackoffRetry, RetryOutcome, RetryStep};
pub use schema::ToolSchema;
pub use tool::{FnTool, SideEffect, Tool, ToolContext};
