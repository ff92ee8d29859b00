//! Steward: the agent execution loop of a desktop assistant.
//!
//! A task is driven by repeated model turns streamed from an Anthropic-style
//! or OpenAI-style endpoint. Tool calls go through a gateway with timeouts and
//! adaptive retry, a loop guard that breaks repeated identical calls, and a
//! suspend coordinator that parks the task while the user acts. Before a task
//! finishes, an artifact contract inferred from the request checks that the
//! promised deliverables exist.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use steward::prelude::*;
//!
//! # async fn example() -> steward::error::Result<()> {
//! let registry = Arc::new(ToolRegistry::new());
//! steward::tools::builtin::register_builtins(&registry);
//!
//! let controller = AgentController::new(StewardConfig::load(None)?, registry)?;
//! let model: ModelConfig = "anthropic:claude-sonnet-4-5".parse()?;
//! let handle = controller.start(
//!     TaskRequest::builder()
//!         .prompt("Summarise notes.txt into summary.md")
//!         .model(model)
//!         .build(),
//! )?;
//! let result = handle.wait().await;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod contract;
pub mod conversation;
pub mod error;
pub mod guard;
pub mod models;
pub mod prelude;
pub mod provider;
pub mod suspend;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
