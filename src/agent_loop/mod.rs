//! Agent loop: tasks, runs, events and the controller that drives them.

mod engine;
pub mod events;
pub mod learning;
pub mod plan;
pub mod runner;
pub mod stop_gate;
pub mod task;
pub mod types;

pub use events::{TaskEvent, TaskEventPayload};
pub use learning::{LearnOutcome, NoopLearning, SelfLearning};
pub use plan::{FilePlanStore, PlanSnapshot, PlanStore};
pub use runner::{AgentController, ProviderFactory};
pub use stop_gate::{CompletionDetector, RegexCompletionDetector, RunActivity};
pub use task::{TaskContext, WorkspaceContext};
pub use types::{RunResult, TaskHandle, TaskRequest, TaskStatus};
