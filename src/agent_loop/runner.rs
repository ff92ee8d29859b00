//! Task controller: owns task contexts and starts runs against them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::engine::{run_task, RunChannels, RunDeps, RunInbox};
use super::learning::{NoopLearning, SelfLearning};
use super::plan::{FilePlanStore, PlanStore};
use super::stop_gate::{CompletionDetector, RegexCompletionDetector};
use super::task::TaskContext;
use super::types::{TaskHandle, TaskRequest};
use crate::config::StewardConfig;
use crate::error::{Result, StewardError};
use crate::guard::CorrectiveTable;
use crate::models::ModelConfig;
use crate::provider::{self, ModelProvider};
use crate::suspend::{Resolution, SuspendCoordinator, SuspendedTask};
use crate::tools::{AdaptiveRetry, ToolGateway, ToolRegistry};
use crate::util::retry::RetryPolicy;

/// Builds the model provider for a task.
pub type ProviderFactory =
    Arc<dyn Fn(&ModelConfig) -> Result<Arc<dyn ModelProvider>> + Send + Sync>;

struct RunControl {
    cancel: CancellationToken,
    cancel_reason: Arc<Mutex<Option<String>>>,
    inbox: Arc<RunInbox>,
}

struct TaskSlot {
    context: Arc<tokio::sync::Mutex<TaskContext>>,
    suspend: Arc<SuspendCoordinator>,
    provider: Arc<dyn ModelProvider>,
    plan_store: Option<Arc<dyn PlanStore>>,
    run: Option<RunControl>,
}

impl TaskSlot {
    fn active_run(&self) -> Option<&RunControl> {
        self.run.as_ref().filter(|run| run.inbox.is_open())
    }
}

/// Entry point for hosts: start tasks, talk to them, cancel and resume them.
///
/// Each task keeps its conversation between runs. A follow-up message to an
/// idle task starts a new run on the same context; one sent while a run is
/// active is queued and replayed into that run.
pub struct AgentController {
    config: StewardConfig,
    gateway: Arc<ToolGateway>,
    table: Arc<CorrectiveTable>,
    provider_factory: ProviderFactory,
    learning: Arc<dyn SelfLearning>,
    detector: Arc<dyn CompletionDetector>,
    plan_store: Option<Arc<dyn PlanStore>>,
    tasks: Mutex<HashMap<String, TaskSlot>>,
}

impl AgentController {
    pub fn new(config: StewardConfig, registry: Arc<ToolRegistry>) -> Result<Self> {
        let table = Arc::new(CorrectiveTable::with_specs(
            &config.agent.corrective_strategies,
        )?);
        let gateway = Arc::new(ToolGateway::from_settings(registry, &config.agent));
        let factory_config = config.clone();
        let provider_factory: ProviderFactory =
            Arc::new(move |model| provider::create_provider(model, &factory_config));
        Ok(Self {
            config,
            gateway,
            table,
            provider_factory,
            learning: Arc::new(NoopLearning),
            detector: Arc::new(RegexCompletionDetector::default()),
            plan_store: None,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn with_learning(mut self, learning: Arc<dyn SelfLearning>) -> Self {
        self.learning = learning;
        self
    }

    pub fn with_completion_detector(mut self, detector: Arc<dyn CompletionDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Use one plan store for every task instead of the workspace files.
    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    /// Replace the gateway's retry classifier.
    pub fn with_tool_retry(mut self, retry: Arc<dyn AdaptiveRetry>) -> Self {
        let gateway = ToolGateway::from_settings(self.gateway.registry().clone(), &self.config.agent)
            .with_retry(retry);
        self.gateway = Arc::new(gateway);
        self
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskSlot>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a task and start its first run.
    pub fn start(&self, request: TaskRequest) -> Result<TaskHandle> {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let provider = (self.provider_factory)(&request.model)?;

        let mut tasks = self.tasks();
        if tasks.contains_key(&task_id) {
            return Err(StewardError::InvalidState(format!(
                "task {task_id} already exists"
            )));
        }

        let mut context = TaskContext::new(
            task_id.clone(),
            &request.prompt,
            request.title,
            request.model,
            &self.config.agent,
            self.table.clone(),
        );
        context.system_prompt = request.system_prompt;
        let plan_store = self.plan_store.clone().or_else(|| {
            request.workspace.as_ref().map(|workspace| {
                Arc::new(FilePlanStore::new(workspace.path.clone())) as Arc<dyn PlanStore>
            })
        });
        context.workspace = request.workspace;
        if !context.contract.is_empty() {
            debug!(
                task_id = %task_id,
                expected = context.contract.expected().len(),
                "artifact contract inferred"
            );
        }

        let mut slot = TaskSlot {
            suspend: context.suspend.clone(),
            context: Arc::new(tokio::sync::Mutex::new(context)),
            provider,
            plan_store,
            run: None,
        };
        let handle = self.spawn_run(&task_id, &mut slot, Some(request.prompt));
        tasks.insert(task_id.clone(), slot);
        info!(task_id = %task_id, "task started");
        Ok(handle)
    }

    /// Deliver a user message. Returns a handle when a new run was started,
    /// or `None` when the message was queued into the active run.
    pub fn send_message(&self, task_id: &str, text: impl Into<String>) -> Result<Option<TaskHandle>> {
        let text = text.into();
        let mut tasks = self.tasks();
        let slot = tasks
            .get_mut(task_id)
            .ok_or_else(|| StewardError::InvalidArgument(format!("unknown task {task_id}")))?;

        let text = match slot.active_run() {
            Some(run) => match run.inbox.push(text) {
                Ok(()) => {
                    debug!(task_id, "message queued into active run");
                    return Ok(None);
                }
                Err(text) => text,
            },
            None => text,
        };
        Ok(Some(self.spawn_run(task_id, slot, Some(text))))
    }

    /// Cancel the active run. Returns whether a run was active.
    pub fn cancel(&self, task_id: &str, reason: impl Into<String>) -> Result<bool> {
        let tasks = self.tasks();
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| StewardError::InvalidArgument(format!("unknown task {task_id}")))?;
        let Some(run) = slot.active_run() else {
            return Ok(false);
        };
        let reason = reason.into();
        info!(task_id, %reason, "cancel requested");
        *run.cancel_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        run.cancel.cancel();
        Ok(true)
    }

    /// Resume a suspended task.
    pub fn resume(&self, task_id: &str, reason: impl Into<String>) -> Result<Resolution> {
        self.coordinator(task_id)?.resume(reason)
    }

    /// The task's current suspension, if any.
    pub fn suspension(&self, task_id: &str) -> Option<SuspendedTask> {
        self.coordinator(task_id).ok()?.suspension()
    }

    fn coordinator(&self, task_id: &str) -> Result<Arc<SuspendCoordinator>> {
        self.tasks()
            .get(task_id)
            .map(|slot| slot.suspend.clone())
            .ok_or_else(|| StewardError::InvalidArgument(format!("unknown task {task_id}")))
    }

    /// Drop the task's conversation. Not allowed while a run is active.
    pub async fn clear_history(&self, task_id: &str) -> Result<()> {
        let context = {
            let tasks = self.tasks();
            let slot = tasks
                .get(task_id)
                .ok_or_else(|| StewardError::InvalidArgument(format!("unknown task {task_id}")))?;
            if slot.active_run().is_some() {
                return Err(StewardError::InvalidState(format!(
                    "task {task_id} is running"
                )));
            }
            slot.context.clone()
        };
        context.lock().await.clear_history();
        Ok(())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tasks()
            .get(task_id)
            .is_some_and(|slot| slot.active_run().is_some())
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a task, cancelling whatever it is doing.
    pub fn remove(&self, task_id: &str) -> bool {
        let Some(slot) = self.tasks().remove(task_id) else {
            return false;
        };
        if let Some(run) = &slot.run {
            run.cancel.cancel();
        }
        slot.suspend.cancel("task removed");
        true
    }

    fn spawn_run(&self, task_id: &str, slot: &mut TaskSlot, input: Option<String>) -> TaskHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(RunInbox::default());
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let cancel_reason = Arc::new(Mutex::new(None));

        slot.run = Some(RunControl {
            cancel: cancel.clone(),
            cancel_reason: cancel_reason.clone(),
            inbox: inbox.clone(),
        });

        let deps = RunDeps {
            provider: slot.provider.clone(),
            gateway: self.gateway.clone(),
            settings: self.config.agent.clone(),
            retry: RetryPolicy::default()
                .with_max_attempts(self.config.agent.transport_max_attempts),
            learning: self.learning.clone(),
            detector: self.detector.clone(),
            plan_store: slot.plan_store.clone(),
        };
        let channels = RunChannels {
            events: event_tx,
            cancel: cancel.clone(),
            cancel_reason,
            inbox,
        };
        let context = slot.context.clone();
        tokio::spawn(async move {
            let result = run_task(context, input, deps, channels).await;
            // The handle may already be gone.
            let _ = result_tx.send(result);
        });

        TaskHandle::new(task_id.to_string(), event_rx, result_rx, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AgentController {
        AgentController::new(StewardConfig::default(), Arc::new(ToolRegistry::new())).unwrap()
    }

    #[tokio::test]
    async fn unknown_tasks_are_rejected() {
        let controller = controller();
        assert!(matches!(
            controller.send_message("nope", "hi"),
            Err(StewardError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.resume("nope", "manual"),
            Err(StewardError::InvalidArgument(_))
        ));
        assert!(controller.suspension("nope").is_none());
        assert!(!controller.remove("nope"));
        assert!(controller.task_ids().is_empty());
    }

    #[test]
    fn invalid_strategy_rows_fail_construction() {
        let mut config = StewardConfig::default();
        config.agent.corrective_strategies = vec![crate::guard::StrategySpec {
            name: "broken".into(),
            tool_pattern: "(".into(),
            args_pattern: None,
            action_tool: "noop".into(),
            action_args: serde_json::json!({}),
            completes_workflow: false,
        }];
        assert!(matches!(
            AgentController::new(config, Arc::new(ToolRegistry::new())),
            Err(StewardError::Configuration(_))
        ));
    }
}
