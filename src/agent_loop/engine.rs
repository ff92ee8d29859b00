//! One run of a task: the step loop behind [`AgentController`](super::AgentController).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{TaskEventEmitter, TaskEventPayload};
use super::learning::{spawn_learn, SelfLearning};
use super::plan::PlanStore;
use super::stop_gate::{CompletionDetector, RunActivity, StopGate, VERIFICATION_PROMPT};
use super::task::TaskContext;
use super::types::{RunResult, TaskStatus};
use crate::config::AgentSettings;
use crate::contract::{evaluate, Evidence};
use crate::error::{ErrorCategory, StewardError};
use crate::guard::GuardDecision;
use crate::provider::{complete_turn, ModelProvider, ProviderRequest};
use crate::suspend::{
    detect_suspension, RequestedCondition, Resolution, ResumeCondition, SuspendRequest,
    ToolProbePredicate,
};
use crate::tools::{ToolContext, ToolGateway, ToolOutcome};
use crate::types::{Message, StreamDelta, ToolInvocation, ToolResultBlock};
use crate::util::retry::RetryPolicy;

pub(crate) const DEFAULT_SYSTEM_PROMPT: &str = "You are Steward, an autonomous assistant \
working on the user's computer. Use the available tools to carry out the request step by step. \
Prefer acting over describing. When a deliverable is requested, produce it in the requested \
format and save it to disk. When you are finished, reply with a short summary and no tool calls.";

/// Shared collaborators a run needs.
#[derive(Clone)]
pub(crate) struct RunDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub gateway: Arc<ToolGateway>,
    pub settings: AgentSettings,
    pub retry: RetryPolicy,
    pub learning: Arc<dyn SelfLearning>,
    pub detector: Arc<dyn CompletionDetector>,
    pub plan_store: Option<Arc<dyn PlanStore>>,
}

/// Per-run signalling between the controller and the loop.
pub(crate) struct RunChannels {
    pub events: mpsc::UnboundedSender<super::events::TaskEvent>,
    pub cancel: CancellationToken,
    pub cancel_reason: Arc<Mutex<Option<String>>>,
    pub inbox: Arc<RunInbox>,
}

/// User messages waiting for a live run.
///
/// The run closes the inbox under the same lock it uses for its last
/// emptiness check, so a message is either replayed by this run or refused
/// (and the caller starts a new one). An open inbox means the run is live.
#[derive(Default)]
pub(crate) struct RunInbox {
    state: Mutex<InboxState>,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<String>,
    closed: bool,
}

impl RunInbox {
    fn state(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `text`, or hand it back when the run no longer takes input.
    pub fn push(&self, text: String) -> Result<(), String> {
        let mut state = self.state();
        if state.closed {
            return Err(text);
        }
        state.queue.push_back(text);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.state().closed
    }

    fn take(&self) -> Vec<String> {
        self.state().queue.drain(..).collect()
    }

    /// Close unless messages are waiting; those are returned instead and the
    /// inbox stays open.
    fn close_if_empty(&self) -> Vec<String> {
        let mut state = self.state();
        if state.queue.is_empty() {
            state.closed = true;
        }
        state.queue.drain(..).collect()
    }

    fn close(&self) -> Vec<String> {
        let mut state = self.state();
        state.closed = true;
        state.queue.drain(..).collect()
    }
}

enum Stop {
    Finished {
        text: String,
    },
    Failed {
        error: String,
        recoverable: bool,
        remediation: Option<String>,
    },
    Canceled {
        reason: String,
    },
}

impl Stop {
    fn from_error(err: &StewardError) -> Self {
        if err.category() == ErrorCategory::Canceled {
            return Self::Canceled {
                reason: err.to_string(),
            };
        }
        Self::Failed {
            error: err.to_string(),
            recoverable: err.category() != ErrorCategory::Loop,
            remediation: err.recovery_suggestion().remediation().map(String::from),
        }
    }
}

/// Drive one run to its end and report the result.
///
/// The task context stays locked for the whole run, so runs of one task
/// never overlap.
pub(crate) async fn run_task(
    context: Arc<tokio::sync::Mutex<TaskContext>>,
    input: Option<String>,
    deps: RunDeps,
    channels: RunChannels,
) -> RunResult {
    let mut task = context.lock().await;
    let emitter = TaskEventEmitter::new(task.id.clone(), task.seq.clone(), channels.events);
    let gate = StopGate::new(deps.detector.clone());
    let mut run = Run {
        task: &mut *task,
        deps,
        emitter,
        cancel: channels.cancel,
        cancel_reason: channels.cancel_reason,
        inbox: channels.inbox,
        gate,
        activity: RunActivity::default(),
        steps: 0,
    };
    let stop = run.drive(input).await;
    run.finish(stop)
}

struct Run<'a> {
    task: &'a mut TaskContext,
    deps: RunDeps,
    emitter: TaskEventEmitter,
    cancel: CancellationToken,
    cancel_reason: Arc<Mutex<Option<String>>>,
    inbox: Arc<RunInbox>,
    gate: StopGate,
    activity: RunActivity,
    steps: usize,
}

impl Run<'_> {
    async fn drive(&mut self, input: Option<String>) -> Stop {
        info!(task_id = %self.task.id, model = %self.task.model, "run started");
        self.emitter.emit(TaskEventPayload::Started {
            title: self.task.title.clone(),
        });
        if let Some(text) = input {
            self.push_user(text);
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.canceled();
            }
            self.drain_inbox();

            if self.steps >= self.deps.settings.max_steps {
                return Stop::Failed {
                    error: format!("step limit of {} reached", self.deps.settings.max_steps),
                    recoverable: true,
                    remediation: Some(
                        "Send a follow-up message to continue, or raise max_steps.".into(),
                    ),
                };
            }
            self.steps += 1;
            self.refresh_plan().await;

            let request = self.build_request();
            debug!(
                task_id = %self.task.id,
                step = self.steps,
                messages = request.messages.len(),
                "calling model"
            );
            let emitter = self.emitter.clone();
            let observer = move |delta: &StreamDelta| emitter.forward_delta(delta);
            let turn = tokio::select! {
                _ = self.cancel.cancelled() => None,
                turn = complete_turn(
                    self.deps.provider.as_ref(),
                    &request,
                    &self.deps.retry,
                    &observer,
                ) => Some(turn),
            };
            let turn = match turn {
                None => return self.canceled(),
                Some(Err(err)) => return Stop::from_error(&err),
                Some(Ok(turn)) => turn,
            };
            self.task.usage.merge(&turn.usage);

            let calls: Vec<ToolInvocation> =
                turn.message.tool_invocations().into_iter().cloned().collect();
            let text = turn.message.text();
            if !turn.message.content.is_empty() {
                self.task.store.append(turn.message);
            }

            if calls.is_empty() {
                if self.gate.request_verification(&text, &self.activity) {
                    info!(task_id = %self.task.id, "completion claimed without evidence; requesting verification");
                    self.emitter.status("Verifying the result before finishing");
                    self.push_user(VERIFICATION_PROMPT.to_string());
                    continue;
                }
                // Input that raced with the final turn gets an answer first.
                let late = self.inbox.close_if_empty();
                if !late.is_empty() {
                    self.replay(late);
                    continue;
                }
                return self.check_contract(text);
            }

            if let Err(stop) = self.run_tools(calls).await {
                return stop;
            }
        }
    }

    fn finish(&mut self, stop: Stop) -> RunResult {
        let unanswered = self.inbox.close();
        self.replay(unanswered);
        self.task.suspend.cancel("run ended");

        let artifacts: Vec<_> = self.task.artifacts.iter().cloned().collect();
        let (status, text, error, recoverable, remediation) = match stop {
            Stop::Finished { text } => {
                self.emitter.emit(TaskEventPayload::Finished {
                    text: text.clone(),
                    artifacts: artifacts.clone(),
                });
                (TaskStatus::Finished, Some(text), None, false, None)
            }
            Stop::Failed {
                error,
                recoverable,
                remediation,
            } => {
                self.emitter.emit(TaskEventPayload::Failed {
                    error: error.clone(),
                    recoverable,
                    remediation: remediation.clone(),
                });
                (TaskStatus::Failed, None, Some(error), recoverable, remediation)
            }
            Stop::Canceled { reason } => {
                let error = format!("Task canceled: {reason}");
                self.emitter.emit(TaskEventPayload::Failed {
                    error: error.clone(),
                    recoverable: true,
                    remediation: None,
                });
                (TaskStatus::Canceled, None, Some(error), true, None)
            }
        };
        info!(task_id = %self.task.id, ?status, steps = self.steps, "run ended");

        RunResult {
            status,
            text,
            error,
            recoverable,
            remediation,
            artifacts,
            steps: self.steps,
            usage: self.task.usage.clone(),
            finished_at: Utc::now(),
        }
    }

    fn canceled(&self) -> Stop {
        let reason = self
            .cancel_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "canceled by caller".into());
        Stop::Canceled { reason }
    }

    fn push_user(&mut self, text: String) {
        if self
            .task
            .note_user_text(&text, &self.deps.settings.downgrade_token)
        {
            info!(task_id = %self.task.id, "user accepted degraded outputs");
        }
        self.task.store.append_user_text(text);
    }

    fn drain_inbox(&mut self) {
        let queued = self.inbox.take();
        self.replay(queued);
    }

    fn replay(&mut self, messages: Vec<String>) {
        if messages.is_empty() {
            return;
        }
        debug!(task_id = %self.task.id, count = messages.len(), "replayed queued user messages");
        for text in messages {
            self.push_user(text);
        }
    }

    async fn refresh_plan(&mut self) {
        let Some(store) = self.deps.plan_store.clone() else {
            return;
        };
        let total = self.task.tool_calls_total;
        let due = self
            .task
            .plan_loaded_at
            .map_or(true, |at| total >= at + self.deps.settings.plan_refresh_interval.max(1));
        if !due {
            return;
        }
        match store.load().await {
            Ok(snapshot) => {
                self.task.plan_context = (!snapshot.is_empty()).then(|| snapshot.render());
                debug!(task_id = %self.task.id, tool_calls = total, "plan context refreshed");
            }
            Err(err) => warn!(task_id = %self.task.id, error = %err, "failed to read plan files"),
        }
        self.task.plan_loaded_at = Some(total);
    }

    fn build_request(&self) -> ProviderRequest {
        let mut system = self
            .task
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        if let Some(workspace) = &self.task.workspace {
            system.push_str("\n\n");
            system.push_str(&workspace.render());
        }
        if let Some(plan) = &self.task.plan_context {
            system.push_str("\n\n");
            system.push_str(plan);
        }
        ProviderRequest {
            system: Some(system),
            messages: self.task.store.messages().to_vec(),
            tools: self.deps.gateway.registry().definitions(),
            model: self.task.model.clone(),
        }
    }

    fn tool_context(&self, call_id: &str) -> ToolContext {
        ToolContext {
            task_id: self.task.id.clone(),
            call_id: call_id.to_string(),
            workspace: self.task.workspace.as_ref().map(|w| w.path.clone()),
            cancel: self.cancel.clone(),
        }
    }

    /// Execute one assistant turn's calls and append exactly one result per call.
    async fn run_tools(&mut self, calls: Vec<ToolInvocation>) -> Result<(), Stop> {
        let mut results = Vec::with_capacity(calls.len());
        let mut stop: Option<Stop> = None;
        let mut suspend_request: Option<SuspendRequest> = None;

        for call in &calls {
            if stop.is_none() && self.cancel.is_cancelled() {
                stop = Some(self.canceled());
            }
            if stop.is_some() {
                results.push(ToolResultBlock::error(&call.id, "not executed: the task stopped"));
                continue;
            }

            if call.repaired {
                warn!(task_id = %self.task.id, tool = %call.name, "tool arguments were repaired");
            }
            self.emitter.emit(TaskEventPayload::ToolCall {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            });

            let outcome = match self.dispatch(call).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    results.push(ToolResultBlock::error(&call.id, err.to_string()));
                    stop = Some(Stop::from_error(&err));
                    continue;
                }
            };
            self.record_outcome(call, &outcome);
            self.emitter.emit(TaskEventPayload::ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                result: outcome.result.clone(),
                is_error: outcome.is_error,
            });
            if suspend_request.is_none() && !outcome.is_error {
                suspend_request = detect_suspension(&call.name, &outcome.result);
            }
            results.push(outcome.into_result_block(&call.id));
        }

        self.task.store.append(Message::tool_results(results));
        self.task.tool_calls_total += calls.len();

        if let Some(stop) = stop {
            return Err(stop);
        }
        if self.cancel.is_cancelled() {
            return Err(self.canceled());
        }
        match suspend_request {
            Some(request) => self.suspend(request).await,
            None => Ok(()),
        }
    }

    /// Route a call through the loop guard, then the gateway.
    async fn dispatch(&mut self, call: &ToolInvocation) -> Result<ToolOutcome, StewardError> {
        let ctx = self.tool_context(&call.id);
        match self.task.guard.check(call) {
            GuardDecision::Proceed => Ok(self.deps.gateway.execute(call, &ctx).await),
            GuardDecision::Intervene {
                action: Some(action),
                guidance,
            } => {
                self.emitter.status(guidance.clone());
                let substitute = action.to_invocation(call);
                let outcome = self.deps.gateway.execute(&substitute, &ctx).await;
                self.task.guard.record_correction(&action, !outcome.is_error);
                Ok(ToolOutcome {
                    result: json!({
                        "autopilot": {
                            "strategy": action.strategy,
                            "tool": action.tool_name,
                            "arguments": action.arguments,
                            "result": outcome.result,
                        },
                        "note": guidance,
                    }),
                    is_error: outcome.is_error,
                    artifact: outcome.artifact,
                })
            }
            GuardDecision::Intervene {
                action: None,
                guidance,
            } => {
                self.emitter.status(guidance.clone());
                Ok(ToolOutcome::error(guidance))
            }
            GuardDecision::Blocked { guidance, attempts } => {
                debug!(tool = %call.name, attempts, "blocked repeated call");
                Ok(ToolOutcome::error(guidance))
            }
            GuardDecision::CompletedGracefully { message } => {
                Ok(ToolOutcome::ok(json!({ "success": true, "message": message })))
            }
            GuardDecision::Terminate {
                tool_name,
                arguments,
            } => Err(StewardError::LoopTerminated {
                tool_name,
                arguments,
            }),
        }
    }

    fn record_outcome(&mut self, call: &ToolInvocation, outcome: &ToolOutcome) {
        self.activity.record(&call.name, outcome.is_error);
        self.task.tools_used.insert(call.name.clone());
        if let Some(path) = &outcome.artifact {
            self.task.artifacts.insert(path.clone());
        }

        if !outcome.is_error {
            self.task.tool_failures.remove(&call.name);
            return;
        }
        let failures = self.task.tool_failures.entry(call.name.clone()).or_insert(0);
        *failures += 1;
        let failures = *failures;
        debug!(tool = %call.name, failures, "tool call failed");
        if failures == self.deps.settings.tool_failure_threshold {
            warn!(tool = %call.name, failures, "tool keeps failing; notifying self-learning");
            spawn_learn(
                self.deps.learning.clone(),
                format!(
                    "{} failed {failures} times in a row: {}",
                    call.name,
                    outcome.error_message().unwrap_or("unknown error")
                ),
                self.task.original_request.clone(),
                failures,
            );
        }
    }

    fn resume_condition(&self, requested: RequestedCondition) -> ResumeCondition {
        match requested {
            RequestedCondition::Manual => ResumeCondition::Manual,
            RequestedCondition::Timeout { after_ms } => ResumeCondition::Timeout {
                after: std::time::Duration::from_millis(after_ms),
            },
            RequestedCondition::Poll {
                probe_tool,
                probe_args,
                interval_ms,
                max_wait_ms,
                expect,
            } => ResumeCondition::Poll {
                interval: std::time::Duration::from_millis(interval_ms.max(1)),
                max_wait: std::time::Duration::from_millis(max_wait_ms),
                predicate: Arc::new(ToolProbePredicate::new(
                    self.deps.gateway.clone(),
                    probe_tool,
                    probe_args,
                    self.tool_context("resume-probe"),
                    expect,
                )),
            },
        }
    }

    /// Park the run until the suspension resolves. The model is not called
    /// while suspended.
    async fn suspend(&mut self, request: SuspendRequest) -> Result<(), Stop> {
        let condition = self.resume_condition(request.condition);
        let coordinator = self.task.suspend.clone();
        let notice = match coordinator.suspend(
            request.reason,
            request.message.clone(),
            condition,
            request.metadata,
        ) {
            Ok(notice) => notice,
            Err(err) => {
                warn!(task_id = %self.task.id, error = %err, "suspension request ignored");
                return Ok(());
            }
        };
        self.emitter.emit(TaskEventPayload::Suspended { notice });

        let resolution = tokio::select! {
            _ = self.cancel.cancelled() => None,
            resolution = coordinator.wait() => Some(resolution),
        };
        match resolution {
            None => {
                coordinator.cancel("task canceled");
                Err(self.canceled())
            }
            Some(Err(err)) => Err(Stop::from_error(&err)),
            Some(Ok(Resolution::Cancelled { reason, .. })) => {
                info!(task_id = %self.task.id, %reason, "suspension cancelled");
                Err(Stop::Canceled { reason })
            }
            Some(Ok(Resolution::Resumed { reason, elapsed })) => {
                self.emitter.emit(TaskEventPayload::Resumed {
                    reason: reason.clone(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
                self.push_user(format!(
                    "[The task was paused for {}s waiting on the user ({}: {}). It resumed ({reason}). \
                     Re-check the current state before continuing.]",
                    elapsed.as_secs(),
                    request.reason,
                    request.message
                ));
                Ok(())
            }
        }
    }

    fn check_contract(&self, text: String) -> Stop {
        if self.task.contract.is_empty() {
            return Stop::Finished { text };
        }
        let evidence = Evidence {
            files: self.task.artifacts.iter().cloned().collect(),
            tools_used: self.task.tools_used.iter().cloned().collect(),
            output_text: text.clone(),
        };
        let evaluation = evaluate(&self.task.contract, &evidence, self.task.downgrade_accepted);
        if evaluation.passed {
            if !evaluation.degraded.is_empty() {
                info!(task_id = %self.task.id, degraded = evaluation.degraded.len(), "finished with accepted degraded outputs");
            }
            return Stop::Finished { text };
        }

        let reasons: Vec<&str> = evaluation.failed.iter().map(|f| f.reason.as_str()).collect();
        let error = format!(
            "The task did not produce the promised deliverables: {}",
            reasons.join("; ")
        );
        warn!(task_id = %self.task.id, %error, "artifact contract failed");
        spawn_learn(
            self.deps.learning.clone(),
            error.clone(),
            self.task.original_request.clone(),
            1,
        );
        Stop::Failed {
            error,
            recoverable: true,
            remediation: evaluation.remediation(&self.deps.settings.downgrade_token),
        }
    }
}
