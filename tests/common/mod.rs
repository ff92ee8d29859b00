//! Shared test helpers: a scripted provider and recording tools.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use steward::agent_loop::{
    AgentController, LearnOutcome, PlanSnapshot, PlanStore, SelfLearning, TaskEvent,
    TaskEventPayload,
};
use steward::config::StewardConfig;
use steward::error::StewardError;
use steward::models::{ModelConfig, ProviderKind};
use steward::provider::{DeltaStream, ModelProvider, ProviderRequest};
use steward::tools::{FnTool, Tool, ToolRegistry, ToolSchema, ToolSource};
use steward::types::*;

/// A provider that replays queued turns and records every request.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamDelta>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    holds: Mutex<HashMap<usize, Arc<Notify>>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a final text answer.
    pub fn queue_text(&self, text: &str) {
        self.turns.lock().unwrap().push_back(vec![
            StreamDelta::Text(text.to_string()),
            StreamDelta::Usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            }),
            StreamDelta::Done {
                finish_reason: Some(FinishReason::Stop),
            },
        ]);
    }

    /// Queue a turn made of tool calls.
    pub fn queue_tool_calls(&self, calls: &[(&str, &str, Value)]) {
        let mut deltas: Vec<StreamDelta> = calls
            .iter()
            .map(|(id, name, args)| StreamDelta::ToolCall(ToolInvocation::new(*id, *name, args.clone())))
            .collect();
        deltas.push(StreamDelta::Done {
            finish_reason: Some(FinishReason::ToolCalls),
        });
        self.turns.lock().unwrap().push_back(deltas);
    }

    pub fn queue_tool_call(&self, id: &str, name: &str, args: Value) {
        self.queue_tool_calls(&[(id, name, args)]);
    }

    /// Make request `n` (zero-based) wait until the returned gate is notified.
    pub fn hold_request(&self, n: usize) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds.lock().unwrap().insert(n, gate.clone());
        gate
    }

    /// Yield until at least `n` requests have been made.
    pub async fn wait_for_requests(&self, n: usize) {
        while self.request_count() < n {
            tokio::task::yield_now().await;
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Text of the last user message of request `n`.
    pub fn last_user_text(&self, n: usize) -> String {
        let requests = self.requests.lock().unwrap();
        requests[n]
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn stream_turn(&self, request: &ProviderRequest) -> Result<DeltaStream, StewardError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        let hold = self.holds.lock().unwrap().remove(&index);
        if let Some(gate) = hold {
            gate.notified().await;
        }
        let deltas = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![
                StreamDelta::Text("Nothing left to do.".into()),
                StreamDelta::Done {
                    finish_reason: Some(FinishReason::Stop),
                },
            ]
        });
        Ok(Box::pin(futures::stream::iter(deltas.into_iter().map(Ok))))
    }
}

/// Remembers every failure it was told about.
#[derive(Default)]
pub struct RecordingLearner {
    reports: Mutex<Vec<(String, String, u32)>>,
    reported: Notify,
}

impl RecordingLearner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the first report; learning runs detached from the task.
    pub async fn first_report(&self) -> (String, String, u32) {
        loop {
            let notified = self.reported.notified();
            if let Some(report) = self.reports.lock().unwrap().first().cloned() {
                return report;
            }
            notified.await;
        }
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl SelfLearning for RecordingLearner {
    async fn quick_learn_from_error(
        &self,
        message: &str,
        original_query: &str,
        attempts: u32,
    ) -> Result<LearnOutcome, StewardError> {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_string(), original_query.to_string(), attempts));
        self.reported.notify_waiters();
        Ok(LearnOutcome { learned: true })
    }
}

/// Serves a plan whose text names how often it was loaded.
#[derive(Default)]
pub struct CountingPlanStore {
    loads: Mutex<usize>,
}

impl CountingPlanStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads(&self) -> usize {
        *self.loads.lock().unwrap()
    }
}

#[async_trait]
impl PlanStore for CountingPlanStore {
    async fn load(&self) -> Result<PlanSnapshot, StewardError> {
        let mut loads = self.loads.lock().unwrap();
        *loads += 1;
        Ok(PlanSnapshot {
            plan: Some(format!("plan revision {loads}")),
            ..Default::default()
        })
    }
}

/// A tool that always fails with `message`.
pub fn failing_tool(name: &str, message: &str) -> Arc<dyn Tool> {
    let tool_name = name.to_string();
    let message = message.to_string();
    Arc::new(FnTool::new(name, "always fails", ToolSchema::empty(), move |_args, _ctx| {
        let err = StewardError::ToolExecution {
            tool_name: tool_name.clone(),
            message: message.clone(),
        };
        async move { Err(err) }
    }))
}

/// Records every execution of the tools built from it.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<(String, Value)>>,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, tool_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool_name)
            .count()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// A tool that logs its call and returns `result`.
pub fn recording_tool(name: &str, log: &Arc<CallLog>, result: Value) -> Arc<dyn Tool> {
    let log = log.clone();
    let tool_name = name.to_string();
    Arc::new(FnTool::new(
        name,
        format!("test tool {name}"),
        ToolSchema::empty(),
        move |args, _ctx| {
            let log = log.clone();
            let tool_name = tool_name.clone();
            let result = result.clone();
            async move {
                log.calls
                    .lock()
                    .unwrap()
                    .push((tool_name, args.into_inner()));
                Ok(result)
            }
        },
    ))
}

/// A tool that sleeps for `secs` before answering.
pub fn slow_tool(name: &str, secs: u64) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(name, "sleeps", ToolSchema::empty(), move |_args, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(json!({"done": true}))
    }))
}

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register_all(ToolSource::External, tools);
    registry
}

pub fn model() -> ModelConfig {
    ModelConfig::new(ProviderKind::Anthropic, "scripted-model")
}

pub fn controller(provider: Arc<ScriptedProvider>, registry: Arc<ToolRegistry>) -> AgentController {
    controller_with_config(provider, registry, StewardConfig::default())
}

pub fn controller_with_config(
    provider: Arc<ScriptedProvider>,
    registry: Arc<ToolRegistry>,
    config: StewardConfig,
) -> AgentController {
    AgentController::new(config, registry)
        .unwrap()
        .with_provider_factory(Arc::new(move |_| Ok(provider.clone() as Arc<dyn ModelProvider>)))
}

pub fn payload_kinds(events: &[TaskEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match &event.payload {
            TaskEventPayload::Started { .. } => "started",
            TaskEventPayload::Finished { .. } => "finished",
            TaskEventPayload::Failed { .. } => "failed",
            TaskEventPayload::Status { .. } => "status",
            TaskEventPayload::ToolCall { .. } => "tool_call",
            TaskEventPayload::ToolResult { .. } => "tool_result",
            TaskEventPayload::TextDelta { .. } => "text_delta",
            TaskEventPayload::ThinkingDelta { .. } => "thinking_delta",
            TaskEventPayload::StreamRestarted { .. } => "stream_restarted",
            TaskEventPayload::Suspended { .. } => "suspended",
            TaskEventPayload::Resumed { .. } => "resumed",
            TaskEventPayload::Usage { .. } => "usage",
        })
        .collect()
}
