//! Core task types for the agent loop.

use std::path::PathBuf;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::events::TaskEvent;
use super::task::WorkspaceContext;
use crate::models::ModelConfig;
use crate::types::Usage;

/// Request payload to start a task.
#[derive(Debug, Clone, Builder)]
pub struct TaskRequest {
    #[builder(into)]
    pub prompt: String,
    pub model: ModelConfig,
    /// Defaults to a fresh UUID.
    #[builder(into)]
    pub task_id: Option<String>,
    /// Defaults to a snippet of the prompt.
    #[builder(into)]
    pub title: Option<String>,
    /// Replaces the built-in system prompt.
    #[builder(into)]
    pub system_prompt: Option<String>,
    pub workspace: Option<WorkspaceContext>,
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Finished,
    Failed,
    Canceled,
}

/// Result of one run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    pub steps: usize,
    pub usage: Usage,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Finished
    }
}

/// Handle for one in-flight run of a task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    result_rx: oneshot::Receiver<RunResult>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn new(
        task_id: String,
        events: mpsc::UnboundedReceiver<TaskEvent>,
        result_rx: oneshot::Receiver<RunResult>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            events,
            result_rx,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event, or `None` once the run has ended and its events are drained.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Cancel this run.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end, discarding unread events.
    pub async fn wait(self) -> RunResult {
        let Self {
            task_id, result_rx, ..
        } = self;
        result_rx
            .await
            .unwrap_or_else(|_| run_dropped(&task_id))
    }

    /// Drain every event and return them with the result.
    pub async fn collect(mut self) -> (Vec<TaskEvent>, RunResult) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let task_id = self.task_id.clone();
        let result = self
            .result_rx
            .await
            .unwrap_or_else(|_| run_dropped(&task_id));
        (events, result)
    }
}

fn run_dropped(task_id: &str) -> RunResult {
    RunResult {
        status: TaskStatus::Canceled,
        text: None,
        error: Some(format!("run for task {task_id} ended without a result")),
        recoverable: true,
        remediation: None,
        artifacts: Vec::new(),
        steps: 0,
        usage: Usage::default(),
        finished_at: Utc::now(),
    }
}
