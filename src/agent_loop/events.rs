//! Task event stream types.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::suspend::SuspendNotice;
use crate::types::{StreamDelta, Usage};

/// Concrete event payloads emitted while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventPayload {
    Started {
        title: String,
    },
    Finished {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<PathBuf>,
    },
    Failed {
        error: String,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remediation: Option<String>,
    },
    Status {
        message: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    /// The model response is being requested again; text and thinking deltas
    /// received since the step began should be discarded.
    StreamRestarted {
        attempt: u32,
    },
    Suspended {
        notice: SuspendNotice,
    },
    Resumed {
        reason: String,
        elapsed_ms: u64,
    },
    Usage {
        usage: Usage,
    },
}

impl TaskEventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// Envelope for one task event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub task_id: String,
    /// Per-task, strictly increasing across runs.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: TaskEventPayload,
}

/// Stamps payloads with the task's next sequence number and sends them on
/// the run's channel.
#[derive(Clone)]
pub(crate) struct TaskEventEmitter {
    task_id: String,
    seq: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskEventEmitter {
    pub(crate) fn new(task_id: String, seq: Arc<AtomicU64>, tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        Self { task_id, seq, tx }
    }

    pub(crate) fn emit(&self, payload: TaskEventPayload) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = TaskEvent {
            task_id: self.task_id.clone(),
            seq,
            timestamp: Utc::now(),
            payload,
        };
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub(crate) fn status(&self, message: impl Into<String>) {
        self.emit(TaskEventPayload::Status {
            message: message.into(),
        });
    }

    /// Forward streaming deltas that observers care about.
    pub(crate) fn forward_delta(&self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Text(text) if !text.is_empty() => {
                self.emit(TaskEventPayload::TextDelta { text: text.clone() })
            }
            StreamDelta::Thinking(text) if !text.is_empty() => {
                self.emit(TaskEventPayload::ThinkingDelta { text: text.clone() })
            }
            StreamDelta::Usage(usage) => self.emit(TaskEventPayload::Usage {
                usage: usage.clone(),
            }),
            StreamDelta::Restart { attempt } => {
                self.emit(TaskEventPayload::StreamRestarted { attempt: *attempt })
            }
            _ => {}
        }
    }
}
