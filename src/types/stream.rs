//! Normalized streaming types shared by both wire formats.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::message::{Message, ToolInvocation};
use super::usage::Usage;

/// A normalized event produced by a provider stream parser.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// Incremental assistant text.
    Text(String),
    /// Incremental extended-thinking text.
    Thinking(String),
    /// Signature attached to the current thinking block.
    ThinkingSignature(String),
    /// A fully reconstructed tool invocation.
    ToolCall(ToolInvocation),
    /// Token usage counters (cumulative, as reported).
    Usage(Usage),
    /// The provider signalled the end of the message.
    Done { finish_reason: Option<FinishReason> },
    /// The turn is being requested again after a transport failure; output
    /// seen since the turn began is void.
    Restart { attempt: u32 },
}

/// Why generation finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// One fully collected assistant turn.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub message: Message,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}
