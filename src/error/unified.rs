//! Error classification and recovery hints.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Stream,
    Api,
    Configuration,
    Serialization,
    ToolExecution,
    Loop,
    Canceled,
    Unknown,
}

/// Suggested recovery action, surfaced to the user with terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    CheckCredentials,
    CheckConfiguration,
    IncreaseTimeout,
    CheckToolImplementation,
    RephraseRequest,
    ContactSupport,
    None,
}

impl RecoverySuggestion {
    /// Human-readable remediation text, if any.
    pub fn remediation(self) -> Option<&'static str> {
        match self {
            Self::RetryWithBackoff => {
                Some("The model service is unreachable or overloaded. Try again in a moment.")
            }
            Self::CheckCredentials => Some("Check the API key configured for this provider."),
            Self::CheckConfiguration => Some("Check the model and provider configuration."),
            Self::IncreaseTimeout => Some(
                "The model stopped responding. Retry, or raise the stream inactivity timeout.",
            ),
            Self::CheckToolImplementation => Some("A tool failed repeatedly; check its setup."),
            Self::RephraseRequest => Some(
                "The agent got stuck repeating the same action. Rephrase the request or finish the step manually.",
            ),
            Self::ContactSupport => Some("An unexpected error occurred."),
            Self::None => None,
        }
    }
}
