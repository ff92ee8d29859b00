//! Adaptive retry for flaky tool categories (browser, web, http).
//!
//! Unlike transport retry, a failed attempt may change the call itself: an
//! [`AlternativeApproach`] can rewrite the arguments before the next attempt.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StewardError;

/// The call being retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryStep<'a> {
    pub tool_name: &'a str,
    pub arguments: &'a Value,
}

/// Invokes the tool once with the given arguments.
pub type Invoke<'a> =
    &'a (dyn Fn(Value) -> BoxFuture<'static, Result<Value, StewardError>> + Send + Sync);

/// Result of an adaptive retry run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// The last failure looked transient; a later attempt may still succeed.
    pub should_retry: bool,
    pub attempts: u32,
}

#[async_trait]
pub trait AdaptiveRetry: Send + Sync {
    async fn execute_with_retry(&self, step: RetryStep<'_>, invoke: Invoke<'_>) -> RetryOutcome;
}

/// Rewrites a failed call's arguments for the next attempt.
pub trait AlternativeApproach: Send + Sync {
    fn name(&self) -> &str;

    fn adapt(&self, tool_name: &str, arguments: &Value, error: &str) -> Option<Value>;
}

/// Drop a CSS selector in favour of visible-text matching when the element
/// could not be found.
pub struct TextInsteadOfSelector;

impl AlternativeApproach for TextInsteadOfSelector {
    fn name(&self) -> &str {
        "text-instead-of-selector"
    }

    fn adapt(&self, _tool_name: &str, arguments: &Value, error: &str) -> Option<Value> {
        let lowered = error.to_ascii_lowercase();
        let not_found = ["not found", "no element", "no such element", "not visible"]
            .iter()
            .any(|needle| lowered.contains(needle));
        let obj = arguments.as_object()?;
        if !not_found || !obj.contains_key("selector") || !obj.contains_key("text") {
            return None;
        }
        let mut adapted = obj.clone();
        adapted.remove("selector");
        Some(Value::Object(adapted))
    }
}

/// Double an explicit `timeout_ms` argument after a timeout.
pub struct LongerTimeout;

impl AlternativeApproach for LongerTimeout {
    fn name(&self) -> &str {
        "longer-timeout"
    }

    fn adapt(&self, _tool_name: &str, arguments: &Value, error: &str) -> Option<Value> {
        if !error.to_ascii_lowercase().contains("timeout")
            && !error.to_ascii_lowercase().contains("timed out")
        {
            return None;
        }
        let current = arguments.get("timeout_ms")?.as_u64()?;
        let mut adapted = arguments.clone();
        adapted["timeout_ms"] = Value::from(current.saturating_mul(2));
        Some(adapted)
    }
}

/// Default adaptive retry: bounded attempts with exponential backoff, trying
/// alternative approaches between attempts.
pub struct BackoffRetry {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    alternatives: Vec<Box<dyn AlternativeApproach>>,
}

impl Default for BackoffRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            alternatives: vec![Box::new(TextInsteadOfSelector), Box::new(LongerTimeout)],
        }
    }
}

impl BackoffRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_alternative(mut self, alternative: Box<dyn AlternativeApproach>) -> Self {
        self.alternatives.push(alternative);
        self
    }
}

#[async_trait]
impl AdaptiveRetry for BackoffRetry {
    async fn execute_with_retry(&self, step: RetryStep<'_>, invoke: Invoke<'_>) -> RetryOutcome {
        let mut arguments = step.arguments.clone();
        let mut backoff = self.initial_backoff;
        let mut last_error: Option<StewardError> = None;
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            match invoke(arguments.clone()).await {
                Ok(output) => {
                    if attempts > 1 {
                        debug!(tool = step.tool_name, attempts, "tool succeeded after retry");
                    }
                    return RetryOutcome {
                        success: true,
                        output: Some(output),
                        error: None,
                        should_retry: false,
                        attempts,
                    };
                }
                Err(err) => {
                    // Bad arguments or a cancelled run will not improve with time.
                    if matches!(err, StewardError::InvalidArgument(_) | StewardError::Canceled(_)) {
                        last_error = Some(err);
                        break;
                    }
                    let message = err.to_string();
                    if let Some((name, adapted)) = self
                        .alternatives
                        .iter()
                        .find_map(|alt| alt.adapt(step.tool_name, &arguments, &message).map(|a| (alt.name(), a)))
                    {
                        debug!(tool = step.tool_name, approach = name, "switching to alternative approach");
                        arguments = adapted;
                    }
                    last_error = Some(err);
                }
            }
            if attempts < self.max_attempts {
                warn!(
                    tool = step.tool_name,
                    attempt = attempts,
                    delay_ms = backoff.as_millis() as u64,
                    "retrying tool call"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.max_backoff);
            }
        }

        let should_retry = last_error.as_ref().is_some_and(|e| {
            e.is_retryable() || matches!(e, StewardError::ToolExecution { .. })
        });
        RetryOutcome {
            success: false,
            output: None,
            error: Some(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "tool was not attempted".into()),
            ),
            should_retry,
            attempts,
        }
    }
}
