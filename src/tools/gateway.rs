//! Single entry point for executing model-requested tool calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::arguments::ToolArguments;
use super::artifacts::detect_artifact;
use super::registry::ToolRegistry;
use super::retry::{AdaptiveRetry, BackoffRetry, RetryStep};
use super::tool::{Tool, ToolContext};
use crate::config::AgentSettings;
use crate::error::{ErrorCategory, StewardError};
use crate::types::{ToolInvocation, ToolResultBlock};
use crate::util::timeout::with_timeout;

/// What a tool call produced, as reported back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: Value,
    pub is_error: bool,
    /// File the call persisted, when one could be identified.
    pub artifact: Option<PathBuf>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            is_error: false,
            artifact: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: json!({ "error": message.into() }),
            is_error: true,
            artifact: None,
        }
    }

    fn from_error(err: &StewardError) -> Self {
        let kind = match err.category() {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Canceled => "canceled",
            _ => "execution",
        };
        Self {
            result: json!({ "error": err.to_string(), "kind": kind }),
            is_error: true,
            artifact: None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.result.get("error").and_then(Value::as_str)
    }

    pub fn into_result_block(self, tool_use_id: impl Into<String>) -> ToolResultBlock {
        ToolResultBlock {
            tool_use_id: tool_use_id.into(),
            content: self.result,
            is_error: self.is_error,
        }
    }
}

/// Resolves, validates, bounds and (for flaky categories) retries tool calls.
///
/// Failures never escape as `Err`: every path yields a [`ToolOutcome`] so the
/// model always receives a result for its request.
pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    retry: Arc<dyn AdaptiveRetry>,
    timeout: Duration,
    retryable_prefixes: Vec<String>,
}

impl ToolGateway {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::from_settings(registry, &AgentSettings::default())
    }

    pub fn from_settings(registry: Arc<ToolRegistry>, settings: &AgentSettings) -> Self {
        Self {
            registry,
            retry: Arc::new(BackoffRetry::default()),
            timeout: settings.tool_timeout(),
            retryable_prefixes: settings.retryable_tool_prefixes.clone(),
        }
    }

    pub fn with_retry(mut self, retry: Arc<dyn AdaptiveRetry>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn is_retryable(&self, name: &str) -> bool {
        self.retryable_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    pub async fn execute(&self, call: &ToolInvocation, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.registry.get_tool(&call.name) else {
            warn!(tool = %call.name, "model requested unknown tool");
            return ToolOutcome::error(format!("Unknown tool: {}", call.name));
        };
        if let Err(reason) = tool.schema().validate(&call.arguments) {
            return ToolOutcome::error(format!("Invalid arguments for {}: {reason}", call.name));
        }

        let timeout = self.timeout;
        let result = if self.is_retryable(&call.name) {
            let invoke = |args: Value| -> BoxFuture<'static, Result<Value, StewardError>> {
                Box::pin(run_once(tool.clone(), args, ctx.clone(), timeout))
            };
            let step = RetryStep {
                tool_name: &call.name,
                arguments: &call.arguments,
            };
            let outcome = self.retry.execute_with_retry(step, &invoke).await;
            if outcome.success {
                Ok(outcome.output.unwrap_or(Value::Null))
            } else {
                let message = outcome.error.unwrap_or_else(|| "tool failed".into());
                return ToolOutcome {
                    result: json!({
                        "error": message,
                        "kind": "retries_exhausted",
                        "attempts": outcome.attempts,
                    }),
                    is_error: true,
                    artifact: None,
                };
            }
        } else {
            run_once(tool.clone(), call.arguments.clone(), ctx.clone(), timeout).await
        };

        match result {
            Ok(value) => {
                let artifact =
                    detect_artifact(&call.name, &call.arguments, &value, tool.side_effects(), ctx);
                if let Some(path) = &artifact {
                    debug!(tool = %call.name, path = %path.display(), "tool produced artifact");
                }
                ToolOutcome {
                    result: value,
                    is_error: false,
                    artifact,
                }
            }
            Err(err) => {
                debug!(tool = %call.name, error = %err, "tool call failed");
                ToolOutcome::from_error(&err)
            }
        }
    }
}

async fn run_once(
    tool: Arc<dyn Tool>,
    args: Value,
    ctx: ToolContext,
    timeout: Duration,
) -> Result<Value, StewardError> {
    let args = ToolArguments::new(args);
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(StewardError::Canceled("tool call canceled".into())),
        result = with_timeout(timeout, tool.execute(&args, &ctx)) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::ToolSource;
    use crate::tools::schema::ToolSchema;
    use crate::tools::tool::{FnTool, SideEffect};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway(tools: Vec<Arc<dyn Tool>>) -> ToolGateway {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_all(ToolSource::Builtin, tools);
        ToolGateway::new(registry).with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let outcome = gateway(vec![])
            .execute(&ToolInvocation::new("1", "nope", json!({})), &ToolContext::default())
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.error_message(), Some("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn missing_required_argument_never_reaches_the_tool() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let tool: Arc<dyn Tool> = Arc::new(FnTool::new(
            "read_file",
            "Read",
            ToolSchema::object().string("path", "p", true).build(),
            move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("x"))
                }
            },
        ));
        let outcome = gateway(vec![tool])
            .execute(&ToolInvocation::new("1", "read_file", json!({})), &ToolContext::default())
            .await;
        assert!(outcome.is_error);
        assert!(outcome.error_message().unwrap().contains("path"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let tool: Arc<dyn Tool> = Arc::new(FnTool::new("slow", "Slow", ToolSchema::empty(), |_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("late"))
        }));
        let outcome = gateway(vec![tool])
            .execute(&ToolInvocation::new("1", "slow", json!({})), &ToolContext::default())
            .await;
        assert!(outcome.is_error);
        assert_eq!(outcome.result["kind"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_prefix_goes_through_adaptive_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let tool: Arc<dyn Tool> = Arc::new(FnTool::new(
            "web_fetch",
            "Fetch",
            ToolSchema::empty(),
            move |_, _| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StewardError::ToolExecution {
                            tool_name: "web_fetch".into(),
                            message: "connection reset".into(),
                        })
                    } else {
                        Ok(json!({"status": 200}))
                    }
                }
            },
        ));
        let outcome = gateway(vec![tool])
            .execute(&ToolInvocation::new("1", "web_fetch", json!({})), &ToolContext::default())
            .await;
        assert!(!outcome.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn writing_tool_reports_artifact() {
        let tool: Arc<dyn Tool> = Arc::new(
            FnTool::new("export_sheet", "Export", ToolSchema::empty(), |_, _| async {
                Ok(json!({"path": "/out/q3.xlsx"}))
            })
            .with_side_effects([SideEffect::FilesystemWrite]),
        );
        let outcome = gateway(vec![tool])
            .execute(&ToolInvocation::new("1", "export_sheet", json!({})), &ToolContext::default())
            .await;
        assert_eq!(outcome.artifact, Some(PathBuf::from("/out/q3.xlsx")));
    }
}
