use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::ResumePredicate;
use crate::tools::{ToolContext, ToolGateway};
use crate::types::ToolInvocation;

/// Resume predicate that re-runs a probe tool through the gateway.
///
/// The probe passes when it succeeds and, if `expect` is set, its result
/// contains that substring.
pub struct ToolProbePredicate {
    gateway: Arc<ToolGateway>,
    probe: ToolInvocation,
    ctx: ToolContext,
    expect: Option<String>,
}

impl ToolProbePredicate {
    pub fn new(
        gateway: Arc<ToolGateway>,
        tool_name: impl Into<String>,
        arguments: Value,
        ctx: ToolContext,
        expect: Option<String>,
    ) -> Self {
        let arguments = if arguments.is_null() {
            Value::Object(Default::default())
        } else {
            arguments
        };
        Self {
            gateway,
            probe: ToolInvocation::new("resume-probe", tool_name, arguments),
            ctx,
            expect,
        }
    }
}

#[async_trait]
impl ResumePredicate for ToolProbePredicate {
    async fn check(&self) -> bool {
        let outcome = self.gateway.execute(&self.probe, &self.ctx).await;
        if outcome.is_error {
            tracing::debug!(probe = %self.probe.name, "resume probe failed");
            return false;
        }
        match &self.expect {
            None => true,
            Some(needle) => {
                let haystack = match &outcome.result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                haystack.contains(needle.as_str())
            }
        }
    }
}
