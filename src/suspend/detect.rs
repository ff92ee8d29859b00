//! Recognize tool results that need a human before the task can continue.

use serde::Deserialize;
use serde_json::Value;

use super::SuspendReason;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_WAIT_MS: u64 = 300_000;

const LOGIN_URL_MARKERS: &[&str] = &["/login", "/signin", "/sign-in", "/auth", "accounts.google.com", "/sso"];
const LOGIN_TITLE_MARKERS: &[&str] = &["sign in", "log in", "login", "authentication required"];
const CAPTCHA_MARKERS: &[&str] = &["captcha", "verify you are human", "are you a robot"];
const PROMPT_SUFFIXES: &[&str] = &["password:", "passphrase:", "[y/n]", "(y/n)", "(yes/no)", "[y/n]?"];

/// A resume condition as described by a tool; probes are turned into
/// predicates by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestedCondition {
    #[default]
    Manual,
    Timeout {
        after_ms: u64,
    },
    Poll {
        probe_tool: String,
        #[serde(default)]
        probe_args: Value,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
        #[serde(default = "default_max_wait_ms")]
        max_wait_ms: u64,
        /// Substring the probe result must contain; any success counts when unset.
        #[serde(default)]
        expect: Option<String>,
    },
}

fn default_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}

/// A suspension a tool result asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendRequest {
    pub reason: SuspendReason,
    pub message: String,
    pub condition: RequestedCondition,
    pub metadata: Value,
}

#[derive(Deserialize)]
struct ExplicitSuspend {
    #[serde(default)]
    reason: Option<SuspendReason>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    condition: RequestedCondition,
    #[serde(default)]
    metadata: Value,
}

/// Inspect a successful tool result for a suspension trigger.
///
/// An explicit `suspend` object wins. Otherwise browser tools are checked for
/// login walls and captchas, and shell-like tools for an interactive prompt.
pub fn detect_suspension(tool_name: &str, result: &Value) -> Option<SuspendRequest> {
    if let Some(raw) = result.get("suspend").filter(|v| v.is_object()) {
        return match ExplicitSuspend::deserialize(raw) {
            Ok(explicit) => Some(SuspendRequest {
                reason: explicit.reason.unwrap_or(SuspendReason::ExternalAction),
                message: explicit
                    .message
                    .unwrap_or_else(|| format!("{tool_name} needs you to act before the task can continue")),
                condition: explicit.condition,
                metadata: explicit.metadata,
            }),
            Err(err) => {
                tracing::warn!(tool = tool_name, error = %err, "ignoring malformed suspend request");
                None
            }
        };
    }

    if tool_name.starts_with("browser_") {
        return detect_browser_wall(tool_name, result);
    }
    if is_shell_like(tool_name) {
        return detect_interactive_prompt(tool_name, result);
    }
    None
}

fn field_lower(result: &Value, key: &str) -> String {
    result
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn detect_browser_wall(tool_name: &str, result: &Value) -> Option<SuspendRequest> {
    let url = field_lower(result, "url");
    let title = field_lower(result, "title");
    let text = field_lower(result, "content") + &field_lower(result, "text");
    let metadata = serde_json::json!({ "tool": tool_name, "url": result.get("url") });

    if CAPTCHA_MARKERS.iter().any(|m| title.contains(m) || text.contains(m)) {
        return Some(SuspendRequest {
            reason: SuspendReason::CaptchaRequired,
            message: "The page is asking for a captcha. Solve it in the browser, then resume the task.".into(),
            condition: RequestedCondition::Manual,
            metadata,
        });
    }

    let auth_flag = result.get("auth_required").and_then(Value::as_bool) == Some(true);
    let login_page = LOGIN_URL_MARKERS.iter().any(|m| url.contains(m))
        && LOGIN_TITLE_MARKERS.iter().any(|m| title.contains(m));
    if auth_flag || login_page {
        return Some(SuspendRequest {
            reason: SuspendReason::AuthenticationRequired,
            message: "The site needs you to sign in. Log in in the browser, then resume the task.".into(),
            condition: RequestedCondition::Manual,
            metadata,
        });
    }
    None
}

fn is_shell_like(tool_name: &str) -> bool {
    ["shell", "bash", "terminal", "run_command", "exec"]
        .iter()
        .any(|needle| tool_name.contains(needle))
}

fn detect_interactive_prompt(tool_name: &str, result: &Value) -> Option<SuspendRequest> {
    let awaiting = result.get("awaiting_input").and_then(Value::as_bool) == Some(true);
    let output = ["stdout", "output", "stderr"]
        .iter()
        .map(|key| field_lower(result, key))
        .find(|s| !s.trim().is_empty())
        .unwrap_or_default();
    let last_line = output.trim_end().lines().last().unwrap_or_default().trim();
    let prompt = PROMPT_SUFFIXES.iter().any(|suffix| last_line.ends_with(suffix));

    (awaiting || prompt).then(|| SuspendRequest {
        reason: SuspendReason::InteractiveCommand,
        message: format!("The command run by {tool_name} is waiting for input in the terminal. Answer it there, then resume the task."),
        condition: RequestedCondition::Manual,
        metadata: serde_json::json!({ "tool": tool_name, "prompt": last_line }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn explicit_poll_request_is_parsed() {
        let result = json!({
            "suspend": {
                "reason": "authentication_required",
                "message": "Sign in to the CRM",
                "condition": {"type": "poll", "probe_tool": "browser_get_url", "expect": "/dashboard"}
            }
        });
        let request = detect_suspension("browser_navigate", &result).unwrap();
        assert_eq!(request.reason, SuspendReason::AuthenticationRequired);
        assert_eq!(
            request.condition,
            RequestedCondition::Poll {
                probe_tool: "browser_get_url".into(),
                probe_args: Value::Null,
                interval_ms: 5_000,
                max_wait_ms: 300_000,
                expect: Some("/dashboard".into()),
            }
        );
    }

    #[test]
    fn login_wall_needs_both_url_and_title() {
        let wall = json!({"url": "https://example.com/login?next=/", "title": "Sign in - Example"});
        assert_eq!(
            detect_suspension("browser_navigate", &wall).unwrap().reason,
            SuspendReason::AuthenticationRequired
        );
        let article = json!({"url": "https://example.com/blog/login-tips", "title": "Ten tips"});
        assert!(detect_suspension("browser_navigate", &article).is_none());
    }

    #[test]
    fn captcha_and_shell_prompts_are_detected() {
        let captcha = json!({"title": "Just a moment", "content": "Please verify you are human"});
        assert_eq!(
            detect_suspension("browser_get_content", &captcha).unwrap().reason,
            SuspendReason::CaptchaRequired
        );
        let sudo = json!({"stdout": "[sudo] password for dev:"});
        assert_eq!(
            detect_suspension("run_command", &sudo).unwrap().reason,
            SuspendReason::InteractiveCommand
        );
        assert!(detect_suspension("read_file", &json!({"content": "password:"})).is_none());
    }
}
