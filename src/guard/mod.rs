//! Loop guard: detects a model stuck repeating one tool call.
//!
//! Keys are `(tool name, SHA-256 of the canonical argument JSON)`. Once a
//! loop-detectable tool has run with identical arguments three times in a row,
//! the next identical call is replaced by one corrective action and its key is
//! blocked for the rest of the task. Blocked keys are rejected with escalating guidance until
//! the consecutive-block limit ends the task.

pub mod autopilot;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::AgentSettings;
use crate::types::ToolInvocation;
use crate::util::text::snippet;

pub use autopilot::{CorrectiveAction, CorrectiveTable, StrategySpec};

const HISTORY_LEN: usize = 10;
const REPEAT_THRESHOLD: usize = 3;
const BLOCKED_ATTEMPT_LIMIT: u32 = 5;

/// Identity of a tool call for repetition tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub tool_name: String,
    pub args_hash: String,
}

impl CallKey {
    pub fn new(tool_name: &str, arguments: &Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            args_hash: args_hash(arguments),
        }
    }
}

/// SHA-256 (hex) of the argument JSON. `serde_json` maps keep keys sorted,
/// so key order in the model's output does not change the hash.
pub fn args_hash(arguments: &Value) -> String {
    let digest = Sha256::digest(arguments.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// What the controller should do with a requested call.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// Execute normally.
    Proceed,
    /// Replace the call with `action` (if a strategy matched) and report its
    /// result, or report `guidance` when nothing matched.
    Intervene {
        action: Option<CorrectiveAction>,
        guidance: String,
    },
    /// Reject without executing.
    Blocked { guidance: String, attempts: u32 },
    /// The corrective workflow already finished; report success.
    CompletedGracefully { message: String },
    /// End the task with a fatal loop error.
    Terminate { tool_name: String, arguments: String },
}

/// Per-task repetition state.
pub struct LoopGuard {
    detectable_prefixes: Vec<String>,
    table: Arc<CorrectiveTable>,
    history: VecDeque<CallKey>,
    blocked: HashSet<CallKey>,
    consecutive_blocked: u32,
    workflow_complete: bool,
}

impl LoopGuard {
    pub fn new(detectable_prefixes: Vec<String>, table: Arc<CorrectiveTable>) -> Self {
        Self {
            detectable_prefixes,
            table,
            history: VecDeque::with_capacity(HISTORY_LEN),
            blocked: HashSet::new(),
            consecutive_blocked: 0,
            workflow_complete: false,
        }
    }

    pub fn from_settings(settings: &AgentSettings, table: Arc<CorrectiveTable>) -> Self {
        Self::new(settings.loop_detectable_prefixes.clone(), table)
    }

    fn is_detectable(&self, tool_name: &str) -> bool {
        self.detectable_prefixes
            .iter()
            .any(|prefix| tool_name.starts_with(prefix.as_str()))
    }

    fn record(&mut self, key: CallKey) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(key);
    }

    fn trailing_repeats(&self, key: &CallKey) -> usize {
        self.history.iter().rev().take_while(|k| *k == key).count()
    }

    /// Classify `call`, updating history and block state.
    pub fn check(&mut self, call: &ToolInvocation) -> GuardDecision {
        let key = CallKey::new(&call.name, &call.arguments);

        if self.blocked.contains(&key) {
            self.consecutive_blocked += 1;
            self.record(key);
            if self.workflow_complete {
                return GuardDecision::CompletedGracefully {
                    message: format!(
                        "The workflow behind {} already completed successfully. \
                         No further action is needed for it; continue with the rest of the task \
                         or give your final answer.",
                        call.name
                    ),
                };
            }
            let attempts = self.consecutive_blocked;
            if attempts >= BLOCKED_ATTEMPT_LIMIT {
                warn!(tool = %call.name, attempts, "terminating task stuck on blocked call");
                return GuardDecision::Terminate {
                    tool_name: call.name.clone(),
                    arguments: snippet(&call.arguments.to_string(), 200),
                };
            }
            return GuardDecision::Blocked {
                guidance: blocked_guidance(&call.name, attempts),
                attempts,
            };
        }

        self.consecutive_blocked = 0;
        let prior = self.trailing_repeats(&key);
        self.record(key.clone());

        if !self.is_detectable(&call.name) || prior < REPEAT_THRESHOLD {
            return GuardDecision::Proceed;
        }

        self.blocked.insert(key);
        let action = self.table.find(&call.name, &call.arguments);
        warn!(
            tool = %call.name,
            strategy = action.as_ref().map(|a| a.strategy.as_str()).unwrap_or("none"),
            "repeated identical tool call; intervening"
        );
        let guidance = match &action {
            Some(action) => format!(
                "{} was called with identical arguments {REPEAT_THRESHOLD} times in a row without progress. \
                 Ran {} instead. This exact call is now blocked; use a different approach.",
                call.name, action.tool_name
            ),
            None => format!(
                "{} was called with identical arguments {REPEAT_THRESHOLD} times in a row without progress. \
                 This exact call is now blocked; inspect the current state and try a different approach.",
                call.name
            ),
        };
        GuardDecision::Intervene { action, guidance }
    }

    /// Record how a corrective action went.
    pub fn record_correction(&mut self, action: &CorrectiveAction, succeeded: bool) {
        if succeeded && action.completes_workflow {
            info!(strategy = %action.strategy, "corrective action completed the workflow");
            self.workflow_complete = true;
        }
    }

    pub fn is_blocked(&self, tool_name: &str, arguments: &Value) -> bool {
        self.blocked.contains(&CallKey::new(tool_name, arguments))
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn consecutive_blocked(&self) -> u32 {
        self.consecutive_blocked
    }

    pub fn workflow_complete(&self) -> bool {
        self.workflow_complete
    }
}

fn blocked_guidance(tool_name: &str, attempts: u32) -> String {
    let remaining = BLOCKED_ATTEMPT_LIMIT.saturating_sub(attempts);
    match attempts {
        1 => format!(
            "This exact {tool_name} call is blocked because it already repeated without progress. \
             Try a different approach."
        ),
        2 => format!(
            "Blocked again: {tool_name} with these arguments will not run. \
             Use a different tool or different arguments, or explain what is preventing progress."
        ),
        _ => format!(
            "STOP repeating {tool_name} with these arguments. The task will be terminated after \
             {remaining} more blocked attempt(s). Change strategy now or give your final answer."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn guard() -> LoopGuard {
        LoopGuard::from_settings(&AgentSettings::default(), Arc::new(CorrectiveTable::builtin()))
    }

    fn click(id: &str) -> ToolInvocation {
        ToolInvocation::new(id, "browser_click", json!({"text": "Post"}))
    }

    #[test]
    fn key_ignores_argument_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(args_hash(&a), args_hash(&b));
        assert_eq!(args_hash(&a).len(), 64);
    }

    #[test]
    fn fourth_identical_call_intervenes_and_blocks() {
        let mut guard = guard();
        for id in ["1", "2", "3"] {
            assert_eq!(guard.check(&click(id)), GuardDecision::Proceed);
        }
        assert!(!guard.is_blocked("browser_click", &json!({"text": "Post"})));

        let GuardDecision::Intervene { action, .. } = guard.check(&click("4")) else {
            panic!("expected intervention");
        };
        assert_eq!(action.unwrap().tool_name, "browser_press_key");
        assert!(guard.is_blocked("browser_click", &json!({"text": "Post"})));

        assert!(matches!(
            guard.check(&click("5")),
            GuardDecision::Blocked { attempts: 1, .. }
        ));
    }

    #[test]
    fn non_detectable_tools_never_intervene() {
        let mut guard = guard();
        for i in 0..6 {
            let call = ToolInvocation::new(i.to_string(), "read_file", json!({"path": "a"}));
            assert_eq!(guard.check(&call), GuardDecision::Proceed);
        }
        assert_eq!(guard.blocked_count(), 0);
    }

    #[test]
    fn interleaved_calls_do_not_count_as_repeats() {
        let mut guard = guard();
        let other = ToolInvocation::new("x", "browser_scroll", json!({}));
        for i in 0..4 {
            assert_eq!(guard.check(&click(&i.to_string())), GuardDecision::Proceed);
            assert_eq!(guard.check(&other), GuardDecision::Proceed);
        }
    }

    #[test]
    fn five_consecutive_blocked_attempts_terminate() {
        let mut guard = guard();
        for i in 0..4 {
            guard.check(&click(&i.to_string()));
        }
        for attempt in 1..5 {
            assert!(matches!(
                guard.check(&click("b")),
                GuardDecision::Blocked { attempts, .. } if attempts == attempt
            ));
        }
        let GuardDecision::Terminate { tool_name, arguments } = guard.check(&click("b")) else {
            panic!("expected termination");
        };
        assert_eq!(tool_name, "browser_click");
        assert_eq!(arguments, r#"{"text":"Post"}"#);
    }

    #[test]
    fn unblocked_call_resets_counter_but_block_list_only_grows() {
        let mut guard = guard();
        for i in 0..4 {
            guard.check(&click(&i.to_string()));
        }
        guard.check(&click("b1"));
        guard.check(&click("b2"));
        assert_eq!(guard.consecutive_blocked(), 2);

        guard.check(&ToolInvocation::new("s", "browser_scroll", json!({})));
        assert_eq!(guard.consecutive_blocked(), 0);
        assert_eq!(guard.blocked_count(), 1);
        assert!(matches!(
            guard.check(&click("b3")),
            GuardDecision::Blocked { attempts: 1, .. }
        ));
    }

    #[test]
    fn completed_workflow_turns_blocks_into_success() {
        let mut guard = guard();
        for i in 0..3 {
            guard.check(&click(&i.to_string()));
        }
        let GuardDecision::Intervene {
            action: Some(action),
            ..
        } = guard.check(&click("3"))
        else {
            panic!("expected corrective action");
        };
        guard.record_correction(&action, true);
        for _ in 0..8 {
            assert!(matches!(
                guard.check(&click("again")),
                GuardDecision::CompletedGracefully { .. }
            ));
        }
    }
}
