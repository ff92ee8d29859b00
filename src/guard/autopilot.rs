//! Corrective actions substituted for a looping tool call.
//!
//! A strategy maps a tool-name pattern (plus an optional pattern over the
//! canonical argument JSON) to one replacement call. Configured strategies are
//! consulted before the built-in table.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::StewardError;
use crate::types::ToolInvocation;

/// Serializable strategy row, as written in `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    /// Regex over the tool name.
    pub tool_pattern: String,
    /// Regex over the canonical JSON of the arguments.
    #[serde(default)]
    pub args_pattern: Option<String>,
    pub action_tool: String,
    #[serde(default = "empty_object")]
    pub action_args: Value,
    /// A successful correction finishes the workflow the model was stuck on.
    #[serde(default)]
    pub completes_workflow: bool,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// The replacement call chosen for a looping invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectiveAction {
    pub strategy: String,
    pub tool_name: String,
    pub arguments: Value,
    pub completes_workflow: bool,
}

impl CorrectiveAction {
    /// The invocation to run through the gateway in place of `original`.
    pub fn to_invocation(&self, original: &ToolInvocation) -> ToolInvocation {
        ToolInvocation::new(
            format!("{}-autopilot", original.id),
            self.tool_name.clone(),
            self.arguments.clone(),
        )
    }
}

struct CompiledStrategy {
    spec: StrategySpec,
    tool_re: Regex,
    args_re: Option<Regex>,
}

impl CompiledStrategy {
    fn compile(spec: StrategySpec) -> Result<Self, StewardError> {
        let invalid = |e: regex::Error| {
            StewardError::Configuration(format!("corrective strategy '{}': {e}", spec.name))
        };
        let tool_re = Regex::new(&spec.tool_pattern).map_err(invalid)?;
        let args_re = spec
            .args_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(invalid)?;
        Ok(Self {
            spec,
            tool_re,
            args_re,
        })
    }

    fn matches(&self, tool_name: &str, canonical_args: &str) -> bool {
        self.tool_re.is_match(tool_name)
            && self
                .args_re
                .as_ref()
                .map_or(true, |re| re.is_match(canonical_args))
    }
}

/// Ordered strategy table; the first match wins.
pub struct CorrectiveTable {
    strategies: Vec<CompiledStrategy>,
}

impl Default for CorrectiveTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CorrectiveTable {
    /// Built-in strategies for common browser automation stalls.
    pub fn builtin() -> Self {
        let strategies = builtin_specs()
            .into_iter()
            .filter_map(|spec| {
                let name = spec.name.clone();
                CompiledStrategy::compile(spec)
                    .map_err(|err| warn!(strategy = %name, error = %err, "skipping built-in strategy"))
                    .ok()
            })
            .collect();
        Self { strategies }
    }

    /// Configured strategies first, then the built-ins.
    pub fn with_specs(specs: &[StrategySpec]) -> Result<Self, StewardError> {
        let mut strategies = specs
            .iter()
            .cloned()
            .map(CompiledStrategy::compile)
            .collect::<Result<Vec<_>, _>>()?;
        strategies.extend(Self::builtin().strategies);
        Ok(Self { strategies })
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn find(&self, tool_name: &str, arguments: &Value) -> Option<CorrectiveAction> {
        let canonical = arguments.to_string();
        self.strategies
            .iter()
            .find(|s| s.matches(tool_name, &canonical))
            .map(|s| CorrectiveAction {
                strategy: s.spec.name.clone(),
                tool_name: s.spec.action_tool.clone(),
                arguments: s.spec.action_args.clone(),
                completes_workflow: s.spec.completes_workflow,
            })
    }
}

fn builtin_specs() -> Vec<StrategySpec> {
    vec![
        StrategySpec {
            name: "submit-with-keyboard".into(),
            tool_pattern: "^browser_click$".into(),
            args_pattern: Some(r"(?i)\b(post|submit|send|publish|tweet|reply)\b".into()),
            action_tool: "browser_press_key".into(),
            action_args: serde_json::json!({ "key": "Control+Enter" }),
            completes_workflow: true,
        },
        StrategySpec {
            name: "read-instead-of-renavigate".into(),
            tool_pattern: "^browser_navigate$".into(),
            args_pattern: None,
            action_tool: "browser_get_content".into(),
            action_args: empty_object(),
            completes_workflow: false,
        },
        StrategySpec {
            name: "confirm-typed-input".into(),
            tool_pattern: "^browser_type$".into(),
            args_pattern: None,
            action_tool: "browser_press_key".into(),
            action_args: serde_json::json!({ "key": "Enter" }),
            completes_workflow: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_button_maps_to_keyboard_submit() {
        let action = CorrectiveTable::builtin()
            .find("browser_click", &json!({"text": "Post"}))
            .unwrap();
        assert_eq!(action.tool_name, "browser_press_key");
        assert_eq!(action.arguments, json!({"key": "Control+Enter"}));
        assert!(action.completes_workflow);
        assert!(CorrectiveTable::builtin()
            .find("browser_click", &json!({"text": "Settings"}))
            .is_none());
    }

    #[test]
    fn configured_rows_win_and_bad_regex_is_rejected() {
        let spec = StrategySpec {
            name: "custom".into(),
            tool_pattern: "^browser_click$".into(),
            args_pattern: None,
            action_tool: "browser_scroll".into(),
            action_args: json!({"direction": "down"}),
            completes_workflow: false,
        };
        let table = CorrectiveTable::with_specs(&[spec.clone()]).unwrap();
        assert_eq!(table.len(), CorrectiveTable::builtin().len() + 1);
        assert_eq!(
            table.find("browser_click", &json!({"text": "Post"})).unwrap().strategy,
            "custom"
        );

        let broken = StrategySpec {
            tool_pattern: "(".into(),
            ..spec
        };
        assert!(matches!(
            CorrectiveTable::with_specs(&[broken]),
            Err(StewardError::Configuration(_))
        ));
    }
}
