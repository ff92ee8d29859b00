//! Token estimation, tool-result compression and summary construction.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::types::{ContentBlock, Message, Role};
use crate::util::text::snippet;

pub(crate) const COMPRESSED_PREFIX: &str = "[compressed]";
pub(crate) const SUMMARY_HEADER: &str = "[Conversation summary]";

const COMPRESSED_SNIPPET_BYTES: usize = 160;
const REQUEST_SNIPPET_BYTES: usize = 300;
const PRIOR_SUMMARY_BYTES: usize = 1_200;
const MAX_FINDINGS: usize = 12;

pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = 4usize;
    for block in &message.content {
        tokens += match block {
            ContentBlock::Text { text } => estimate_text_tokens(text),
            ContentBlock::Thinking { thinking, .. } => estimate_text_tokens(thinking),
            ContentBlock::ToolUse(call) => {
                estimate_text_tokens(&call.name) + estimate_text_tokens(&call.arguments.to_string()) + 8
            }
            ContentBlock::ToolResult(result) => estimate_text_tokens(&value_text(&result.content)) + 8,
        };
    }
    tokens
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace tool-result payloads in `messages[..upto]` with a short classified
/// snippet. Already-compressed results are left alone. Returns how many
/// results changed.
pub fn compress_tool_results(messages: &mut [Message], upto: usize) -> usize {
    let mut changed = 0;
    let upto = upto.min(messages.len());
    for message in &mut messages[..upto] {
        for block in &mut message.content {
            let ContentBlock::ToolResult(result) = block else {
                continue;
            };
            let text = value_text(&result.content);
            if text.starts_with(COMPRESSED_PREFIX) {
                continue;
            }
            let class = classify_result(&result.content, result.is_error);
            result.content = Value::String(format!(
                "{COMPRESSED_PREFIX} {class}: {}",
                snippet(&text, COMPRESSED_SNIPPET_BYTES)
            ));
            changed += 1;
        }
    }
    changed
}

fn classify_result(content: &Value, is_error: bool) -> &'static str {
    if is_error || content.get("error").is_some() {
        return "error";
    }
    if content.get("success").and_then(Value::as_bool) == Some(false) {
        return "failure";
    }
    "success"
}

/// Whether `message` is a synthetic summary produced by [`build_summary`].
pub fn is_summary(message: &Message) -> bool {
    message.role == Role::User && message.text().starts_with(SUMMARY_HEADER)
}

/// Lines of the form `finding: ...` recorded by the model.
fn extract_findings(message: &Message) -> Vec<String> {
    message
        .text()
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['-', '*']).trim();
            let (label, rest) = line.split_once(':')?;
            (label.trim().eq_ignore_ascii_case("finding") && !rest.trim().is_empty())
                .then(|| rest.trim().to_string())
        })
        .collect()
}

/// Build the synthetic summary standing in for `folded` messages.
pub fn build_summary(
    folded: &[Message],
    prior_summary: Option<&Message>,
    original_request: Option<&str>,
) -> Message {
    let mut tools: BTreeSet<&str> = BTreeSet::new();
    let mut findings: Vec<String> = Vec::new();
    for message in folded {
        for call in message.tool_invocations() {
            tools.insert(call.name.as_str());
        }
        for finding in extract_findings(message) {
            if findings.len() < MAX_FINDINGS && !findings.contains(&finding) {
                findings.push(finding);
            }
        }
    }

    let mut text = String::from(SUMMARY_HEADER);
    text.push('\n');
    if let Some(request) = original_request {
        text.push_str(&format!(
            "Original request: {}\n",
            snippet(request, REQUEST_SNIPPET_BYTES)
        ));
    }
    if let Some(prior) = prior_summary {
        let body = prior.text();
        let body = body.strip_prefix(SUMMARY_HEADER).unwrap_or(body.as_str()).trim();
        if !body.is_empty() {
            text.push_str(&format!(
                "Earlier summary:\n{}\n",
                snippet(body, PRIOR_SUMMARY_BYTES)
            ));
        }
    }
    text.push_str(&format!("Messages folded: {}\n", folded.len()));
    if !tools.is_empty() {
        let names: Vec<&str> = tools.into_iter().collect();
        text.push_str(&format!("Tools used: {}\n", names.join(", ")));
    }
    if !findings.is_empty() {
        text.push_str("Findings:\n");
        for finding in findings {
            text.push_str(&format!("- {finding}\n"));
        }
    }
    Message::user(text.trim_end())
}
