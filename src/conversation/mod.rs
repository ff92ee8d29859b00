//! Per-task conversation log with budget-aware compaction.
//!
//! Pressure is the larger of `len / limit` and (when a token budget is set)
//! `estimated_tokens / budget`:
//!
//! - below 80%: nothing happens;
//! - 80% to 100%: tool results older than the midpoint are compressed to a
//!   short classified snippet;
//! - at or above 100%: the oldest messages fold into one synthetic summary,
//!   which always stays first.

pub mod compaction;

pub use compaction::{estimate_message_tokens, estimate_text_tokens};

use tracing::debug;

use crate::types::{ContentBlock, Message};
use compaction::{build_summary, compress_tool_results, is_summary};

const COMPRESS_THRESHOLD: f64 = 0.8;
const MIN_LIMIT: usize = 4;

/// Ordered message log for one task.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    messages: Vec<Message>,
    limit: usize,
    token_budget: Option<usize>,
    original_request: Option<String>,
}

impl ConversationStore {
    /// Create a store holding at most `limit` messages (minimum 4).
    pub fn new(limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            limit: limit.max(MIN_LIMIT),
            token_budget: None,
            original_request: None,
        }
    }

    pub fn with_token_budget(mut self, budget: Option<usize>) -> Self {
        self.token_budget = budget.filter(|b| *b > 0);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(MIN_LIMIT);
        self.compact();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message and enforce the budget. Returns the current log.
    pub fn append(&mut self, message: Message) -> &[Message] {
        if self.original_request.is_none() && !message.is_tool_result_message() {
            let text = message.text();
            if !text.trim().is_empty() && message.role == crate::types::Role::User {
                self.original_request = Some(text);
            }
        }
        self.messages.push(message);
        self.compact();
        &self.messages
    }

    /// Add user text, merging into a trailing user message so roles keep
    /// alternating (tool results and queued input share one turn).
    pub fn append_user_text(&mut self, text: impl Into<String>) -> &[Message] {
        let text = text.into();
        let merge = self.messages.len() > 1
            && self
                .messages
                .last()
                .is_some_and(|last| last.role == crate::types::Role::User);
        if !merge {
            return self.append(Message::user(text));
        }
        if let Some(last) = self.messages.last_mut() {
            match last.content.iter_mut().rev().find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            }) {
                Some(existing) => {
                    existing.push_str("\n\n");
                    existing.push_str(&text);
                }
                None => last.content.push(ContentBlock::Text { text }),
            }
        }
        self.compact();
        &self.messages
    }

    /// Drop every message (the task itself stays alive).
    pub fn clear(&mut self) {
        self.messages.clear();
        self.original_request = None;
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(estimate_message_tokens).sum()
    }

    /// Current budget pressure as a fraction of the tighter bound.
    pub fn pressure(&self) -> f64 {
        let by_count = self.messages.len() as f64 / self.limit as f64;
        let by_tokens = self
            .token_budget
            .map(|budget| self.estimated_tokens() as f64 / budget as f64)
            .unwrap_or(0.0);
        by_count.max(by_tokens)
    }

    /// Apply compression or folding according to the current pressure.
    /// Running it again on an unchanged log is a no-op.
    pub fn compact(&mut self) {
        if self.pressure() >= 1.0 {
            self.fold_oldest();
        }
        if self.pressure() >= COMPRESS_THRESHOLD {
            let midpoint = self.messages.len() / 2;
            let changed = compress_tool_results(&mut self.messages, midpoint);
            if changed > 0 {
                debug!(changed, midpoint, "compressed old tool results");
            }
        }
    }

    fn keep_recent(&self) -> usize {
        let by_count = (self.limit * 3 / 4).clamp(2, self.limit - 2);
        if self.messages.len() >= self.limit {
            by_count
        } else {
            // Token pressure with a short log: fold the older half.
            by_count.min(self.messages.len() / 2).max(2)
        }
    }

    /// Start of the most recent exchange: the last assistant turn together
    /// with the results answering it, or a trailing user message.
    fn last_exchange_start(&self) -> usize {
        let len = self.messages.len();
        match self.messages.last() {
            Some(last) if last.is_tool_result_message() => len.saturating_sub(2),
            Some(_) => len - 1,
            None => 0,
        }
    }

    fn fold_oldest(&mut self) {
        let len = self.messages.len();
        let body_start = usize::from(self.messages.first().is_some_and(is_summary));

        let mut cut = len
            .saturating_sub(self.keep_recent())
            .min(self.last_exchange_start());
        // A kept tool-result message must keep its request.
        if cut < len && self.messages[cut].is_tool_result_message() {
            cut = cut.saturating_sub(1);
        }
        if cut <= body_start {
            return;
        }

        let prior = (body_start == 1).then(|| self.messages[0].clone());
        let folded: Vec<Message> = self.messages.drain(body_start..cut).collect();
        let summary = build_summary(&folded, prior.as_ref(), self.original_request.as_deref());
        if body_start == 1 {
            self.messages[0] = summary;
        } else {
            self.messages.insert(0, summary);
        }
        debug!(
            folded = folded.len(),
            kept = self.messages.len() - 1,
            "folded conversation history into summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, ToolInvocation, ToolResultBlock};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn exchange(store: &mut ConversationStore, i: usize) {
        store.append(Message::assistant_blocks(vec![ContentBlock::ToolUse(
            ToolInvocation::new(format!("c{i}"), "read_file", json!({"path": format!("f{i}")})),
        )]));
        store.append(Message::tool_results(vec![ToolResultBlock::ok(
            format!("c{i}"),
            json!("y".repeat(400)),
        )]));
    }

    #[test]
    fn below_threshold_nothing_changes() {
        let mut store = ConversationStore::new(20);
        store.append(Message::user("hi"));
        exchange(&mut store, 0);
        let results = store.messages()[2].tool_result_blocks();
        assert_eq!(results[0].content, json!("y".repeat(400)));
    }

    #[test]
    fn compression_band_keeps_order_and_is_idempotent() {
        let mut store = ConversationStore::new(10);
        store.append(Message::user("start"));
        for i in 0..4 {
            exchange(&mut store, i);
        }
        // 9 messages of 10: compression band.
        assert_eq!(store.len(), 9);
        let first = store.messages()[2].tool_result_blocks()[0].content.clone();
        assert!(first.as_str().unwrap().starts_with("[compressed] success:"));
        let recent = store.messages()[8].tool_result_blocks()[0].content.clone();
        assert_eq!(recent, json!("y".repeat(400)));

        let snapshot = store.messages().to_vec();
        store.compact();
        assert_eq!(store.messages(), snapshot.as_slice());
    }

    #[test]
    fn overflow_folds_into_leading_summary_within_limit() {
        let mut store = ConversationStore::new(8);
        store.append(Message::user("Collect the quarterly numbers"));
        for i in 0..10 {
            exchange(&mut store, i);
            assert!(store.len() <= 8, "len {} exceeds limit", store.len());
            if store.len() > 1 {
                assert!(!store.messages()[1].is_tool_result_message());
            }
        }
        let summary = &store.messages()[0];
        assert!(is_summary(summary));
        let text = summary.text();
        assert!(text.contains("Collect the quarterly numbers"));
        assert!(text.contains("read_file"));

        // The newest exchange survives verbatim.
        let last = store.last().unwrap().tool_result_blocks()[0].tool_use_id.clone();
        assert_eq!(last, "c9");
        assert_eq!(store.messages()[store.len() - 2].tool_invocations()[0].id, "c9");
    }

    #[test]
    fn token_budget_raises_pressure() {
        let mut store = ConversationStore::new(100).with_token_budget(Some(400));
        store.append(Message::user("go"));
        for i in 0..4 {
            exchange(&mut store, i);
        }
        assert!(store.len() < 9);
        assert!(is_summary(&store.messages()[0]));
    }

    #[test]
    fn user_text_merges_into_trailing_user_turn() {
        let mut store = ConversationStore::new(10);
        store.append(Message::user("Find the report"));
        exchange(&mut store, 0);
        store.append_user_text("Also check the appendix");
        assert_eq!(store.len(), 3);
        let last = store.last().unwrap();
        assert_eq!(last.tool_result_blocks().len(), 1);
        assert_eq!(last.text(), "Also check the appendix");

        store.append_user_text("And the footnotes");
        assert_eq!(store.last().unwrap().text(), "Also check the appendix\n\nAnd the footnotes");
    }

    #[test]
    fn clear_empties_the_log() {
        let mut store = ConversationStore::new(10);
        store.append(Message::user("hello"));
        store.clear();
        assert!(store.is_empty());
    }
}
