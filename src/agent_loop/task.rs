//! Per-task state owned by the controller.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AgentSettings;
use crate::contract::{build_contract, ArtifactContract};
use crate::conversation::ConversationStore;
use crate::guard::{CorrectiveTable, LoopGuard};
use crate::models::ModelConfig;
use crate::suspend::SuspendCoordinator;
use crate::types::Usage;
use crate::util::text::snippet;

/// Where the task works, as shown to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceContext {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_files: Vec<PathBuf>,
}

impl WorkspaceContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("Workspace: {}", self.path.display());
        if let Some(active) = &self.active_file {
            out.push_str(&format!("\nActive file: {}", active.display()));
        }
        if !self.open_files.is_empty() {
            let files: Vec<String> = self
                .open_files
                .iter()
                .map(|f| f.display().to_string())
                .collect();
            out.push_str(&format!("\nOpen files: {}", files.join(", ")));
        }
        out
    }
}

/// Everything one task carries between steps and runs.
pub struct TaskContext {
    pub id: String,
    pub title: String,
    pub store: ConversationStore,
    pub model: ModelConfig,
    pub system_prompt: Option<String>,
    pub workspace: Option<WorkspaceContext>,
    pub seq: Arc<AtomicU64>,
    pub contract: ArtifactContract,
    pub artifacts: BTreeSet<PathBuf>,
    pub tools_used: BTreeSet<String>,
    pub suspend: Arc<SuspendCoordinator>,
    pub guard: LoopGuard,
    pub tool_failures: HashMap<String, u32>,
    pub downgrade_accepted: bool,
    pub original_request: String,
    pub tool_calls_total: usize,
    pub plan_context: Option<String>,
    pub plan_loaded_at: Option<usize>,
    pub usage: Usage,
}

impl TaskContext {
    pub fn new(
        id: String,
        prompt: &str,
        title: Option<String>,
        model: ModelConfig,
        settings: &AgentSettings,
        table: Arc<CorrectiveTable>,
    ) -> Self {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| snippet(prompt.trim(), 60));
        Self {
            suspend: Arc::new(SuspendCoordinator::new(id.clone())),
            id,
            title,
            store: ConversationStore::new(settings.history_limit)
                .with_token_budget(settings.token_budget),
            model,
            system_prompt: None,
            workspace: None,
            seq: Arc::new(AtomicU64::new(0)),
            contract: build_contract(prompt),
            artifacts: BTreeSet::new(),
            tools_used: BTreeSet::new(),
            guard: LoopGuard::from_settings(settings, table),
            tool_failures: HashMap::new(),
            downgrade_accepted: false,
            original_request: prompt.to_string(),
            tool_calls_total: 0,
            plan_context: None,
            plan_loaded_at: None,
            usage: Usage::default(),
        }
    }

    /// Drop the conversation while keeping identity, contract and counters.
    pub fn clear_history(&mut self) {
        self.store.clear();
        self.plan_context = None;
        self.plan_loaded_at = None;
    }

    /// Record incoming user text; returns true if it accepts a downgrade.
    pub fn note_user_text(&mut self, text: &str, downgrade_token: &str) -> bool {
        let accepts = !downgrade_token.is_empty()
            && text.to_lowercase().contains(&downgrade_token.to_lowercase());
        if accepts {
            self.downgrade_accepted = true;
        }
        accepts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    fn context(prompt: &str) -> TaskContext {
        TaskContext::new(
            "t1".into(),
            prompt,
            None,
            ModelConfig::new(ProviderKind::Anthropic, "m"),
            &AgentSettings::default(),
            Arc::new(CorrectiveTable::builtin()),
        )
    }

    #[test]
    fn title_defaults_to_prompt_snippet_and_contract_is_built() {
        let ctx = context("Generate a slide deck about Q3 results for the board meeting next week");
        assert!(ctx.title.starts_with("Generate a slide deck"));
        assert!(ctx.title.ends_with("..."));
        assert_eq!(ctx.contract.expected().len(), 1);
    }

    #[test]
    fn downgrade_token_is_case_insensitive() {
        let mut ctx = context("make a pdf");
        assert!(!ctx.note_user_text("looks fine", "accept-downgrade"));
        assert!(ctx.note_user_text("OK, Accept-Downgrade please", "accept-downgrade"));
        assert!(ctx.downgrade_accepted);
    }

    #[test]
    fn workspace_renders_open_files() {
        let ws = WorkspaceContext {
            path: "/work".into(),
            active_file: Some("/work/a.rs".into()),
            open_files: vec!["/work/a.rs".into(), "/work/b.rs".into()],
        };
        assert_eq!(
            ws.render(),
            "Workspace: /work\nActive file: /work/a.rs\nOpen files: /work/a.rs, /work/b.rs"
        );
    }
}
