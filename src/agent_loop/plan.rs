//! Persistent plan files re-read during long tasks to keep the model on goal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::util::text::truncate_utf8;

const PLAN_FILE: &str = "task_plan.md";
const PROGRESS_FILE: &str = "progress.md";
const FINDINGS_FILE: &str = "findings.md";
const SECTION_MAX_BYTES: usize = 4_000;

/// Current contents of the plan files; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSnapshot {
    pub plan: Option<String>,
    pub progress: Option<String>,
    pub findings: Option<String>,
}

impl PlanSnapshot {
    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.progress.is_none() && self.findings.is_none()
    }

    /// Render as a system-prompt section.
    pub fn render(&self) -> String {
        let mut out = String::from("## Persistent plan (re-read from disk)");
        for (title, body) in [
            ("Plan", &self.plan),
            ("Progress", &self.progress),
            ("Findings", &self.findings),
        ] {
            if let Some(body) = body {
                let body = truncate_utf8(body.trim(), SECTION_MAX_BYTES);
                out.push_str(&format!("\n\n### {title}\n{body}"));
            }
        }
        out
    }
}

/// Read-mostly source of plan context.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn load(&self) -> Result<PlanSnapshot>;
}

/// Reads `task_plan.md`, `progress.md` and `findings.md` from a directory.
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    dir: PathBuf,
}

impl FilePlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.dir.join(name)).await {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn load(&self) -> Result<PlanSnapshot> {
        Ok(PlanSnapshot {
            plan: self.read_optional(PLAN_FILE).await?,
            progress: self.read_optional(PROGRESS_FILE).await?,
            findings: self.read_optional(FINDINGS_FILE).await?,
        })
    }
}
