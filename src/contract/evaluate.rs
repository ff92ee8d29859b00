use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ArtifactContract, ArtifactKind};

/// What a run produced, as seen by the controller.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub files: Vec<PathBuf>,
    pub tools_used: Vec<String>,
    pub output_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractFailure {
    pub kind: ArtifactKind,
    pub reason: String,
}

/// A lower-fidelity file delivered in place of an expected kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradedOutput {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub failed: Vec<ContractFailure>,
    pub degraded: Vec<DegradedOutput>,
}

impl Evaluation {
    /// Remediation text for a failed evaluation.
    pub fn remediation(&self, downgrade_token: &str) -> Option<String> {
        if self.passed {
            return None;
        }
        let missing: Vec<String> = self.failed.iter().map(|f| f.kind.to_string()).collect();
        let mut text = format!(
            "Ask the agent to produce the missing {} in the requested format.",
            missing.join(", ")
        );
        if !self.degraded.is_empty() {
            let files: Vec<String> = self
                .degraded
                .iter()
                .map(|d| d.path.display().to_string())
                .collect();
            text.push_str(&format!(
                " To keep the substitute output ({}) instead, reply with \"{downgrade_token}\".",
                files.join(", ")
            ));
        }
        Some(text)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn has_file_of(kind: ArtifactKind, files: &[PathBuf]) -> bool {
    files.iter().any(|file| {
        extension_of(file).is_some_and(|ext| kind.extensions().contains(&ext.as_str()))
    })
}

fn used_producing_tool(kind: ArtifactKind, tools_used: &[String]) -> bool {
    tools_used.iter().any(|tool| {
        let tool = tool.to_ascii_lowercase();
        kind.producing_tools().iter().any(|marker| tool.contains(marker))
    })
}

/// Whether the reply text itself is the deliverable.
fn text_contains(kind: ArtifactKind, text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    match kind {
        ArtifactKind::Script => text.contains("```"),
        ArtifactKind::Webpage => lowered.contains("<html") || lowered.contains("<!doctype html"),
        ArtifactKind::Image => lowered.contains("<svg"),
        _ => false,
    }
}

/// Files that stand in for an expected kind at lower fidelity.
///
/// Only kinds with no real file of their own are considered.
pub fn detect_degraded_outputs(contract: &ArtifactContract, files: &[PathBuf]) -> Vec<DegradedOutput> {
    contract
        .expected()
        .iter()
        .filter(|expected| !has_file_of(expected.kind, files))
        .flat_map(|expected| {
            files
                .iter()
                .filter(|file| {
                    extension_of(file).is_some_and(|ext| {
                        expected.kind.substitute_extensions().contains(&ext.as_str())
                    })
                })
                .map(|file| DegradedOutput {
                    kind: expected.kind,
                    path: file.clone(),
                })
        })
        .collect()
}

/// Check `evidence` against `contract`.
///
/// A degraded substitute counts as delivered only when `accept_degraded` is
/// set; otherwise its kind fails with a reason naming the substitute.
pub fn evaluate(contract: &ArtifactContract, evidence: &Evidence, accept_degraded: bool) -> Evaluation {
    let degraded = detect_degraded_outputs(contract, &evidence.files);
    let mut failed = Vec::new();

    for expected in contract.expected() {
        let kind = expected.kind;
        if has_file_of(kind, &evidence.files)
            || used_producing_tool(kind, &evidence.tools_used)
            || text_contains(kind, &evidence.output_text)
        {
            continue;
        }
        let substitutes: Vec<String> = degraded
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| d.path.display().to_string())
            .collect();
        if !substitutes.is_empty() {
            if accept_degraded {
                continue;
            }
            failed.push(ContractFailure {
                kind,
                reason: format!(
                    "expected a {kind} ({}) but only a lower-fidelity substitute was produced: {}",
                    kind.extensions().join("/"),
                    substitutes.join(", ")
                ),
            });
        } else {
            failed.push(ContractFailure {
                kind,
                reason: format!(
                    "expected a {kind} ({}) but no matching file was produced and no {kind} tool was used",
                    kind.extensions().join("/")
                ),
            });
        }
    }

    Evaluation {
        passed: failed.is_empty(),
        failed,
        degraded,
    }
}
