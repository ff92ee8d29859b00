//! Stop gate: one verification turn before accepting an unverified "done".

use std::sync::Arc;

use regex::Regex;

pub(crate) const VERIFICATION_PROMPT: &str = "Before finishing, verify the result. \
Use a tool to check that the work you described actually exists and is correct \
(for example read back the file, list the output directory, or inspect the page). \
Then give your final answer.";

const VERIFYING_TOOL_MARKERS: &[&str] = &[
    "read", "get", "list", "check", "verify", "screenshot", "search", "status", "inspect", "stat",
];

/// What happened during the current run, as far as the gate cares.
#[derive(Debug, Clone, Default)]
pub struct RunActivity {
    /// Tool calls of this run, in order, with their error flag.
    pub calls: Vec<(String, bool)>,
}

impl RunActivity {
    pub fn record(&mut self, tool_name: &str, is_error: bool) {
        self.calls.push((tool_name.to_string(), is_error));
    }

    /// A successful observational call happened in this run.
    pub fn has_verification(&self) -> bool {
        self.calls.iter().any(|(name, is_error)| {
            !is_error && {
                let name = name.to_ascii_lowercase();
                VERIFYING_TOOL_MARKERS.iter().any(|m| name.contains(m))
            }
        })
    }
}

/// Decides whether a final answer claims completion without evidence.
pub trait CompletionDetector: Send + Sync {
    fn needs_verification(&self, final_text: &str, activity: &RunActivity) -> bool;
}

/// Keyword heuristic: a completion claim, no verification tool call, and no
/// statement of having verified.
pub struct RegexCompletionDetector {
    claim: Option<Regex>,
    verified: Option<Regex>,
}

impl Default for RegexCompletionDetector {
    fn default() -> Self {
        Self {
            claim: Regex::new(
                r"(?i)\b(done|completed?|finished|all set|successfully|task complete|have (created|written|saved|sent|posted|updated|generated))\b",
            )
            .ok(),
            verified: Regex::new(r"(?i)\b(verified|i checked|confirmed|double-checked)\b").ok(),
        }
    }
}

impl CompletionDetector for RegexCompletionDetector {
    fn needs_verification(&self, final_text: &str, activity: &RunActivity) -> bool {
        let Some(claim) = &self.claim else {
            return false;
        };
        if !claim.is_match(final_text) || activity.has_verification() {
            return false;
        }
        !self
            .verified
            .as_ref()
            .is_some_and(|re| re.is_match(final_text))
    }
}

/// Per-run gate: at most one verification turn.
pub(crate) struct StopGate {
    detector: Arc<dyn CompletionDetector>,
    used: bool,
}

impl StopGate {
    pub(crate) fn new(detector: Arc<dyn CompletionDetector>) -> Self {
        Self {
            detector,
            used: false,
        }
    }

    /// True when the run should get one more turn to verify.
    pub(crate) fn request_verification(&mut self, final_text: &str, activity: &RunActivity) -> bool {
        if self.used || !self.detector.needs_verification(final_text, activity) {
            return false;
        }
        self.used = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> StopGate {
        StopGate::new(Arc::new(RegexCompletionDetector::default()))
    }

    #[test]
    fn unverified_claim_gets_exactly_one_turn() {
        let mut gate = gate();
        let activity = RunActivity::default();
        assert!(gate.request_verification("Done! The report is saved.", &activity));
        assert!(!gate.request_verification("Done! The report is saved.", &activity));
    }

    #[test]
    fn verification_call_or_statement_is_evidence() {
        let mut activity = RunActivity::default();
        activity.record("write_file", false);
        assert!(gate().request_verification("I have created the file.", &activity));

        activity.record("read_file", false);
        assert!(!gate().request_verification("I have created the file.", &activity));

        let failed = RunActivity {
            calls: vec![("read_file".into(), true)],
        };
        assert!(gate().request_verification("Task complete.", &failed));
        assert!(!gate().request_verification("Task complete, I checked the output.", &failed));
    }

    #[test]
    fn answers_without_a_claim_pass() {
        assert!(!gate().request_verification("The capital of France is Paris.", &RunActivity::default()));
    }
}
