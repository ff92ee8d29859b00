//! Artifact contracts: which deliverables a request implies, and whether a
//! finished run actually produced them.

pub mod evaluate;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub use evaluate::{
    detect_degraded_outputs, evaluate, ContractFailure, DegradedOutput, Evaluation, Evidence,
};

/// A deliverable format a request can ask for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    Presentation,
    Spreadsheet,
    Document,
    Pdf,
    Image,
    Webpage,
    Script,
}

impl ArtifactKind {
    const ALL: [ArtifactKind; 7] = [
        Self::Presentation,
        Self::Spreadsheet,
        Self::Document,
        Self::Pdf,
        Self::Image,
        Self::Webpage,
        Self::Script,
    ];

    /// File extensions that satisfy this kind.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Presentation => &["pptx", "ppt", "key", "odp"],
            Self::Spreadsheet => &["xlsx", "xls", "ods", "csv"],
            Self::Document => &["docx", "doc", "odt", "rtf", "pages"],
            Self::Pdf => &["pdf"],
            Self::Image => &["png", "jpg", "jpeg", "gif", "svg", "webp"],
            Self::Webpage => &["html", "htm"],
            Self::Script => &["py", "js", "ts", "sh", "rb", "go", "rs", "ps1"],
        }
    }

    /// Lower-fidelity formats sometimes delivered in place of this kind.
    pub fn substitute_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Presentation => &["md", "txt", "html"],
            Self::Spreadsheet => &["md", "txt", "json"],
            Self::Document => &["md", "txt", "html"],
            Self::Pdf => &["md", "txt", "html", "docx"],
            Self::Image => &["txt", "csv", "html"],
            Self::Webpage => &["md", "txt"],
            Self::Script => &["md", "txt"],
        }
    }

    /// Substrings of tool names that produce this kind.
    pub fn producing_tools(self) -> &'static [&'static str] {
        match self {
            Self::Presentation => &["presentation", "pptx", "slides"],
            Self::Spreadsheet => &["spreadsheet", "xlsx", "excel"],
            Self::Document => &["docx", "word_document", "create_document"],
            Self::Pdf => &["pdf"],
            Self::Image => &["chart", "image", "plot", "diagram", "screenshot"],
            Self::Webpage => &["html", "webpage", "website"],
            Self::Script => &["create_script", "write_script"],
        }
    }

    fn request_pattern(self) -> &'static str {
        match self {
            Self::Presentation => r"(?i)\b(slide ?decks?|slides|presentations?|pptx|power ?point|keynote)\b",
            Self::Spreadsheet => r"(?i)\b(spreadsheets?|excel|xlsx|workbooks?|csv)\b",
            Self::Document => r"(?i)\b(word doc(ument)?s?|docx|document file)\b",
            Self::Pdf => r"(?i)\bpdfs?\b",
            Self::Image => r"(?i)\b(charts?|graphs?|plots?|diagrams?|infographics?|png|jpe?g)\b",
            Self::Webpage => r"(?i)\b(web ?pages?|landing pages?|html pages?|websites?)\b",
            Self::Script => r"(?i)\b(scripts?|python file|\.py|shell script)\b",
        }
    }
}

/// One deliverable the request implies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpectedArtifact {
    pub kind: ArtifactKind,
    pub description: String,
    /// What in the request implied this deliverable.
    pub reason: String,
}

/// Immutable list of expected artifacts for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactContract {
    expected: Vec<ExpectedArtifact>,
}

impl ArtifactContract {
    pub fn new(expected: Vec<ExpectedArtifact>) -> Self {
        Self { expected }
    }

    pub fn expected(&self) -> &[ExpectedArtifact] {
        &self.expected
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }
}

struct Rules {
    intent: Regex,
    kinds: Vec<(ArtifactKind, Regex)>,
}

const INTENT_PATTERN: &str = r"(?i)\b(create|make|generate|build|produce|write|draft|prepare|export|save|design|render|convert|put together|turn)\b";

fn rules() -> Option<&'static Rules> {
    static RULES: OnceLock<Option<Rules>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            let intent = Regex::new(INTENT_PATTERN).ok()?;
            let kinds = ArtifactKind::ALL
                .iter()
                .filter_map(|kind| Regex::new(kind.request_pattern()).ok().map(|re| (*kind, re)))
                .collect();
            Some(Rules { intent, kinds })
        })
        .as_ref()
}

/// Infer the deliverables `request` asks for.
///
/// Only requests with creation intent ("create", "generate", ...) produce a
/// contract; mentioning a format while asking a question does not.
pub fn build_contract(request: &str) -> ArtifactContract {
    let Some(rules) = rules() else {
        return ArtifactContract::default();
    };
    let Some(verb) = rules.intent.find(request) else {
        return ArtifactContract::default();
    };

    let expected = rules
        .kinds
        .iter()
        .filter_map(|(kind, re)| {
            let mention = re.find(request)?;
            Some(ExpectedArtifact {
                kind: *kind,
                description: format!("{kind} ({})", kind.extensions().join(", ")),
                reason: format!(
                    "request asks to {} and mentions \"{}\"",
                    verb.as_str().to_lowercase(),
                    mention.as_str()
                ),
            })
        })
        .collect();
    ArtifactContract::new(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slide_deck_request_implies_presentation() {
        let contract = build_contract("Generate a slide deck about Q3 results");
        let kinds: Vec<_> = contract.expected().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Presentation]);
        assert!(contract.expected()[0].reason.contains("slide deck"));
    }

    #[test]
    fn multiple_kinds_are_detected_in_order() {
        let contract = build_contract("Build a spreadsheet of the numbers and export a PDF summary with a chart");
        let kinds: Vec<_> = contract.expected().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ArtifactKind::Spreadsheet, ArtifactKind::Pdf, ArtifactKind::Image]
        );
    }

    #[test]
    fn questions_about_formats_imply_nothing() {
        assert!(build_contract("What is the difference between a PDF and a slide deck?").is_empty());
        assert!(build_contract("Summarize the attached spreadsheet").is_empty());
    }
}
