//! Heuristic detection of files a tool call persisted.

use std::path::PathBuf;

use serde_json::Value;

use super::tool::{SideEffect, ToolContext};

const PATH_KEYS: &[&str] = &["output_path", "file_path", "path", "filepath", "filename", "saved_to"];
const WRITE_VERBS: &[&str] = &[
    "write", "save", "create", "export", "generate", "render", "download", "convert", "build",
];

/// Return the path a successful call most plausibly wrote, if any.
///
/// The result is consulted before the arguments, and only calls that write
/// (by declared side effect or by name) are considered. Paths without an
/// extension are ignored.
pub fn detect_artifact(
    tool_name: &str,
    arguments: &Value,
    result: &Value,
    side_effects: &[SideEffect],
    ctx: &ToolContext,
) -> Option<PathBuf> {
    let lowered = tool_name.to_ascii_lowercase();
    let writes = side_effects.contains(&SideEffect::FilesystemWrite)
        || WRITE_VERBS.iter().any(|verb| lowered.contains(verb));
    if !writes || result.get("success").and_then(Value::as_bool) == Some(false) {
        return None;
    }

    [result, arguments]
        .into_iter()
        .find_map(path_field)
        .map(|path| ctx.resolve(path))
}

fn path_field(value: &Value) -> Option<&str> {
    PATH_KEYS
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|path| !path.is_empty() && has_extension(path))
}

fn has_extension(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .is_some_and(|ext| !ext.is_empty())
}
