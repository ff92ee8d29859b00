//! Built-in workspace tools and inert stubs.
//!
//! `read_file`, `write_file` and `list_directory` resolve relative paths
//! against the task workspace. Stubs stand in for capabilities the host has
//! not connected yet so the model gets a clear error instead of an unknown
//! tool.

use std::sync::Arc;

use serde_json::json;

use super::registry::{ToolRegistry, ToolSource};
use super::schema::ToolSchema;
use super::tool::{FnTool, SideEffect, Tool, ToolContext};
use crate::error::StewardError;
use crate::util::text::truncate_utf8;

const READ_FILE_MAX_BYTES: usize = 65_536;
const LIST_MAX_ENTRIES: usize = 500;

fn exec_error(tool: &str, message: impl Into<String>) -> StewardError {
    StewardError::ToolExecution {
        tool_name: tool.into(),
        message: message.into(),
    }
}

/// Read a UTF-8 text file, capped at 64 KB.
pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        "read_file",
        "Read a file's contents as UTF-8 text",
        ToolSchema::object()
            .string("path", "Path to the file, relative to the workspace", true)
            .build(),
        |args, ctx: ToolContext| async move {
            let path = ctx.resolve(args.get_str("path")?);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| exec_error("read_file", format!("{}: {e}", path.display())))?;

            let total_bytes = content.len();
            let truncated = total_bytes > READ_FILE_MAX_BYTES;
            let content = if truncated {
                format!("{}\n... (truncated)", truncate_utf8(&content, READ_FILE_MAX_BYTES))
            } else {
                content
            };
            Ok(json!({
                "content": content,
                "bytes": total_bytes,
                "truncated": truncated,
            }))
        },
    ))
}

/// Write a file, creating parent directories.
pub fn write_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        FnTool::new(
            "write_file",
            "Write content to a file, creating parent directories if needed",
            ToolSchema::object()
                .string("path", "Path to the file, relative to the workspace", true)
                .string("content", "Content to write", true)
                .build(),
            |args, ctx: ToolContext| async move {
                let path = ctx.resolve(args.get_str("path")?);
                let content = args.get_str("content")?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        exec_error("write_file", format!("{}: {e}", parent.display()))
                    })?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| exec_error("write_file", format!("{}: {e}", path.display())))?;
                Ok(json!({
                    "success": true,
                    "path": path.display().to_string(),
                    "bytes_written": content.len(),
                }))
            },
        )
        .with_side_effects([SideEffect::FilesystemWrite]),
    )
}

/// List directory entries (name, type, size), sorted by name.
pub fn list_directory_tool() -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        "list_directory",
        "List files and directories in a given path",
        ToolSchema::object()
            .string("path", "Directory to list, relative to the workspace (default '.')", false)
            .build(),
        |args, ctx: ToolContext| async move {
            let path = ctx.resolve(args.get_str_opt("path").unwrap_or("."));
            let mut read_dir = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| exec_error("list_directory", format!("{}: {e}", path.display())))?;

            let mut entries = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| exec_error("list_directory", e.to_string()))?
            {
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| exec_error("list_directory", e.to_string()))?;
                let kind = if metadata.is_dir() {
                    "dir"
                } else if metadata.is_file() {
                    "file"
                } else {
                    "other"
                };
                entries.push((
                    entry.file_name().to_string_lossy().into_owned(),
                    kind,
                    metadata.len(),
                ));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let count = entries.len();
            let listed: Vec<_> = entries
                .into_iter()
                .take(LIST_MAX_ENTRIES)
                .map(|(name, kind, size)| json!({ "name": name, "type": kind, "size": size }))
                .collect();
            Ok(json!({
                "path": path.display().to_string(),
                "entries": listed,
                "count": count,
            }))
        },
    ))
}

/// An inert placeholder that always fails with a "not connected" error.
pub fn stub_tool(name: &str, description: &str) -> Arc<dyn Tool> {
    let tool_name = name.to_string();
    Arc::new(FnTool::new(
        name,
        format!("{description} (not connected)"),
        ToolSchema::empty(),
        move |_, _| {
            let tool_name = tool_name.clone();
            async move {
                Err(exec_error(
                    &tool_name,
                    "this capability is not connected in the current host",
                ))
            }
        },
    ))
}

/// Return all built-in workspace tools.
pub fn all_tools() -> Vec<Arc<dyn Tool>> {
    vec![read_file_tool(), write_file_tool(), list_directory_tool()]
}

/// Register the built-ins on `registry`.
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register_all(ToolSource::Builtin, all_tools());
}
