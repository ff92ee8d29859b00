//! CLI entry point for Steward.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Steward agent CLI
#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Steward: run agent tasks from the terminal")]
pub struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task to completion
    Run(RunArgs),
    /// List the registered tools
    Tools,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Model to use (format: provider:model, e.g. anthropic:claude-sonnet-4-5).
    /// Falls back to the configured default model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Workspace directory the task operates in
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Replace the built-in system prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Override the step limit
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    pub json: bool,

    /// The request
    pub prompt: String,
}
