//! Steward CLI binary entry point.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use steward::agent_loop::{
    AgentController, TaskEventPayload, TaskRequest, TaskStatus, WorkspaceContext,
};
use steward::cli::{Cli, Commands, RunArgs};
use steward::config::StewardConfig;
use steward::models::ModelConfig;
use steward::tools::ToolRegistry;
use steward::util::text::snippet;
use tokio::io::AsyncBufReadExt;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "steward=debug" } else { "steward=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Commands::Run(args) => handle_run(config, args).await,
            Commands::Tools => handle_tools(),
        },
        Err(err) => Err(err),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<StewardConfig, Box<dyn std::error::Error>> {
    Ok(StewardConfig::load(cli.config.as_deref())?)
}

fn builtin_registry() -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    steward::tools::builtin::register_builtins(&registry);
    registry
}

fn handle_tools() -> Result<(), Box<dyn std::error::Error>> {
    for def in builtin_registry().definitions() {
        println!("{:<20} {}", def.name, def.description);
    }
    Ok(())
}

async fn handle_run(
    mut config: StewardConfig,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let model = args
        .model
        .or_else(|| config.default_model().map(String::from))
        .ok_or("no model given: pass --model provider:model or set STEWARD_MODEL")?;
    let model: ModelConfig = model.parse()?;
    if let Some(max_steps) = args.max_steps {
        config.agent.max_steps = max_steps;
    }

    let controller = Arc::new(AgentController::new(config, builtin_registry())?);
    let request = TaskRequest::builder()
        .prompt(args.prompt)
        .model(model)
        .maybe_system_prompt(args.system)
        .maybe_workspace(args.workspace.map(WorkspaceContext::new))
        .build();
    let mut handle = controller.start(request)?;
    let task_id = handle.task_id().to_string();

    while let Some(event) = handle.next_event().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event.payload);
        }
        if let TaskEventPayload::Suspended { notice } = &event.payload {
            if notice.condition == "manual" {
                eprintln!("\n⏸ {} (press Enter once done)", notice.message);
                let controller = controller.clone();
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    let mut line = String::new();
                    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
                    if stdin.read_line(&mut line).await.is_ok() {
                        let _ = controller.resume(&task_id, "user confirmed");
                    }
                });
            }
        }
    }

    let result = handle.wait().await;
    println!();
    match result.status {
        TaskStatus::Finished => {
            for artifact in &result.artifacts {
                eprintln!("📄 {}", artifact.display());
            }
            Ok(())
        }
        TaskStatus::Failed | TaskStatus::Canceled => {
            let mut message = result.error.unwrap_or_else(|| "task failed".into());
            if let Some(remediation) = result.remediation {
                message.push_str(&format!("\n{remediation}"));
            }
            Err(message.into())
        }
    }
}

fn print_event(payload: &TaskEventPayload) {
    match payload {
        TaskEventPayload::TextDelta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        TaskEventPayload::ToolCall {
            call_id, tool_name, ..
        } => {
            eprintln!("\n⚡ {tool_name} ({call_id})");
        }
        TaskEventPayload::ToolResult {
            result, is_error, ..
        } => {
            let output = snippet(&result.to_string(), 200);
            if *is_error {
                eprintln!("  ❌ {output}");
            } else {
                eprintln!("  ✅ {output}");
            }
        }
        TaskEventPayload::Status { message } => eprintln!("  ℹ {message}"),
        TaskEventPayload::StreamRestarted { attempt } => {
            eprintln!("\n↻ connection dropped; retrying the response (attempt {attempt})")
        }
        TaskEventPayload::Resumed { reason, .. } => eprintln!("▶ resumed ({reason})"),
        TaskEventPayload::Failed { error, .. } => eprintln!("\n❌ {error}"),
        _ => {}
    }
}
