//! `fleetforge run` — CLI entry point (§6.1).
//!
//! One-shot invocation: build the wiring (tool bridge, config, tracker,
//! executor, supervisor), call `Supervisor::execute`, and map the
//! `RunSummary`/error to the exit codes the component design specifies.

use clap::Parser;
use fleetforge::config::{Config, ConfigHandle};
use fleetforge::events::{Event, EventSink};
use fleetforge::executor::AgentExecutor;
use fleetforge::supervisor::{RunMode, Supervisor, SupervisorState};
use fleetforge::tool_bridge::{RemoteToolBridge, ToolBridge};
use fleetforge::tracker::RunTracker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "fleetforge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run planning, and optionally the full implementation loop, for one project.
    Run {
        #[arg(long)]
        project_id: String,
        /// Implement mode: run the full Coding/Testing/Review loop, not just planning.
        #[arg(long)]
        apply: bool,
        /// Implement only this issue, in its correct prioritized position.
        #[arg(long)]
        issue: Option<u64>,
        /// Resume from the latest checkpoint under logs/runs/.
        #[arg(long)]
        resume: bool,
        /// Widen logging to debug! and include tracebacks in error output.
        #[arg(long)]
        debug: bool,
    },
}

/// Prints every emitted event as a plain-text log line; used in place of the
/// WebSocket hub when driving a run from the CLI.
struct StdoutSink {
    debug: bool,
}

impl EventSink for StdoutSink {
    fn emit(&self, event: Event) {
        match event {
            Event::SystemStatus { running, current_stage, current_agent, current_issue, current_branch } => {
                log::info!(
                    "status running={} stage={:?} agent={:?} issue={:?} branch={:?}",
                    running, current_stage, current_agent, current_issue, current_branch
                );
            }
            Event::AgentOutput { agent, content, .. } => println!("[{}] {}", agent, content),
            Event::PipelineUpdate { stage, status, details } => {
                log::info!("pipeline {:?} -> {:?} {}", stage, status, details);
            }
            Event::McpLog { message, level } => log::debug!("[tool:{}] {}", level, message),
            Event::Error { message, traceback } => {
                if self.debug {
                    log::error!("{} (traceback: {:?})", message, traceback);
                } else {
                    log::error!("{}", message);
                }
            }
        }
    }
}

fn logs_root() -> std::path::PathBuf {
    std::env::var("FLEETFORGE_LOGS_ROOT").map(std::path::PathBuf::from).unwrap_or_else(|_| std::path::PathBuf::from("logs"))
}

fn tool_bridge_endpoint() -> String {
    std::env::var("TOOL_BRIDGE_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8787".to_string())
}

/// Finds the most recently created run directory under `logs/runs/` by
/// picking the lexicographically greatest directory name (run IDs are
/// timestamp-prefixed so this also orders them chronologically).
async fn latest_run_id(logs_root: &std::path::Path) -> Option<String> {
    let runs_dir = logs_root.join("runs");
    let mut entries = tokio::fs::read_dir(&runs_dir).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    names.pop()
}

fn new_run_id(project_id: &str) -> String {
    format!("run-{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"), fleetforge::issue_manager::slugify(project_id))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Command::Run { project_id, apply, issue, resume, debug } = cli.command;

    let log_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let logs_root = logs_root();
    let run_id = if resume {
        match latest_run_id(&logs_root).await {
            Some(id) => id,
            None => new_run_id(&project_id),
        }
    } else {
        new_run_id(&project_id)
    };

    let tool_bridge: Arc<dyn ToolBridge> = Arc::new(RemoteToolBridge::new(tool_bridge_endpoint(), 60));
    let config = ConfigHandle::new(Config::from_env());
    let tracker = Arc::new(RunTracker::new());
    let executor = Arc::new(AgentExecutor::new(tool_bridge.clone(), config.clone(), tracker.clone()));
    let sink: Arc<dyn EventSink> = Arc::new(StdoutSink { debug });

    let supervisor = Supervisor::new(project_id, run_id, tool_bridge, executor, logs_root, config, sink);

    let ctx = CancellationToken::new();
    let ctx_for_signal = ctx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::warn!("received interrupt, cancelling run");
        ctx_for_signal.cancel();
    });

    let mode = if apply || issue.is_some() { RunMode::Implement } else { RunMode::Analyze };

    let exit_code = match supervisor.execute(mode, issue, resume, ctx.clone()).await {
        Ok(summary) => {
            println!(
                "run finished: state={:?} completed={:?} failed={:?}",
                summary.state, summary.completed_issues, summary.failed_issues
            );
            if summary.cancelled {
                130
            } else if summary.state == SupervisorState::Failed {
                2
            } else if !summary.failed_issues.is_empty() {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            2
        }
    };

    std::process::exit(exit_code);
}
