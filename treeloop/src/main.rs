//! Command-line driver for the node-tree execution engine.
//!
//! `treeloop run` plays one session from a scenario file, printing every
//! event to stdout as a JSON line and answering approval requests from a
//! policy. `treeloop validate` checks an exported snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use treeloop::collab::{Executor, Planner};
use treeloop::core::types::{SessionId, ToolCallId};
use treeloop::events::{Event, EventKind};
use treeloop::exit_codes;
use treeloop::io::config::{EngineConfig, load_config, write_config};
use treeloop::io::scenario::load_scenario;
use treeloop::io::snapshot_store::write_snapshot;
use treeloop::orchestrator::{LoopStop, Orchestrator};
use treeloop::session::SessionRegistry;
use treeloop::tools::CallSyntaxExecutor;
use treeloop::validate::validate_snapshot_file;

#[derive(Parser)]
#[command(
    name = "treeloop",
    version,
    about = "Expand a task into a tree, execute it, and gate tool calls behind approval"
)]
struct Cli {
    /// Debug-level diagnostics on stderr (ignored when `RUST_LOG` is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session from a scenario file and stream its events.
    Run {
        /// Scenario TOML (plan, expansions, extra tools).
        #[arg(long)]
        scenario: PathBuf,
        /// The user message that starts the session.
        #[arg(long)]
        message: String,
        /// Engine config TOML. Defaults apply when omitted or missing.
        #[arg(long)]
        config: Option<PathBuf>,
        /// How approval requests are answered.
        #[arg(long, value_enum, default_value_t = ApprovePolicy::Prompt)]
        approve: ApprovePolicy,
        /// Write the final tree snapshot here.
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
    },
    /// Check a snapshot against the schema and tree invariants.
    Validate {
        #[arg(long)]
        snapshot: PathBuf,
    },
    /// Write an engine config with default values.
    InitConfig {
        #[arg(long, default_value = "treeloop.toml")]
        path: PathBuf,
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApprovePolicy {
    /// Approve every request.
    Auto,
    /// Reject every request.
    Deny,
    /// Ask on stderr and read `y`/`n` from stdin.
    Prompt,
}

fn main() {
    let cli = Cli::parse();
    treeloop::logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            scenario,
            message,
            config,
            approve,
            snapshot_out,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("start tokio runtime")?;
            runtime.block_on(cmd_run(RunArgs {
                scenario,
                message,
                config,
                approve,
                snapshot_out,
            }))
        }
        Command::Validate { snapshot } => cmd_validate(&snapshot),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

struct RunArgs {
    scenario: PathBuf,
    message: String,
    config: Option<PathBuf>,
    approve: ApprovePolicy,
    snapshot_out: Option<PathBuf>,
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let scenario = load_scenario(&args.scenario)?;
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Default::default(),
    };

    let planner: Arc<dyn Planner> = Arc::new(scenario.planner());
    let executor: Arc<dyn Executor> = Arc::new(CallSyntaxExecutor::new(scenario.tool_table()));
    let session_id = SessionId::generate();
    let mut orchestrator = Orchestrator::new(session_id.clone(), planner, executor, config);

    let registry = Arc::new(SessionRegistry::new());
    let handle = orchestrator.handle();
    registry.insert(handle.clone())?;

    let (subscription, rx) = handle.subscribe_channel();
    let relay = tokio::spawn(relay_events(
        rx,
        Arc::clone(&registry),
        session_id.clone(),
        args.approve,
    ));

    {
        let registry = Arc::clone(&registry);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = registry.cancel(&session_id);
            }
        });
    }

    let result = orchestrator.handle_message(&args.message).await;

    handle.unsubscribe(subscription);
    relay.await.context("join event relay")??;
    registry.remove(&session_id);

    if let Some(path) = &args.snapshot_out {
        write_snapshot(path, &orchestrator.snapshot())?;
    }

    let outcome = result.context("session failed")?;
    debug!(steps = outcome.steps_executed, stop = ?outcome.stop, "session finished");
    Ok(match outcome.stop {
        LoopStop::Complete => exit_codes::OK,
        LoopStop::NoEligibleNode | LoopStop::MaxIterationsExceeded { .. } => exit_codes::INCOMPLETE,
        LoopStop::Cancelled => exit_codes::CANCELLED,
    })
}

/// Print events as JSON lines and answer approval requests.
async fn relay_events(
    mut rx: mpsc::UnboundedReceiver<Event>,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    policy: ApprovePolicy,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_string(&event).context("serialize event")?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("write event")?;
        stdout.flush().await.context("flush stdout")?;

        if event.kind != EventKind::ApprovalRequest {
            continue;
        }
        let Some(tool_call_id) = event.content["tool_call"]["id"].as_str() else {
            warn!("approval request without a tool call id");
            continue;
        };
        let approved = match policy {
            ApprovePolicy::Auto => true,
            ApprovePolicy::Deny => false,
            ApprovePolicy::Prompt => {
                let description = event.content["tool_call"]["description"]
                    .as_str()
                    .unwrap_or(tool_call_id);
                eprint!("approve '{description}'? [y/N] ");
                let answer = stdin.next_line().await.context("read approval answer")?;
                is_yes(answer.as_deref().unwrap_or_default())
            }
        };
        let tool_call_id = ToolCallId::from(tool_call_id);
        match registry.resolve_approval(&session_id, &tool_call_id, approved) {
            Ok(outcome) => debug!(%tool_call_id, approved, ?outcome, "approval answered"),
            Err(err) => warn!(%tool_call_id, error = %err, "approval answer not applied"),
        }
    }
    Ok(())
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let outcome = validate_snapshot_file(path)?;
    let mut payload = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
    payload.push('\n');
    print!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        eprintln!("{} already exists (pass --force to replace it)", path.display());
        return Ok(exit_codes::INVALID);
    }
    write_config(path, &EngineConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}
