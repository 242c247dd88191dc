//! CLI entry points for local operation outside of a model host.
//!
//! The tool façade itself is transport-agnostic; `serve` is the one
//! concrete binding this binary ships: newline-delimited JSON over stdio,
//! one request object in, one response object out.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use agentmesh_term::TerminalAdapter;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::config::{RuntimeConfig, DEFAULT_MCP_DIR};
use crate::dashboard::DashboardStore;
use crate::error::Result;
use crate::ipc::Mailbox;
use crate::registry::AgentRegistry;
use crate::tools::{dispatch, ToolCall, ToolContext};

#[derive(Parser)]
#[command(name = "agentmeshd")]
#[command(about = "Multi-agent orchestration server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Project root directory
    #[arg(short, long, default_value = ".")]
    pub repo: PathBuf,

    /// Session id to operate on
    #[arg(short, long, default_value = "default")]
    pub session: String,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the on-disk layout and pane grid for a new session
    Init {
        #[arg(long, default_value_t = 2)]
        workers: u32,
        #[arg(long)]
        no_git: bool,
    },

    /// Run the tool-call loop over stdio
    Serve,

    /// Print a one-line status summary
    Status,

    /// Render or print the dashboard
    Dashboard {
        #[command(subcommand)]
        action: DashboardAction,
    },
}

#[derive(Subcommand)]
pub enum DashboardAction {
    /// Print the rendered markdown dashboard
    Show,
}

/// Holds everything a CLI subcommand needs, built once from `Cli`.
pub struct CliRunner {
    ctx: ToolContext,
}

impl CliRunner {
    pub async fn new(cli: &Cli, terminal: Arc<dyn TerminalAdapter>) -> Result<Self> {
        let project_root = cli.repo.canonicalize().unwrap_or_else(|_| cli.repo.clone());
        let runtime = RuntimeConfig::load(&project_root).await?;
        let session_dir = runtime.session_dir(&project_root, &cli.session);

        let registry = AgentRegistry::new(
            session_dir.clone(),
            runtime.global_registry_dir(),
            project_root.clone(),
            cli.session.clone(),
        );
        let dashboard = DashboardStore::new(session_dir.clone());
        let mailbox = Mailbox::new(session_dir.clone());

        Ok(Self {
            ctx: ToolContext {
                project_root,
                session_id: cli.session.clone(),
                runtime,
                registry,
                dashboard,
                mailbox,
                terminal,
            },
        })
    }

    pub async fn run(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Init { workers, no_git } => self.run_init(*workers, *no_git).await,
            Commands::Serve => self.run_serve().await,
            Commands::Status => self.run_status().await,
            Commands::Dashboard { action } => self.run_dashboard(action).await,
        }
    }

    async fn run_init(&self, workers: u32, no_git: bool) -> Result<()> {
        let response = dispatch(
            &self.ctx,
            ToolCall {
                tool: "init_tmux_workspace".into(),
                caller_agent_id: None,
                args: serde_json::json!({ "worker_count": workers, "enable_git": !no_git }),
            },
        )
        .await;
        println!("{}", serde_json::to_string_pretty(&response.data)?);
        Ok(())
    }

    async fn run_status(&self) -> Result<()> {
        let agents = self.ctx.registry.list().await?;
        let tasks = self.ctx.dashboard.list_tasks().await.unwrap_or_default();
        println!(
            "session {}: {} agents, {} tasks ({} in progress)",
            self.ctx.session_id,
            agents.len(),
            tasks.len(),
            tasks.iter().filter(|t| t.status == crate::dashboard::TaskStatus::InProgress).count(),
        );
        Ok(())
    }

    async fn run_dashboard(&self, action: &DashboardAction) -> Result<()> {
        match action {
            DashboardAction::Show => {
                println!("{}", self.ctx.dashboard.render_file_contents().await?);
            }
        }
        Ok(())
    }

    /// Newline-delimited JSON loop: one request object per line in, one
    /// response object per line out. Malformed input produces a single
    /// error response rather than terminating the loop.
    async fn run_serve(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        info!(session_id = %self.ctx.session_id, "serving tool calls over stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ToolCall>(&line) {
                Ok(call) => dispatch(&self.ctx, call).await,
                Err(e) => {
                    error!(error = %e, "malformed tool call");
                    crate::tools::ToolResponse::malformed(&e.to_string())
                }
            };
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok(())
    }
}

/// Print a one-time startup banner to stderr, matching the teacher's
/// compact tracing setup.
pub fn print_banner(version: &str) {
    let _ = writeln!(std::io::stderr(), "agentmeshd {version} — MCP_DIR={DEFAULT_MCP_DIR}");
}
