// ABOUTME: Main entry point for the parley orchestrator: serve over HTTP or run turns from the terminal
// ABOUTME: Loads .env and parley.toml, sets up logging, then dispatches the clap subcommand

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley::{app, cli, logging, server};
use parley_core::config::Config;
use parley_core::{NewSession, PermissionMode, TurnEvent, TurnRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// parley - streaming conversation orchestrator for Claude agent turns
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server with SSE turn streams
    Serve {
        /// Host to bind to (overrides config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message to a session and stream the reply
    Chat {
        /// Session ID
        session: String,

        /// Message text
        message: String,

        /// Files to attach (repeatable)
        #[arg(long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,

        /// Agent profile to use for this turn
        #[arg(long)]
        agent: Option<String>,

        /// Permission mode for this turn [default, bypass, auto, plan]
        #[arg(long)]
        mode: Option<PermissionMode>,

        /// Skills to sync before the turn (repeatable, replaces the session's list)
        #[arg(long = "skill", value_name = "SKILL_ID")]
        skills: Vec<String>,
    },

    /// Manage chat sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage agent profiles
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// Create a session and print its ID
    New {
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        agent: Option<String>,

        #[arg(long, default_value = "default")]
        mode: PermissionMode,

        /// Keep every turn in plan mode
        #[arg(long)]
        plan: bool,

        #[arg(long = "skill", value_name = "SKILL_ID")]
        skills: Vec<String>,

        #[arg(long)]
        system_prompt: Option<String>,

        #[arg(long)]
        working_dir: Option<String>,
    },
    /// List sessions, most recently updated first
    List,
    /// Print a session transcript
    Show { session: String },
}

#[derive(Subcommand, Debug)]
enum AgentAction {
    /// Add or replace an agent profile from a TOML file
    Add { file: PathBuf },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Config::load()?;
    let _log_guard = logging::init_logging(&config.logging)?;

    tracing::debug!(
        workspace = %config.workspace.path,
        engine = %config.engine.engine_type,
        "Configuration loaded"
    );

    let store = app::open_store(&config)?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let metrics_handle = if config.server.metrics {
                Some(
                    parley_core::metrics::init_metrics()
                        .context("Failed to initialize Prometheus metrics")?,
                )
            } else {
                None
            };
            let orchestrator = Arc::new(app::build_orchestrator(&config, store)?);
            server::serve(
                orchestrator,
                &host,
                port,
                Duration::from_secs(config.server.keep_alive_secs),
                metrics_handle,
            )
            .await?;
        }
        Commands::Chat {
            session,
            message,
            attachments,
            agent,
            mode,
            skills,
        } => {
            let mut request = TurnRequest::new(session, message)
                .with_overrides(cli::overrides(agent, mode, skills));
            for path in &attachments {
                request = request.with_attachment(cli::read_attachment(path)?);
            }

            let orchestrator = app::build_orchestrator(&config, store)?;
            let terminal = cli::chat(&orchestrator, request).await?;
            orchestrator.shutdown().await;
            if !matches!(terminal, Some(TurnEvent::Done { .. })) {
                return Ok(std::process::ExitCode::FAILURE);
            }
        }
        Commands::Session { action } => match action {
            SessionAction::New {
                title,
                agent,
                mode,
                plan,
                skills,
                system_prompt,
                working_dir,
            } => {
                let session = cli::new_session(
                    store.as_ref(),
                    NewSession {
                        title,
                        skill_ids: skills,
                        agent_id: agent,
                        custom_system_prompt: system_prompt,
                        permission_mode: mode,
                        plan_mode: plan,
                        working_dir,
                    },
                )
                .await?;
                println!("{}", session.id);
            }
            SessionAction::List => {
                let mut stdout = std::io::stdout();
                for session in store.list_sessions()? {
                    cli::print_session_row(&session, &mut stdout)?;
                }
            }
            SessionAction::Show { session } => {
                cli::show_session(store.as_ref(), &session, &mut std::io::stdout()).await?;
            }
        },
        Commands::Agent { action } => match action {
            AgentAction::Add { file } => {
                let agent = cli::add_agent(store.as_ref(), &file).await?;
                println!("{}", agent.id);
            }
        },
    }

    Ok(std::process::ExitCode::SUCCESS)
}
