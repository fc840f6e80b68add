// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Codetree main entry point - CLI and commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use codetree::config::{self, CliOptions, ResolvedConfig};
use codetree::coordinator::Services;
use codetree::events::{ProjectPhase, TreeEvent};
use codetree::orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle};
use codetree::providers::create_provider;
use codetree::telemetry::{init_telemetry, TelemetryConfig};
use codetree::tester::CommandTester;
use codetree::tree::AgentTree;
use codetree::workspace::LocalFileSystem;
use codetree::{LifecycleState, VERSION};

/// Codetree - a hierarchy of agents shaped like your project.
#[derive(Parser)]
#[command(name = "codetree")]
#[command(author, version, about = "A hierarchy of coding agents shaped like your project", long_about = None)]
struct Cli {
    /// Project directory the agents work in
    #[arg(short, long, default_value = ".", env = "CODETREE_ROOT")]
    root: PathBuf,

    /// Completion provider to use
    #[arg(short, long, env = "CODETREE_PROVIDER")]
    provider: Option<Provider>,

    /// Model to use
    #[arg(short, long, env = "CODETREE_MODEL")]
    model: Option<String>,

    /// Base URL for the API
    #[arg(long, env = "CODETREE_BASE_URL")]
    base_url: Option<String>,

    /// Script file for the scripted provider
    #[arg(long)]
    script: Option<PathBuf>,

    /// Maximum number of waves before giving up
    #[arg(long)]
    max_waves: Option<u32>,

    /// Test command template; `{scope}` is replaced by the directory under test
    #[arg(long)]
    test_command: Option<String>,

    /// Skip the clarification dialogue
    #[arg(long)]
    skip_clarification: bool,

    /// Show info-level logs
    #[arg(short, long)]
    verbose: bool,

    /// Show debug-level logs with span timings
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available completion providers.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Provider {
    /// OpenAI - GPT models
    Openai,
    /// Ollama - Local models
    Ollama,
    /// Any OpenAI-compatible endpoint
    Compatible,
    /// Replies replayed from a script file
    Scripted,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "openai"),
            Provider::Ollama => write!(f, "ollama"),
            Provider::Compatible => write!(f, "openai-compatible"),
            Provider::Scripted => write!(f, "scripted"),
        }
    }
}

/// Subcommands for codetree.
#[derive(Subcommand)]
enum Commands {
    /// Build a project from a brief
    Run {
        /// What the project should do
        brief: String,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show the agent tree the project directory would produce
    Tree,

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(&TelemetryConfig::from_verbosity(cli.verbose, cli.debug))?;

    let cli_options = CliOptions {
        provider: cli.provider.map(|p| p.to_string()),
        model: cli.model.clone(),
        base_url: cli.base_url.clone(),
        script: cli.script.clone(),
        max_waves: cli.max_waves,
        test_command: cli.test_command.clone(),
        skip_clarification: if cli.skip_clarification { Some(true) } else { None },
    };

    match cli.command {
        Some(command) => handle_command(command, &cli.root, cli_options).await,
        None => {
            println!("{}", "Use 'codetree run \"<brief>\"' to start a project".cyan());
            println!("{}", "Use 'codetree tree' to preview the agent tree".cyan());
            println!("{}", "Use 'codetree config show' to see the resolved configuration".cyan());
            Ok(())
        }
    }
}

async fn handle_command(command: Commands, root: &Path, cli_options: CliOptions) -> anyhow::Result<()> {
    // Config may live above the project directory.
    let config_root = config::find_workspace_root(root).unwrap_or_else(|| root.to_path_buf());

    match command {
        Commands::Run { brief } => {
            let config = config::load_config(&config_root, cli_options)?;
            run_project(root, config, &brief).await?;
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = config::load_config(&config_root, cli_options)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Some(ConfigAction::Init) => {
                let path = config::init_config(root, None)?;
                println!("Created config file: {}", path.display());
            }
        },
        Commands::Tree => {
            let config = config::load_config(&config_root, cli_options)?;
            let mut tree = AgentTree::new(config.agents.max_context_entries);
            let added = tree.populate_from_fs(&LocalFileSystem::new(root)).await?;
            println!("{}", tree.render());
            println!("{}", format!("{} agents ({added} from disk)", tree.len()).dimmed());
        }
        Commands::Version => {
            println!("codetree {}", VERSION);
        }
    }
    Ok(())
}

async fn run_project(root: &Path, config: ResolvedConfig, brief: &str) -> anyhow::Result<()> {
    let provider = create_provider(&config)?;
    let tester = CommandTester::new(config.testing.command.clone(), root)
        .with_timeout(Duration::from_secs(config.testing.timeout_secs));
    let services = Services::new(provider, Arc::new(LocalFileSystem::new(root)), Arc::new(tester));

    println!(
        "{} {} via {}",
        "→".cyan(),
        root.display().to_string().bright_white(),
        config.provider.bright_magenta()
    );

    let mut orchestrator = Orchestrator::create_project(root, services, config);
    let handle = orchestrator.handle();

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let replies = tokio::spawn(forward_replies(handle.clone()));
    let interrupt = tokio::spawn(cancel_on_ctrl_c(handle));

    let result = orchestrator.run_to_completion(brief).await;

    interrupt.abort();
    replies.abort();
    printer.abort();

    match result {
        Ok(report) => {
            println!(
                "{} converged after {} waves",
                "✓".green(),
                report.waves.to_string().bright_white()
            );
            for run in &report.runs {
                let mark = if run.passed { "✓".green() } else { "✗".red() };
                println!("  {mark} wave {} {} ({})", run.wave, run.phase, run.root_outcome.name());
            }
            Ok(())
        }
        Err(OrchestratorError::Cancelled) => {
            println!("{}", "Run cancelled".yellow());
            Ok(())
        }
        Err(err) => {
            eprintln!("{} {}", "✗".red(), err.to_string().red());
            Err(err.into())
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<TreeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("{}", format!("({skipped} events skipped)").dimmed());
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_event(event: &TreeEvent) {
    match event {
        TreeEvent::Transition(snapshot) => {
            let path = if snapshot.path.as_os_str().is_empty() {
                ".".to_string()
            } else {
                snapshot.path.display().to_string()
            };
            let state = match snapshot.state {
                LifecycleState::Completed => snapshot.state.to_string().green(),
                LifecycleState::Failed => snapshot.state.to_string().red(),
                LifecycleState::Inactive => snapshot.state.to_string().dimmed(),
                _ => snapshot.state.to_string().normal(),
            };
            println!("  {} {} {}", snapshot.role.to_string().cyan(), path, state);
        }
        TreeEvent::PhaseChanged { phase } => {
            let label = match phase {
                ProjectPhase::Converged => phase.to_string().green().bold(),
                ProjectPhase::Failed => phase.to_string().red().bold(),
                _ => phase.to_string().bright_blue().bold(),
            };
            println!("\n{} {}", "##".bright_blue(), label);
        }
        TreeEvent::HumanPromptRequested { question, .. } => {
            println!("\n{}", question.bright_white());
            println!("{}", "(type your reply and press enter)".dimmed());
        }
        TreeEvent::GuidanceRequested { diagnostics } => {
            println!("\n{}", "The root keeps failing. Any guidance?".yellow().bold());
            println!("{}", diagnostics.dimmed());
        }
        TreeEvent::WaveCompleted {
            wave,
            phase,
            passed,
            diagnostics,
        } => {
            let mark = if *passed { "✓".green() } else { "✗".red() };
            println!("{mark} wave {wave} ({phase})");
            if !passed && !diagnostics.is_empty() {
                println!("{}", diagnostics.dimmed());
            }
        }
        TreeEvent::ConvergenceFailure {
            waves,
            phase,
            diagnostics,
        } => {
            println!(
                "{}",
                format!("Gave up after {waves} waves in the {phase} phase").red().bold()
            );
            println!("{}", diagnostics.dimmed());
        }
    }
}

async fn forward_replies(handle: OrchestratorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle.submit_human_reply(line) {
            return;
        }
    }
}

async fn cancel_on_ctrl_c(handle: OrchestratorHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        println!("\n{}", "Cancelling...".yellow());
        handle.cancel();
    }
}
