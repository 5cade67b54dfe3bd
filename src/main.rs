use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use triage::config::{DEFAULT_CONFIG_FILE, TriageConfig, load_dotenv};

mod cmd;

#[derive(Parser)]
#[command(name = "triage")]
#[command(version, about = "Daily triage orchestrator for GitHub activity")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to triage.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline once and deliver the brief
    Run {
        /// Workspace to run (defaults to the first configured)
        #[arg(short, long)]
        workspace: Option<String>,

        /// Run on behalf of a member; resolves their workspace
        #[arg(long, conflicts_with = "workspace")]
        user: Option<String>,
    },
    /// Serve the HTTP boundary and fire runs on each workspace's cron
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Deliver a brief stored by an earlier run
    Deliver {
        brief_id: String,
    },
    /// Record an interaction with a delivered brief
    Feedback {
        #[arg(long)]
        run: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        item: String,
        /// CLICKED_LINK, REPLIED_THREAD or DISMISSED
        #[arg(long)]
        action: String,
    },
    /// Show optimization suggestions from recent feedback
    Suggest {
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// List recent runs, or the decisions of one run
    History {
        #[arg(short, long)]
        workspace: Option<String>,

        /// Show the decisions made in this run
        #[arg(long)]
        run: Option<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a starter triage.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    load_dotenv();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let config = TriageConfig::load_or_default(&cli.config)?;
    let _guard = triage::telemetry::init(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Run { workspace, user } => {
            cmd::cmd_run(config, workspace.as_deref(), user.as_deref()).await?
        }
        Commands::Serve { port } => cmd::cmd_serve(config, *port).await?,
        Commands::Deliver { brief_id } => cmd::cmd_deliver(config, brief_id).await?,
        Commands::Feedback {
            run,
            user,
            item,
            action,
        } => cmd::cmd_feedback(config, run, user, item, action).await?,
        Commands::Suggest { workspace } => cmd::cmd_suggest(config, workspace.as_deref()).await?,
        Commands::History {
            workspace,
            run,
            limit,
        } => cmd::cmd_history(config, workspace.as_deref(), run.as_deref(), *limit).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
