//! Configuration view and validation commands: `triage config`.

use std::path::Path;

use anyhow::Result;

use triage::config::TriageConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Triage Configuration");
            println!("====================");
            println!();

            let config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                TriageConfig::load(config_path)?
            } else {
                println!("No triage.toml found at {}; showing defaults.", config_path.display());
                TriageConfig::default()
            };
            println!();

            println!("[github]");
            println!("  api_base = \"{}\"", config.github.api_base);
            println!("  token_env = \"{}\"", config.github.token_env);
            println!("  repos = {:?}", config.github.repos);
            println!("  fetch_timeout_secs = {}", config.github.fetch_timeout_secs);
            println!("  retry.max_attempts = {}", config.github.retry.max_attempts);
            println!();
            println!("[slack]");
            println!("  token_env = \"{}\"", config.slack.token_env);
            println!();
            println!("[triage]");
            println!("  stale_after_days = {}", config.triage.stale_after_days);
            println!("  lookback_hours = {}", config.triage.lookback_hours);
            println!("  history_limit = {}", config.triage.history_limit);
            println!("  feedback_window_runs = {}", config.triage.feedback_window_runs);
            println!("  min_feedback_events = {}", config.triage.min_feedback_events);
            println!(
                "  dismissal_rate_threshold = {}",
                config.triage.dismissal_rate_threshold
            );
            println!(
                "  engagement_rate_threshold = {}",
                config.triage.engagement_rate_threshold
            );
            println!();
            println!("[storage]");
            println!("  db_path = \"{}\"", config.storage.db_path.display());
            println!();

            if config.workspaces.is_empty() {
                println!("No workspaces configured.");
            }
            for ws in &config.workspaces {
                println!("[[workspaces]] {}", ws.id);
                println!("  channel = \"{}\"", ws.channel);
                println!("  cron = \"{}\"", ws.cron);
                println!("  repos = {:?}", config.repos_for(ws));
                println!("  members = {:?}", ws.members);
                if let Some(on_call) = &ws.context.on_call {
                    println!("  on_call = \"{}\"", on_call);
                }
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No triage.toml found at {}.", config_path.display());
                println!("Run 'triage config init' to create one.");
                return Ok(());
            }

            let config = TriageConfig::load(config_path)?;
            let report = config.validate();

            if report.is_clean() {
                println!("Configuration is valid.");
            }
            if !report.warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in &report.warnings {
                    println!("  - {}", warning);
                }
            }
            if !report.errors.is_empty() {
                println!("Configuration errors:");
                for error in &report.errors {
                    println!("  - {}", error);
                }
                println!();
                anyhow::bail!("Configuration has {} error(s)", report.errors.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("triage.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            TriageConfig::starter().save(config_path)?;

            println!("Created triage.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] repos, token_env");
            println!("  - [[workspaces]] channel, cron, members");
            println!("  - [workspaces.context] sprint_goals, critical_paths, on_call");
            println!();
        }
    }

    Ok(())
}
