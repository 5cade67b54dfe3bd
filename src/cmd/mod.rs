//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `run`      | `Run`, `Serve`, `Deliver` |
//! | `feedback` | `Feedback`, `Suggest`     |
//! | `history`  | `History`                 |
//! | `config`   | `Config`                  |

pub mod config;
pub mod feedback;
pub mod history;
pub mod run;

pub use config::cmd_config;
pub use feedback::{cmd_feedback, cmd_suggest};
pub use history::cmd_history;
pub use run::{cmd_deliver, cmd_run, cmd_serve};

use std::sync::Arc;

use anyhow::{Context, Result};

use triage::brief::DigestSynthesizer;
use triage::config::TriageConfig;
use triage::context::ConfigContextProvider;
use triage::db::{DbHandle, TriageDb};
use triage::delivery::SlackChannel;
use triage::feedback::StoreFeedbackRecorder;
use triage::pipeline::{Agents, PipelineRunner};
use triage::research::GitHubCollector;
use triage::triage::RuleBasedOrchestrator;

pub fn open_db(config: &TriageConfig) -> Result<DbHandle> {
    let db = TriageDb::new(&config.storage.db_path).with_context(|| {
        format!(
            "Failed to open triage database at {}",
            config.storage.db_path.display()
        )
    })?;
    Ok(DbHandle::new(db))
}

/// Composition root: wire the concrete agents behind the pipeline traits.
/// Credentials come from the environment variables named in config.
pub fn build_runner(config: Arc<TriageConfig>, db: DbHandle) -> Result<PipelineRunner> {
    let collector = GitHubCollector::from_env(&config.github)?;
    let channel = SlackChannel::from_env(&config.slack)?;
    let agents = Agents {
        collector: Arc::new(collector),
        context: Arc::new(ConfigContextProvider::new(&config.workspaces, db.clone())),
        orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
        synthesizer: Arc::new(DigestSynthesizer),
        channel: Arc::new(channel),
        feedback: Arc::new(StoreFeedbackRecorder::new(db.clone(), config.triage.clone())),
    };
    Ok(PipelineRunner::new(config, agents, db))
}

/// Refuse to start on a config with errors. Warnings are logged.
pub fn check_config(config: &TriageConfig) -> Result<()> {
    if config.workspaces.is_empty() {
        anyhow::bail!("No workspaces configured. Run 'triage config init' to create a starter triage.toml.");
    }
    let report = config.validate();
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    if !report.errors.is_empty() {
        anyhow::bail!(
            "Invalid configuration:\n  - {}\nRun 'triage config validate' for details.",
            report.errors.join("\n  - ")
        );
    }
    Ok(())
}
