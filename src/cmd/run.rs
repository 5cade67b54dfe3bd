//! Pipeline commands: `triage run`, `triage serve`, `triage deliver`.

use std::sync::Arc;

use anyhow::{Context, Result};

use triage::brief::render;
use triage::config::TriageConfig;
use triage::pipeline::state::{RunRecord, RunState};
use triage::scheduler::Scheduler;
use triage::server::{AppState, start_server};

use super::{build_runner, check_config, open_db};

fn print_record(record: &RunRecord) {
    println!();
    println!("Run {} ({})", record.run_id, record.workspace_id);
    println!("  state      {}", record.state);
    println!("  items      {}", record.item_count);
    if record.incomplete {
        println!("  incomplete yes");
    }
    if let Some(brief_id) = &record.brief_id {
        println!("  brief      {}", brief_id);
    }
    if let Some(delivery) = &record.delivery {
        println!("  delivery   {:?}", delivery);
    }
    if let Some(error) = &record.error {
        println!("  error      {} (stopped at {})", error, record.last_stage);
    }
    println!();
}

pub async fn cmd_run(config: TriageConfig, workspace: Option<&str>, user: Option<&str>) -> Result<()> {
    check_config(&config)?;
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let runner = Arc::new(build_runner(Arc::clone(&config), db.clone())?);
    let scheduler = Scheduler::new(runner);

    let record = match user {
        Some(user) => scheduler.trigger_ad_hoc(user).await?,
        None => {
            let workspace_id = match workspace {
                Some(id) => id.to_string(),
                None => config
                    .workspaces
                    .first()
                    .map(|w| w.id.clone())
                    .context("No workspaces configured")?,
            };
            scheduler.run_workspace(&workspace_id).await?
        }
    };

    print_record(&record);
    if let Some(brief_id) = record.brief_id.clone() {
        let run_id = record.run_id.clone();
        let (brief, items) = db
            .call(move |db| Ok((db.get_brief(&brief_id)?, db.triaged_items_for_run(&run_id)?)))
            .await?;
        if let Some(brief) = brief {
            println!("{}", render::plain_text(&brief, &items));
        }
    }

    if record.state != RunState::Completed {
        anyhow::bail!(
            "Run {} failed: {}",
            record.run_id,
            record.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub async fn cmd_serve(config: TriageConfig, port: Option<u16>) -> Result<()> {
    check_config(&config)?;
    let port = port.unwrap_or(config.server.port);
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let runner = Arc::new(build_runner(config, db.clone())?);
    let state = Arc::new(AppState {
        scheduler: Arc::new(Scheduler::new(runner)),
        db,
    });
    start_server(state, port).await
}

pub async fn cmd_deliver(config: TriageConfig, brief_id: &str) -> Result<()> {
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let runner = Arc::new(build_runner(config, db)?);
    let receipt = Scheduler::new(runner).redeliver(brief_id).await?;
    println!(
        "Brief {}: {:?} (thread {}, {} alert(s))",
        brief_id, receipt.outcome, receipt.thread_id, receipt.alerts_posted
    );
    Ok(())
}
