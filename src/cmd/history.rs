//! Run history: `triage history`.

use anyhow::Result;

use triage::brief::render;
use triage::config::TriageConfig;

use super::open_db;

pub async fn cmd_history(
    config: TriageConfig,
    workspace: Option<&str>,
    run: Option<&str>,
    limit: usize,
) -> Result<()> {
    let db = open_db(&config)?;

    if let Some(run_id) = run {
        let lookup = run_id.to_string();
        let items = db.call(move |db| db.triaged_items_for_run(&lookup)).await?;
        if items.is_empty() {
            println!("No decisions recorded for run {}", run_id);
            return Ok(());
        }
        println!();
        println!("Decisions in run {}", run_id);
        for t in &items {
            println!("  {}", render::item_label(t));
            println!("    {}", t.reasoning);
        }
        println!();
        return Ok(());
    }

    let filter = workspace.map(str::to_string);
    let runs = db
        .call(move |db| db.recent_runs(filter.as_deref(), limit))
        .await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!();
    println!(
        "{:<36}  {:<12}  {:<10}  {:<12}  {:>5}  STARTED",
        "RUN", "WORKSPACE", "TRIGGER", "STATE", "ITEMS"
    );
    for r in &runs {
        let state = if r.incomplete {
            format!("{}*", r.state)
        } else {
            r.state.to_string()
        };
        println!(
            "{:<36}  {:<12}  {:<10}  {:<12}  {:>5}  {}",
            r.run_id,
            r.workspace_id,
            r.trigger.label(),
            state,
            r.item_count,
            r.started_at.format("%Y-%m-%d %H:%M")
        );
    }
    if runs.iter().any(|r| r.incomplete) {
        println!();
        println!("* partial data");
    }
    println!();
    Ok(())
}
