//! Feedback commands: `triage feedback`, `triage suggest`.

use anyhow::Result;

use triage::config::TriageConfig;
use triage::feedback::{FeedbackRecorder, StoreFeedbackRecorder};
use triage::models::TriageFeedback;

use super::open_db;

pub async fn cmd_feedback(
    config: TriageConfig,
    run_id: &str,
    user_id: &str,
    item_id: &str,
    action: &str,
) -> Result<()> {
    // Validate before touching storage so a bad action never gets recorded.
    let feedback = TriageFeedback::parse(run_id, user_id, item_id, action)?;
    let db = open_db(&config)?;
    let recorder = StoreFeedbackRecorder::new(db, config.triage.clone());
    recorder.record_feedback(feedback).await;
    println!("Recorded {} from {} on item {}", action, user_id, item_id);
    Ok(())
}

pub async fn cmd_suggest(config: TriageConfig, workspace: Option<&str>) -> Result<()> {
    if let Some(id) = workspace
        && config.workspace(id).is_none()
    {
        anyhow::bail!("Workspace '{}' is not configured", id);
    }
    let db = open_db(&config)?;
    let recorder = StoreFeedbackRecorder::new(db, config.triage.clone());
    println!();
    println!("Optimization suggestions");
    println!("========================");
    for suggestion in recorder.suggestions_for(workspace).await {
        println!("  - {}", suggestion);
    }
    println!();
    Ok(())
}
