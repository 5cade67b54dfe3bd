//! Feedback recorder: captures interactions with delivered briefs and turns
//! them into advisory suggestions.
//!
//! Recording is best-effort. A failed write is logged and dropped; it never
//! surfaces to whoever produced the event. Nothing here edits a stored
//! decision: suggestions only feed the next run's recalibration.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::TriageSection;
use crate::db::DbHandle;
use crate::models::{Classification, TriageFeedback};

#[async_trait]
pub trait FeedbackRecorder: Send + Sync {
    /// Append an event. Never fails from the caller's point of view.
    async fn record_feedback(&self, feedback: TriageFeedback);

    /// Plain-text patterns over the trailing feedback window.
    async fn generate_optimization_suggestions(&self) -> Vec<String>;

    /// Events in the trailing window for one workspace, oldest first.
    async fn recent_feedback(&self, workspace_id: &str) -> Vec<TriageFeedback>;
}

/// Per (user, classification) counts over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub user_id: String,
    pub classification: Classification,
    pub dismissed: usize,
    pub engaged: usize,
    pub total: usize,
}

impl Tally {
    pub fn dismissal_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.dismissed as f64 / self.total as f64
        }
    }

    pub fn engagement_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.engaged as f64 / self.total as f64
        }
    }
}

/// Group events by (user, classification), sorted by user then
/// classification. Events with no known classification are skipped.
pub fn tally(feedback: &[TriageFeedback]) -> Vec<Tally> {
    let mut groups: BTreeMap<(&str, Classification), Tally> = BTreeMap::new();
    for event in feedback {
        let Some(classification) = event.classification else {
            continue;
        };
        let entry = groups
            .entry((event.user_id.as_str(), classification))
            .or_insert_with(|| Tally {
                user_id: event.user_id.clone(),
                classification,
                dismissed: 0,
                engaged: 0,
                total: 0,
            });
        entry.total += 1;
        if event.action.is_engagement() {
            entry.engaged += 1;
        } else {
            entry.dismissed += 1;
        }
    }
    groups.into_values().collect()
}

fn percent(rate: f64) -> String {
    format!("{:.0}%", rate * 100.0)
}

/// Suggestions from a feedback window. Pure.
pub fn suggestions(
    feedback: &[TriageFeedback],
    settings: &TriageSection,
) -> Vec<String> {
    let window = settings.feedback_window_runs;
    if feedback.is_empty() {
        return vec![format!("No feedback recorded in the last {} runs", window)];
    }

    let mut out = Vec::new();
    for t in tally(feedback) {
        if t.total < settings.min_feedback_events {
            continue;
        }
        if t.dismissal_rate() >= settings.dismissal_rate_threshold {
            out.push(format!(
                "user {} dismisses {} items at rate {} ({} of {} over last {} runs); consider lowering {} priority for them",
                t.user_id,
                t.classification,
                percent(t.dismissal_rate()),
                t.dismissed,
                t.total,
                window,
                t.classification
            ));
        } else if t.engagement_rate() >= settings.engagement_rate_threshold {
            out.push(format!(
                "user {} engages with {} items at rate {} ({} of {} over last {} runs); consider raising {} priority for them",
                t.user_id,
                t.classification,
                percent(t.engagement_rate()),
                t.engaged,
                t.total,
                window,
                t.classification
            ));
        }
    }

    if out.is_empty() {
        out.push(format!(
            "No strong feedback patterns in the last {} runs ({} events)",
            window,
            feedback.len()
        ));
    }
    out
}

/// Recorder backed by the append-only `feedback` table.
pub struct StoreFeedbackRecorder {
    db: DbHandle,
    settings: TriageSection,
}

impl StoreFeedbackRecorder {
    pub fn new(db: DbHandle, settings: TriageSection) -> Self {
        Self { db, settings }
    }

    async fn window(&self, workspace_id: Option<String>) -> Vec<TriageFeedback> {
        let window = self.settings.feedback_window_runs;
        let result = self
            .db
            .call(move |db| db.feedback_window(workspace_id.as_deref(), window))
            .await;
        match result {
            Ok(feedback) => feedback,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load feedback window");
                Vec::new()
            }
        }
    }

    /// Suggestions scoped to one workspace, or all when `None`.
    pub async fn suggestions_for(&self, workspace_id: Option<&str>) -> Vec<String> {
        let feedback = self.window(workspace_id.map(str::to_string)).await;
        suggestions(&feedback, &self.settings)
    }
}

#[async_trait]
impl FeedbackRecorder for StoreFeedbackRecorder {
    async fn record_feedback(&self, mut feedback: TriageFeedback) {
        let run_id = feedback.run_id.clone();
        let item_id = feedback.item_id.clone();
        let result = self
            .db
            .call(move |db| {
                if feedback.classification.is_none() {
                    feedback.classification = db.latest_classification(&feedback.item_id)?;
                }
                db.append_feedback(&feedback)
            })
            .await;
        match result {
            Ok(id) => tracing::debug!(id, %run_id, %item_id, "recorded feedback"),
            Err(e) => tracing::warn!(error = %e, %run_id, %item_id, "dropping feedback event"),
        }
    }

    async fn generate_optimization_suggestions(&self) -> Vec<String> {
        self.suggestions_for(None).await
    }

    async fn recent_feedback(&self, workspace_id: &str) -> Vec<TriageFeedback> {
        self.window(Some(workspace_id.to_string())).await
    }
}
