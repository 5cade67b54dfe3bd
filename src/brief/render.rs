//! Section-oriented rendering shared by the Slack adapter and the CLI.
//!
//! Empty sections are omitted, never rendered with a placeholder.

use std::collections::HashMap;

use crate::models::{BriefStats, DailyTriageBrief, TriagedItem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'a> {
    pub title: &'static str,
    pub items: Vec<&'a TriagedItem>,
}

/// Resolve the brief's item references into non-empty sections.
/// References with no matching item are skipped.
pub fn sections<'a>(brief: &DailyTriageBrief, items: &'a [TriagedItem]) -> Vec<Section<'a>> {
    let by_id: HashMap<&str, &TriagedItem> = items.iter().map(|t| (t.id(), t)).collect();
    let resolve = |ids: &[String]| -> Vec<&'a TriagedItem> {
        ids.iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect()
    };
    [
        ("Critical alerts", resolve(&brief.critical_alerts)),
        ("Blockers", resolve(&brief.blockers)),
        ("Progress", resolve(&brief.progress_updates)),
    ]
    .into_iter()
    .filter(|(_, items)| !items.is_empty())
    .map(|(title, items)| Section { title, items })
    .collect()
}

pub fn stats_line(stats: &BriefStats) -> String {
    format!(
        "{} open · {} new · {} closed",
        stats.total_open, stats.new_today, stats.closed_today
    )
}

/// One-line description of an item without links.
pub fn item_label(t: &TriagedItem) -> String {
    let mut line = format!(
        "{}#{} {} [{} {}]",
        t.item.repo, t.item.number, t.item.title, t.priority, t.classification
    );
    if let Some(assignee) = &t.suggested_assignee {
        line.push_str(&format!(" → {}", assignee));
    }
    line
}

/// Plain-text rendering for terminals and notification fallbacks.
pub fn plain_text(brief: &DailyTriageBrief, items: &[TriagedItem]) -> String {
    let mut out = format!("Daily triage brief for {} ({})\n", brief.workspace_id, brief.date);
    for bullet in &brief.summary {
        out.push_str(&format!("  • {}\n", bullet));
    }
    for section in sections(brief, items) {
        out.push_str(&format!("\n{}\n", section.title));
        for t in section.items {
            out.push_str(&format!("  - {}\n    {}\n", item_label(t), t.item.url));
        }
    }
    out.push_str(&format!("\n{}\n", stats_line(&brief.stats)));
    for note in &brief.notes {
        out.push_str(&format!("⚠ {}\n", note));
    }
    out
}
