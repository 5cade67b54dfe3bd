//! Brief synthesizer: groups a run's decisions into the daily digest.

pub mod render;

use std::cmp::Reverse;
use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

use crate::models::{BriefStats, DailyTriageBrief, Priority, ProjectContext, TriagedItem};

pub const MIN_SUMMARY_BULLETS: usize = 3;
pub const MAX_SUMMARY_BULLETS: usize = 5;

/// Bullets longer than this are cut with an ellipsis.
pub const MAX_BULLET_CHARS: usize = 140;

/// Run facts the synthesizer needs beyond the items themselves.
#[derive(Debug, Clone)]
pub struct BriefScope {
    pub run_id: String,
    pub date: NaiveDate,
    /// Start of the run's lookback window.
    pub window_start: DateTime<Utc>,
    pub incomplete: bool,
    pub fetch_note: Option<String>,
}

pub trait BriefSynthesizer: Send + Sync {
    fn generate_daily_brief(
        &self,
        items: &[TriagedItem],
        ctx: &ProjectContext,
        scope: &BriefScope,
    ) -> DailyTriageBrief;
}

/// Deterministic digest built from section contents and counters.
#[derive(Debug, Clone, Default)]
pub struct DigestSynthesizer;

/// Cut to `max` characters on a char boundary.
pub fn truncate_bullet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

/// Pure aggregate over the items and the window boundary.
pub fn compute_stats(items: &[TriagedItem], window_start: DateTime<Utc>) -> BriefStats {
    BriefStats {
        total_open: items.iter().filter(|t| t.item.is_open).count(),
        new_today: items
            .iter()
            .filter(|t| t.item.created_at >= window_start)
            .count(),
        closed_today: items
            .iter()
            .filter(|t| t.item.closed_at.is_some_and(|c| c >= window_start))
            .count(),
    }
}

/// Content-derived id: workspace, date, and every referenced decision.
pub fn brief_id(
    workspace_id: &str,
    date: NaiveDate,
    sections: [&[&TriagedItem]; 3],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_id.as_bytes());
    hasher.update(date.to_string().as_bytes());
    for (index, section) in sections.iter().enumerate() {
        hasher.update([index as u8]);
        for item in *section {
            hasher.update(item.id().as_bytes());
            hasher.update(item.classification.as_str().as_bytes());
            hasher.update(item.priority.as_str().as_bytes());
        }
    }
    hex::encode(&hasher.finalize()[..12])
}

fn sort_for_section(items: &mut [&TriagedItem]) {
    items.sort_by_key(|t| (Reverse(t.priority), Reverse(t.item.updated_at), t.item.id.clone()));
}

fn reference(t: &TriagedItem) -> String {
    format!("{}#{} {}", t.item.repo, t.item.number, t.item.title)
}

impl DigestSynthesizer {
    fn summary(
        critical: &[&TriagedItem],
        blockers: &[&TriagedItem],
        progress: &[&TriagedItem],
        stats: &BriefStats,
    ) -> Vec<String> {
        let mut bullets: Vec<String> = critical
            .iter()
            .map(|t| format!("{} {}: {}", t.priority, t.classification, reference(t)))
            .collect();
        bullets.extend(blockers.iter().map(|t| format!("Blocked: {}", reference(t))));
        if let Some(top) = progress.first() {
            bullets.push(format!(
                "{} item(s) moved forward, led by {}",
                progress.len(),
                reference(top)
            ));
        }
        bullets.truncate(MAX_SUMMARY_BULLETS);

        let counters = [
            format!("{} open items tracked", stats.total_open),
            format!("{} new in the last window", stats.new_today),
            format!("{} closed in the last window", stats.closed_today),
        ];
        for counter in counters {
            if bullets.len() >= MIN_SUMMARY_BULLETS {
                break;
            }
            bullets.push(counter);
        }

        bullets
            .into_iter()
            .map(|b| truncate_bullet(&b, MAX_BULLET_CHARS))
            .collect()
    }
}

impl BriefSynthesizer for DigestSynthesizer {
    fn generate_daily_brief(
        &self,
        items: &[TriagedItem],
        ctx: &ProjectContext,
        scope: &BriefScope,
    ) -> DailyTriageBrief {
        let mut critical: Vec<&TriagedItem> = items
            .iter()
            .filter(|t| {
                t.requires_pm_attention
                    && (t.priority == Priority::Critical
                        || t.classification == crate::models::Classification::Security)
            })
            .collect();
        sort_for_section(&mut critical);
        let in_critical: HashSet<&str> = critical.iter().map(|t| t.id()).collect();

        let mut blockers: Vec<&TriagedItem> = items
            .iter()
            .filter(|t| t.is_blocked && !in_critical.contains(t.id()))
            .collect();
        sort_for_section(&mut blockers);
        let in_blockers: HashSet<&str> = blockers.iter().map(|t| t.id()).collect();

        let mute = ctx.preferences.mute_low_priority;
        let mut progress: Vec<&TriagedItem> = items
            .iter()
            .filter(|t| !in_critical.contains(t.id()) && !in_blockers.contains(t.id()))
            .filter(|t| t.item.updated_at >= scope.window_start)
            .filter(|t| !(mute && t.priority == Priority::Low))
            .collect();
        sort_for_section(&mut progress);

        let stats = compute_stats(items, scope.window_start);
        let summary = Self::summary(&critical, &blockers, &progress, &stats);

        let mut notes = Vec::new();
        if scope.incomplete {
            notes.push(match &scope.fetch_note {
                Some(note) => format!("Partial data: {}", note),
                None => "Partial data: not every page could be fetched".to_string(),
            });
        }

        let ids = |section: &[&TriagedItem]| section.iter().map(|t| t.id().to_string()).collect();
        DailyTriageBrief {
            id: brief_id(&ctx.workspace_id, scope.date, [&critical, &blockers, &progress]),
            workspace_id: ctx.workspace_id.clone(),
            run_id: scope.run_id.clone(),
            date: scope.date,
            summary,
            critical_alerts: ids(&critical),
            blockers: ids(&blockers),
            progress_updates: ids(&progress),
            stats,
            incomplete: scope.incomplete,
            notes,
        }
    }
}
