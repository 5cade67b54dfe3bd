//! Triage orchestrator: turns raw items plus context into classified,
//! prioritized, explained decisions.

pub mod policy;

use chrono::{DateTime, Utc};

use crate::config::TriageSection;
use crate::feedback::{Tally, tally};
use crate::models::{
    GitHubItem, ProjectContext, TriageFeedback, TriagedItem, Verdict, needs_pm_attention,
};

use policy::ContextTerms;

/// Decision stage. Implementations must be pure and non-blocking.
pub trait TriageAgent: Send + Sync {
    /// Exactly one decision per input item, in input order.
    fn analyze_and_triage(&self, raw_items: Vec<GitHubItem>, ctx: &ProjectContext) -> Vec<TriagedItem>;

    /// A new decision adjusted for feedback on the item's classification.
    /// The input is left untouched.
    fn recalibrate_priority(&self, item: &TriagedItem, feedback: &[TriageFeedback]) -> TriagedItem;
}

/// Rule-based orchestrator over [`policy`].
#[derive(Debug, Clone)]
pub struct RuleBasedOrchestrator {
    settings: TriageSection,
}

impl RuleBasedOrchestrator {
    pub fn new(settings: TriageSection) -> Self {
        Self { settings }
    }

    /// `analyze_and_triage` against an explicit clock.
    pub fn analyze_at(
        &self,
        raw_items: Vec<GitHubItem>,
        ctx: &ProjectContext,
        now: DateTime<Utc>,
    ) -> Vec<TriagedItem> {
        let missing = ctx.missing_fields();
        let terms = ContextTerms::new(ctx);
        raw_items
            .into_iter()
            .map(|item| self.triage_one(item, &terms, &missing, now))
            .collect()
    }

    fn triage_one(
        &self,
        item: GitHubItem,
        terms: &ContextTerms<'_>,
        missing: &[&str],
        now: DateTime<Utc>,
    ) -> TriagedItem {
        let ctx = terms.ctx;
        let (classification, signal) = policy::classify(&item, terms);
        let stale = policy::is_stale(&item, &ctx.preferences, self.settings.stale_after_days, now);
        let (priority, adjustments) = policy::prioritize(classification, &item, terms, stale);
        let blocked = policy::blocked_reason(&item);
        let assignee = policy::suggest_assignee(&item, classification, priority, terms);

        let mut reasons = vec![
            signal,
            format!("updated {} days ago", policy::age_days(&item, now)),
        ];
        reasons.extend(adjustments);
        if stale {
            reasons.push(format!(
                "stale: no activity for over {} days",
                self.settings.stale_after_days
            ));
        }
        if let Some(blocked) = blocked {
            reasons.push(format!("blocked: {}", blocked));
        }
        if let Some(previous) = ctx.last_decision_for(&item.id) {
            reasons.push(format!(
                "previously {} ({}) on {}",
                previous.priority,
                previous.classification,
                previous.decided_at.date_naive()
            ));
        }
        if !missing.is_empty() {
            reasons.push(format!("context-incomplete: missing {}", missing.join(", ")));
        }

        let mut triaged = TriagedItem::new(
            item,
            Verdict {
                classification,
                priority,
            },
            reasons.join("; "),
        );
        triaged.suggested_assignee = assignee;
        triaged.is_stale = stale;
        triaged.is_blocked = blocked.is_some();
        triaged
    }

    /// Strongest qualifying pattern: most events first, then user id.
    fn strongest<'a>(
        tallies: impl Iterator<Item = &'a Tally>,
        rate: impl Fn(&Tally) -> f64,
        threshold: f64,
    ) -> Option<&'a Tally> {
        tallies
            .filter(|t| rate(*t) >= threshold)
            .min_by(|a, b| b.total.cmp(&a.total).then_with(|| a.user_id.cmp(&b.user_id)))
    }
}

impl TriageAgent for RuleBasedOrchestrator {
    fn analyze_and_triage(&self, raw_items: Vec<GitHubItem>, ctx: &ProjectContext) -> Vec<TriagedItem> {
        self.analyze_at(raw_items, ctx, Utc::now())
    }

    fn recalibrate_priority(&self, item: &TriagedItem, feedback: &[TriageFeedback]) -> TriagedItem {
        let tallies = tally(feedback);
        let relevant: Vec<&Tally> = tallies
            .iter()
            .filter(|t| {
                t.classification == item.classification
                    && t.total >= self.settings.min_feedback_events
            })
            .collect();

        let dismissal = Self::strongest(
            relevant.iter().copied(),
            Tally::dismissal_rate,
            self.settings.dismissal_rate_threshold,
        );
        let (revised, trigger, verb, count) = match dismissal {
            Some(t) => (item.priority.deescalate(), t, "dismissed", t.dismissed),
            None => match Self::strongest(
                relevant.iter().copied(),
                Tally::engagement_rate,
                self.settings.engagement_rate_threshold,
            ) {
                Some(t) => (item.priority.escalate(), t, "engaged with", t.engaged),
                None => return item.clone(),
            },
        };
        if revised == item.priority {
            return item.clone();
        }

        let mut next = item.clone();
        next.priority = revised;
        next.recalibrated_from = Some(item.priority);
        next.requires_pm_attention = needs_pm_attention(next.verdict());
        next.reasoning = format!(
            "{}; recalibrated {} -> {}: user {} {} {} of {} {} items ({:.0}%)",
            item.reasoning,
            item.priority,
            revised,
            trigger.user_id,
            verb,
            count,
            trigger.total,
            item.classification,
            count as f64 / trigger.total as f64 * 100.0
        );
        tracing::debug!(
            item_id = %item.id(),
            from = %item.priority,
            to = %revised,
            user = %trigger.user_id,
            "recalibrated priority from feedback"
        );
        next
    }
}
