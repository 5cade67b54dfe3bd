//! Deterministic triage policy.
//!
//! Every function here is pure: same item, same context, same clock value,
//! same answer. Classification rules run in fixed precedence and the first
//! match wins:
//! 1. label taxonomy
//! 2. mention of a critical path from context
//! 3. pull request CI / review / merge state
//! 4. `UNCATEGORIZED`

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::models::{
    CiStatus, Classification, GitHubItem, MergeStatus, Priority, ProjectContext, ReviewStatus,
    UserPreferences,
};

/// Label taxonomy, checked in order.
const LABEL_TAXONOMY: &[(&str, Classification)] = &[
    ("security", Classification::Security),
    ("vulnerability", Classification::Security),
    ("cve", Classification::Security),
    ("critical", Classification::BugCritical),
    ("p0", Classification::BugCritical),
    ("sev1", Classification::BugCritical),
    ("outage", Classification::BugCritical),
    ("bug", Classification::BugMinor),
    ("defect", Classification::BugMinor),
    ("feature", Classification::Feature),
    ("enhancement", Classification::Feature),
    ("tech-debt", Classification::TechDebt),
    ("refactor", Classification::TechDebt),
    ("chore", Classification::TechDebt),
    ("docs", Classification::Documentation),
    ("documentation", Classification::Documentation),
];

/// Words that turn a critical-path mention into a critical bug.
const DEFECT_KEYWORDS: &[&str] = &["fail", "fails", "failing", "error", "crash", "broken", "regression"];

/// Sprint goal words shorter than this are too generic to match on.
const MIN_GOAL_KEYWORD_LEN: usize = 5;

/// A review counts as unanswered when the PR has not moved for longer than
/// this after it.
const REVIEW_UPDATE_GRACE_SECS: i64 = 60;

/// Case-insensitive whole-word pattern for one term.
#[derive(Debug, Clone)]
pub struct Term {
    text: String,
    pattern: Option<Regex>,
}

impl Term {
    /// `None` for blank terms, which never match.
    pub fn new(term: &str) -> Option<Self> {
        let text = term.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_lowercase(),
            pattern: Regex::new(&format!(r"(?i)\b{}\b", regex::escape(text))).ok(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_in(&self, text: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(text),
            None => text.to_lowercase().contains(&self.text),
        }
    }

    fn in_item(&self, item: &GitHubItem) -> bool {
        item.has_label(&self.text) || self.is_in(&item.title) || self.is_in(&item.description)
    }
}

/// Context with every matchable term compiled once, shared by all items of
/// one analysis.
pub struct ContextTerms<'a> {
    pub ctx: &'a ProjectContext,
    critical_paths: Vec<(&'a str, Term)>,
    /// Goal text and its significant words.
    sprint_goals: Vec<(&'a str, Vec<Term>)>,
    focus_areas: Vec<(&'a str, Vec<(&'a str, Term)>)>,
    defects: Vec<Term>,
}

impl<'a> ContextTerms<'a> {
    pub fn new(ctx: &'a ProjectContext) -> Self {
        let critical_paths = ctx
            .critical_paths
            .iter()
            .filter_map(|path| Some((path.as_str(), Term::new(path)?)))
            .collect();
        let sprint_goals = ctx
            .sprint_goals
            .iter()
            .map(|goal| {
                let words = goal
                    .split(|c: char| !c.is_alphanumeric() && c != '-')
                    .filter(|w| w.len() >= MIN_GOAL_KEYWORD_LEN)
                    .filter_map(Term::new)
                    .collect();
                (goal.as_str(), words)
            })
            .collect();
        let focus_areas = ctx
            .focus_areas
            .iter()
            .map(|(user, topics)| {
                let topics = topics
                    .iter()
                    .filter_map(|t| Some((t.as_str(), Term::new(t)?)))
                    .collect();
                (user.as_str(), topics)
            })
            .collect();
        Self {
            ctx,
            critical_paths,
            sprint_goals,
            focus_areas,
            defects: DEFECT_KEYWORDS.iter().filter_map(|kw| Term::new(kw)).collect(),
        }
    }
}

/// First critical path the item touches, in context order.
pub fn touched_critical_path<'a>(item: &GitHubItem, terms: &ContextTerms<'a>) -> Option<&'a str> {
    terms
        .critical_paths
        .iter()
        .find(|(_, term)| term.in_item(item))
        .map(|(path, _)| *path)
}

/// First sprint goal the item touches. A goal matches when one of its
/// significant words appears in the title or labels.
pub fn touched_sprint_goal<'a>(item: &GitHubItem, terms: &ContextTerms<'a>) -> Option<&'a str> {
    terms
        .sprint_goals
        .iter()
        .find(|(_, words)| {
            words
                .iter()
                .any(|w| item.has_label(w.as_str()) || w.is_in(&item.title))
        })
        .map(|(goal, _)| *goal)
}

/// Classification with the signal that decided it.
pub fn classify(item: &GitHubItem, terms: &ContextTerms<'_>) -> (Classification, String) {
    for (label, classification) in LABEL_TAXONOMY {
        if item.has_label(label) {
            return (*classification, format!("label '{}'", label));
        }
    }

    if let Some(path) = touched_critical_path(item, terms) {
        let defect = terms
            .defects
            .iter()
            .find(|kw| kw.is_in(&item.title) || kw.is_in(&item.description))
            .map(Term::as_str);
        return match defect {
            Some(kw) => (
                Classification::BugCritical,
                format!("touches critical path '{}' and reports '{}'", path, kw),
            ),
            None => (
                Classification::Feature,
                format!("touches critical path '{}'", path),
            ),
        };
    }

    if let Some(pr) = &item.pull_request {
        if pr.ci_status == CiStatus::Failure {
            return (Classification::BugMinor, "PR with failing CI".to_string());
        }
        if pr.review_status == ReviewStatus::ChangesRequested {
            return (Classification::BugMinor, "PR with changes requested".to_string());
        }
        if pr.merge_status == MergeStatus::Conflict {
            return (Classification::BugMinor, "PR with merge conflict".to_string());
        }
        return (Classification::Feature, "PR without failure signals".to_string());
    }

    (
        Classification::Uncategorized,
        "no label, context, or PR signal matched".to_string(),
    )
}

pub fn base_priority(classification: Classification) -> Priority {
    match classification {
        Classification::BugCritical => Priority::Critical,
        Classification::Security => Priority::High,
        Classification::BugMinor | Classification::Feature => Priority::Medium,
        Classification::TechDebt | Classification::Documentation | Classification::Uncategorized => {
            Priority::Low
        }
    }
}

/// Whole days since the item was last updated.
pub fn age_days(item: &GitHubItem, now: DateTime<Utc>) -> i64 {
    (now - item.updated_at).num_days().max(0)
}

/// Stale: not updated within the threshold and carrying no watched label.
pub fn is_stale(
    item: &GitHubItem,
    preferences: &UserPreferences,
    stale_after_days: i64,
    now: DateTime<Utc>,
) -> bool {
    let watched = preferences.watched_labels.iter().any(|l| item.has_label(l));
    now - item.updated_at > Duration::days(stale_after_days) && !watched
}

/// Why a pull request is blocked, if it is. Issues are never blocked.
pub fn blocked_reason(item: &GitHubItem) -> Option<&'static str> {
    let pr = item.pull_request.as_ref()?;
    if pr.merge_status == MergeStatus::Conflict {
        return Some("merge conflict");
    }
    if pr.review_status == ReviewStatus::ChangesRequested {
        let unanswered = match pr.last_review_at {
            Some(reviewed) => item.updated_at <= reviewed + Duration::seconds(REVIEW_UPDATE_GRACE_SECS),
            None => true,
        };
        if unanswered {
            return Some("changes requested with no update since review");
        }
    }
    if pr.ci_status == CiStatus::Failure {
        return Some("CI failing");
    }
    None
}

fn involves_on_call(item: &GitHubItem, ctx: &ProjectContext) -> bool {
    match &ctx.on_call {
        Some(on_call) => item.author == *on_call || item.assignees.contains(on_call),
        None => false,
    }
}

/// Priority from classification, adjusted by one level at most in each
/// direction. Returns the reasons for any adjustment.
pub fn prioritize(
    classification: Classification,
    item: &GitHubItem,
    terms: &ContextTerms<'_>,
    stale: bool,
) -> (Priority, Vec<String>) {
    let mut priority = base_priority(classification);
    let mut reasons = Vec::new();

    let focus = touched_critical_path(item, terms)
        .map(|p| format!("critical path '{}'", p))
        .or_else(|| touched_sprint_goal(item, terms).map(|g| format!("sprint goal '{}'", g)));
    if let Some(focus) = focus {
        let raised = priority.escalate();
        if raised != priority {
            reasons.push(format!("escalated for {}", focus));
        }
        priority = raised;
    }

    if stale && !involves_on_call(item, terms.ctx) {
        let lowered = priority.deescalate();
        if lowered != priority {
            reasons.push("de-escalated: stale and not owned by on-call".to_string());
        }
        priority = lowered;
    }

    (priority, reasons)
}

/// Owner for an unassigned item: the first teammate whose focus areas the
/// item mentions, else the on-call owner when the item needs a PM.
pub fn suggest_assignee(
    item: &GitHubItem,
    classification: Classification,
    priority: Priority,
    terms: &ContextTerms<'_>,
) -> Option<String> {
    if !item.assignees.is_empty() {
        return None;
    }
    let by_focus = terms.focus_areas.iter().find_map(|(user, topics)| {
        topics
            .iter()
            .any(|(topic, term)| {
                term.in_item(item)
                    || (classification == Classification::Security
                        && topic.eq_ignore_ascii_case("security"))
            })
            .then(|| user.to_string())
    });
    by_focus.or_else(|| {
        let urgent = priority == Priority::Critical || classification == Classification::Security;
        if urgent { terms.ctx.on_call.clone() } else { None }
    })
}
