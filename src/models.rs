//! Data contracts shared by every pipeline stage.
//!
//! These are plain value types: producers hand them to consumers by value
//! and nothing mutates them after construction. A later recalibration
//! produces a new [`TriagedItem`]; it never edits one in place.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::TriageError;

/// Derive the stable internal id for an item from its provider and external id.
///
/// The same external item always maps to the same internal id across runs so
/// decision history can be joined.
pub fn internal_item_id(provider: &str, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(external_id.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    Issue,
    #[serde(rename = "PR")]
    PullRequest,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "ISSUE",
            Self::PullRequest => "PR",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Merged,
    #[default]
    Open,
    Closed,
    Conflict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Success,
    Failure,
    Pending,
    #[default]
    Unknown,
}

/// PR-only state. Absent on issues.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestState {
    pub draft: bool,
    pub merge_status: MergeStatus,
    pub review_status: ReviewStatus,
    pub ci_status: CiStatus,
    /// When the most recent review was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review_at: Option<DateTime<Utc>>,
}

/// Normalized unit of work (issue or pull request).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHubItem {
    /// Stable internal id, see [`internal_item_id`].
    pub id: String,
    pub provider: String,
    pub external_id: String,
    /// `owner/repo` slug.
    pub repo: String,
    pub number: i64,
    pub item_type: ItemType,
    pub title: String,
    pub description: String,
    pub url: String,
    pub author: String,
    #[serde(default)]
    pub author_is_bot: bool,
    pub assignees: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub is_open: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestState>,
}

impl GitHubItem {
    pub fn is_pull_request(&self) -> bool {
        self.item_type == ItemType::PullRequest
    }

    /// Case-insensitive label membership.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    /// Reject items no stage can reason about.
    pub fn validate(&self) -> Result<(), TriageError> {
        let malformed = |reason: &str| TriageError::MalformedItem {
            item_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.external_id.trim().is_empty() {
            return Err(malformed("empty external id"));
        }
        if self.title.trim().is_empty() {
            return Err(malformed("empty title"));
        }
        if self.updated_at < self.created_at {
            return Err(malformed("updated_at precedes created_at"));
        }
        if self.item_type == ItemType::PullRequest && self.pull_request.is_none() {
            return Err(malformed("pull request without PR state"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPreferences {
    #[serde(default)]
    pub mute_low_priority: bool,
    #[serde(default)]
    pub watched_labels: BTreeSet<String>,
}

/// A decision made in an earlier run, used to ground the next one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoricalDecision {
    pub item_id: String,
    pub external_id: String,
    pub classification: Classification,
    pub priority: Priority,
    pub decided_at: DateTime<Utc>,
}

/// Immutable snapshot of team state for one run.
///
/// Unknown fields are empty collections, never absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectContext {
    pub workspace_id: String,
    pub sprint_goals: Vec<String>,
    pub critical_paths: Vec<String>,
    pub on_call: Option<String>,
    pub focus_areas: BTreeMap<String, BTreeSet<String>>,
    pub preferences: UserPreferences,
    /// Most-recent-first previous decisions.
    #[serde(default)]
    pub history: Vec<HistoricalDecision>,
}

impl ProjectContext {
    pub fn empty(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<HistoricalDecision>) -> Self {
        self.history = history;
        self
    }

    /// Names of the fields the policy layer relies on that are unknown.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.sprint_goals.is_empty() {
            missing.push("sprint_goals");
        }
        if self.critical_paths.is_empty() {
            missing.push("critical_paths");
        }
        if self.on_call.is_none() {
            missing.push("on_call");
        }
        missing
    }

    pub fn last_decision_for(&self, item_id: &str) -> Option<&HistoricalDecision> {
        self.history.iter().find(|d| d.item_id == item_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    BugCritical,
    BugMinor,
    Feature,
    TechDebt,
    Documentation,
    Security,
    Uncategorized,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BugCritical => "BUG_CRITICAL",
            Self::BugMinor => "BUG_MINOR",
            Self::Feature => "FEATURE",
            Self::TechDebt => "TECH_DEBT",
            Self::Documentation => "DOCUMENTATION",
            Self::Security => "SECURITY",
            Self::Uncategorized => "UNCATEGORIZED",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUG_CRITICAL" => Ok(Self::BugCritical),
            "BUG_MINOR" => Ok(Self::BugMinor),
            "FEATURE" => Ok(Self::Feature),
            "TECH_DEBT" => Ok(Self::TechDebt),
            "DOCUMENTATION" => Ok(Self::Documentation),
            "SECURITY" => Ok(Self::Security),
            "UNCATEGORIZED" => Ok(Self::Uncategorized),
            _ => Err(format!("Invalid classification: {}", s)),
        }
    }
}

/// Urgency ranking. Ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// One level up, clamped at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// One level down, clamped at `Low`.
    pub fn deescalate(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Classification and priority, always computed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    pub priority: Priority,
}

/// Decision record wrapping one [`GitHubItem`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriagedItem {
    pub item: GitHubItem,
    pub classification: Classification,
    pub priority: Priority,
    pub suggested_assignee: Option<String>,
    pub reasoning: String,
    pub requires_pm_attention: bool,
    pub is_stale: bool,
    pub is_blocked: bool,
    /// Priority before a feedback recalibration, if one was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recalibrated_from: Option<Priority>,
}

impl TriagedItem {
    /// Build a record once the verdict is known.
    ///
    /// `requires_pm_attention` is derived here so it can never disagree with
    /// the verdict.
    pub fn new(item: GitHubItem, verdict: Verdict, reasoning: String) -> Self {
        Self {
            item,
            classification: verdict.classification,
            priority: verdict.priority,
            suggested_assignee: None,
            reasoning,
            requires_pm_attention: needs_pm_attention(verdict),
            is_stale: false,
            is_blocked: false,
            recalibrated_from: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn verdict(&self) -> Verdict {
        Verdict {
            classification: self.classification,
            priority: self.priority,
        }
    }
}

/// PM attention is owed to every CRITICAL or SECURITY item, whatever the
/// mute preferences say.
pub fn needs_pm_attention(verdict: Verdict) -> bool {
    verdict.priority == Priority::Critical || verdict.classification == Classification::Security
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BriefStats {
    pub total_open: usize,
    pub new_today: usize,
    pub closed_today: usize,
}

/// The delivered artifact of one run.
///
/// Sections hold item ids referencing the run's [`TriagedItem`]s rather than
/// copies of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyTriageBrief {
    /// Content-derived id: the same decisions on the same day give the same id.
    pub id: String,
    pub workspace_id: String,
    pub run_id: String,
    pub date: NaiveDate,
    pub summary: Vec<String>,
    pub critical_alerts: Vec<String>,
    pub blockers: Vec<String>,
    pub progress_updates: Vec<String>,
    pub stats: BriefStats,
    #[serde(default)]
    pub incomplete: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl DailyTriageBrief {
    /// All item ids referenced by any section, in section order.
    pub fn referenced_items(&self) -> impl Iterator<Item = &String> {
        self.critical_alerts
            .iter()
            .chain(self.blockers.iter())
            .chain(self.progress_updates.iter())
    }

    /// Number of sections that would be rendered.
    pub fn non_empty_sections(&self) -> usize {
        [&self.critical_alerts, &self.blockers, &self.progress_updates]
            .iter()
            .filter(|s| !s.is_empty())
            .count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackAction {
    ClickedLink,
    RepliedThread,
    Dismissed,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClickedLink => "CLICKED_LINK",
            Self::RepliedThread => "REPLIED_THREAD",
            Self::Dismissed => "DISMISSED",
        }
    }

    pub fn is_engagement(&self) -> bool {
        matches!(self, Self::ClickedLink | Self::RepliedThread)
    }
}

impl FromStr for FeedbackAction {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLICKED_LINK" => Ok(Self::ClickedLink),
            "REPLIED_THREAD" => Ok(Self::RepliedThread),
            "DISMISSED" => Ok(Self::Dismissed),
            _ => Err(TriageError::InvalidFeedbackAction(s.to_string())),
        }
    }
}

/// Append-only interaction event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageFeedback {
    pub run_id: String,
    pub user_id: String,
    pub item_id: String,
    pub action: FeedbackAction,
    pub timestamp: DateTime<Utc>,
    /// Denormalized from the triage decision when the event is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl TriageFeedback {
    /// Boundary constructor: the action string must be one of the closed set.
    pub fn parse(
        run_id: &str,
        user_id: &str,
        item_id: &str,
        action: &str,
    ) -> Result<Self, TriageError> {
        let action: FeedbackAction = action.parse()?;
        if user_id.trim().is_empty() {
            return Err(TriageError::InvalidFeedback("empty user id".to_string()));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            action,
            timestamp: Utc::now(),
            classification: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Duration;

    pub fn issue(number: i64, title: &str, labels: &[&str]) -> GitHubItem {
        let now = Utc::now();
        let external_id = format!("{}", 1000 + number);
        GitHubItem {
            id: internal_item_id("github", &external_id),
            provider: "github".to_string(),
            external_id,
            repo: "acme/api".to_string(),
            number,
            item_type: ItemType::Issue,
            title: title.to_string(),
            description: String::new(),
            url: format!("https://github.com/acme/api/issues/{}", number),
            author: "dana".to_string(),
            author_is_bot: false,
            assignees: BTreeSet::new(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            is_open: true,
            created_at: now - Duration::hours(2),
            updated_at: now,
            closed_at: None,
            pull_request: None,
        }
    }

    pub fn pull_request(number: i64, title: &str, state: PullRequestState) -> GitHubItem {
        let mut item = issue(number, title, &[]);
        item.item_type = ItemType::PullRequest;
        item.url = format!("https://github.com/acme/api/pull/{}", number);
        item.pull_request = Some(state);
        item
    }

    pub fn aged(mut item: GitHubItem, days: i64) -> GitHubItem {
        item.created_at = Utc::now() - Duration::days(days + 1);
        item.updated_at = Utc::now() - Duration::days(days);
        item
    }
}
