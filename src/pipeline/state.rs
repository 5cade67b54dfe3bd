use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one triage run.
///
/// `Idle → Fetching → Analyzing → Synthesizing → Delivering → Completed`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Analyzing,
    Synthesizing,
    Delivering,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Analyzing => "analyzing",
            Self::Synthesizing => "synthesizing",
            Self::Delivering => "delivering",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "fetching" => Ok(Self::Fetching),
            "analyzing" => Ok(Self::Analyzing),
            "synthesizing" => Ok(Self::Synthesizing),
            "delivering" => Ok(Self::Delivering),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Whether `from → to` is a legal step. Stages never skip forward.
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;
    matches!(
        (from, to),
        (Idle, Fetching)
            | (Fetching, Analyzing)
            | (Analyzing, Synthesizing)
            | (Synthesizing, Delivering)
            | (Delivering, Completed)
    ) || (!from.is_terminal() && to == Failed)
}

/// What started a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    /// Started by an operator from the CLI.
    Manual,
    AdHoc { user_id: String },
}

impl Trigger {
    pub fn label(&self) -> &str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::AdHoc { .. } => "ad_hoc",
        }
    }
}

/// How the Delivering stage ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// A new brief message was posted.
    Posted,
    /// The same brief was already delivered for the date.
    AlreadyDelivered,
    /// A different brief was already delivered for the date; only new
    /// critical items were posted as alerts.
    AlertsOnly,
}

/// Persisted record of a run, including partial state on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub workspace_id: String,
    pub trigger: Trigger,
    pub state: RunState,
    /// Last non-terminal state reached; where a failed run stopped.
    pub last_stage: RunState,
    pub incomplete: bool,
    pub item_count: usize,
    pub brief_id: Option<String>,
    pub thread_id: Option<String>,
    pub delivery: Option<DeliveryOutcome>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(run_id: &str, workspace_id: &str, trigger: Trigger) -> Self {
        Self {
            run_id: run_id.to_string(),
            workspace_id: workspace_id.to_string(),
            trigger,
            state: RunState::Idle,
            last_stage: RunState::Idle,
            incomplete: false,
            item_count: 0,
            brief_id: None,
            thread_id: None,
            delivery: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `to`, refusing illegal steps.
    pub fn advance(&mut self, to: RunState) -> Result<(), String> {
        if !is_valid_transition(self.state, to) {
            return Err(format!(
                "Invalid run transition {} -> {}",
                self.state, to
            ));
        }
        if !to.is_terminal() {
            self.last_stage = to;
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
            self.finished_at = Some(Utc::now());
        }
        self.error = Some(error.into());
    }
}
