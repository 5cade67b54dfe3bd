//! Typed error hierarchy for the triage pipeline.
//!
//! One enum per boundary:
//! - `FetchError`: source-control provider calls
//! - `ContextError`: workspace knowledge lookups
//! - `DeliveryError`: messaging channel calls
//! - `TriageError`: run-level and boundary-validation failures

use std::time::Duration;

use thiserror::Error;

/// Classifies an error for the retry loop in [`crate::retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Provider-mandated wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Errors from the source-control provider.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider call cut off by the fetch deadline")]
    DeadlineElapsed,

    #[error("Provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Item {0} has not been fetched by this collector")]
    UnknownItem(String),

    #[error("Fetch window start {0} is not in the past")]
    InvalidSince(String),

    #[error("Missing credentials: environment variable {0} is not set")]
    MissingToken(String),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::DeadlineElapsed
            | Self::Decode(_)
            | Self::UnknownItem(_)
            | Self::InvalidSince(_)
            | Self::MissingToken(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for FetchError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineElapsed
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Errors from the context provider. Always non-fatal to a run.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Workspace {0} is not configured")]
    UnknownWorkspace(String),

    #[error("Failed to load review history: {0}")]
    History(#[source] anyhow::Error),
}

/// Errors from the delivery channel.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Channel unreachable: {0}")]
    Unreachable(String),

    #[error("Channel call cut off by the delivery deadline")]
    DeadlineElapsed,

    #[error("Rate limited by channel (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Channel API rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid thread id '{0}'")]
    InvalidThreadId(String),

    #[error("Delivery ledger error: {0}")]
    Ledger(#[source] anyhow::Error),

    #[error("Missing credentials: environment variable {0} is not set")]
    MissingToken(String),
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for DeliveryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineElapsed
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

/// Run-level and boundary errors.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Invalid feedback action '{0}'. Valid values: CLICKED_LINK, REPLIED_THREAD, DISMISSED")]
    InvalidFeedbackAction(String),

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Malformed item {item_id}: {reason}")]
    MalformedItem { item_id: String, reason: String },

    #[error("Run already in progress for workspace {workspace_id}")]
    RunInProgress { workspace_id: String },

    #[error("Workspace {0} is not configured")]
    UnknownWorkspace(String),

    #[error("User {0} is not a member of any workspace")]
    NotAMember(String),

    #[error("Run {run_id} was cancelled before {stage}")]
    Cancelled { run_id: String, stage: String },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Fetch returned no items and was incomplete: {0}")]
    NothingFetched(String),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
