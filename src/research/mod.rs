//! Research collector: fetches raw activity from the source-control provider
//! and normalizes it into [`GitHubItem`]s. No judgment happens here.

pub mod github;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::FetchError;
use crate::models::GitHubItem;

pub use github::GitHubCollector;

/// Output of one fetch.
///
/// `incomplete` is set when the retry budget or fetch deadline ran out
/// before every page was read; `items` then holds what was fetched so far.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub items: Vec<GitHubItem>,
    pub incomplete: bool,
    pub note: Option<String>,
}

impl FetchResult {
    pub fn complete(items: Vec<GitHubItem>) -> Self {
        Self {
            items,
            incomplete: false,
            note: None,
        }
    }

    /// Mark the result partial, keeping the first reason given.
    pub fn mark_incomplete(&mut self, note: impl Into<String>) {
        self.incomplete = true;
        if self.note.is_none() {
            self.note = Some(note.into());
        }
    }

    /// Append items whose external id has not been seen yet.
    pub fn extend_unique(&mut self, items: impl IntoIterator<Item = GitHubItem>) {
        let mut seen: HashSet<String> = self.items.iter().map(|i| i.external_id.clone()).collect();
        for item in items {
            if seen.insert(item.external_id.clone()) {
                self.items.push(item);
            }
        }
    }
}

#[async_trait]
pub trait ResearchCollector: Send + Sync {
    /// Activity updated since `since` in `repos`. Empty `repos` means every
    /// configured repo. The returned items carry no duplicate external ids.
    async fn fetch_recent_activity(
        &self,
        since: DateTime<Utc>,
        repos: &[String],
    ) -> Result<FetchResult, FetchError>;

    /// Free-text discussion around an item fetched earlier by this collector.
    async fn enrich_item_context(&self, item_id: &str) -> Result<String, FetchError>;
}

pub(crate) fn ensure_past(since: DateTime<Utc>) -> Result<(), FetchError> {
    if since >= Utc::now() {
        return Err(FetchError::InvalidSince(since.to_rfc3339()));
    }
    Ok(())
}
