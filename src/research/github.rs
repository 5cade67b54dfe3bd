//! GitHub REST adapter.
//!
//! Issues and pull requests both come through the issues endpoint. Pull
//! requests are then enriched with three extra calls: the pull detail
//! (draft, merge state, head sha), its reviews, and the combined commit
//! status of the head. Every call goes through the retry loop with a shared
//! deadline that also cuts off in-flight requests, so one fetch never
//! exceeds `fetch_timeout_secs`. Running out of time yields an incomplete
//! result, not an error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, LINK, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use super::{FetchResult, ResearchCollector, ensure_past};
use crate::config::GitHubSection;
use crate::errors::FetchError;
use crate::models::{
    CiStatus, GitHubItem, ItemType, MergeStatus, PullRequestState, ReviewStatus, internal_item_id,
};
use crate::retry::{RetryError, RetryPolicy, http_client, retry_with_backoff};

const PROVIDER: &str = "github";

/// Comments returned by `enrich_item_context`.
const COMMENT_CONTEXT_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    id: u64,
    number: i64,
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    user: Option<ApiUser>,
    #[serde(default)]
    assignees: Vec<ApiUser>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    /// Present only on pull requests.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    merged: bool,
    state: String,
    mergeable_state: Option<String>,
    head: ApiRef,
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    user: Option<ApiUser>,
    state: String,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiCombinedStatus {
    state: String,
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    user: Option<ApiUser>,
    body: Option<String>,
}

struct Page<T> {
    body: T,
    next: Option<String>,
}

/// Bot accounts report `type: "Bot"` and usually carry a `[bot]` suffix.
/// Returns the login without the suffix and whether it is a bot.
fn normalize_login(user: &ApiUser) -> (String, bool) {
    match user.login.strip_suffix("[bot]") {
        Some(base) => (base.to_string(), true),
        None => (user.login.clone(), user.kind.eq_ignore_ascii_case("bot")),
    }
}

fn merge_status(pull: &ApiPull) -> MergeStatus {
    if pull.merged {
        MergeStatus::Merged
    } else if pull.state == "closed" {
        MergeStatus::Closed
    } else if pull.mergeable_state.as_deref() == Some("dirty") {
        MergeStatus::Conflict
    } else {
        MergeStatus::Open
    }
}

/// Latest review per reviewer decides; any outstanding change request wins.
fn review_status(reviews: &[ApiReview]) -> (ReviewStatus, Option<DateTime<Utc>>) {
    let mut latest: HashMap<&str, (&str, Option<DateTime<Utc>>)> = HashMap::new();
    let mut last_review_at = None;
    for review in reviews {
        if review.state == "COMMENTED" || review.state == "PENDING" {
            continue;
        }
        let reviewer = review.user.as_ref().map(|u| u.login.as_str()).unwrap_or("");
        latest.insert(reviewer, (review.state.as_str(), review.submitted_at));
        if review.submitted_at > last_review_at {
            last_review_at = review.submitted_at;
        }
    }
    let states: Vec<&str> = latest.values().map(|(state, _)| *state).collect();
    let status = if states.contains(&"CHANGES_REQUESTED") {
        ReviewStatus::ChangesRequested
    } else if states.contains(&"APPROVED") {
        ReviewStatus::Approved
    } else {
        ReviewStatus::Pending
    };
    (status, last_review_at)
}

fn ci_status(status: &ApiCombinedStatus) -> CiStatus {
    if status.total_count == 0 {
        return CiStatus::Unknown;
    }
    match status.state.as_str() {
        "success" => CiStatus::Success,
        "failure" | "error" => CiStatus::Failure,
        "pending" => CiStatus::Pending,
        _ => CiStatus::Unknown,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Classify a response as rate limited and work out how long to wait.
fn rate_limit_error(status: StatusCode, headers: &HeaderMap) -> Option<FetchError> {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (exhausted || headers.contains_key("retry-after")));
    if !limited {
        return None;
    }
    let retry_after = header_u64(headers, "retry-after")
        .map(Duration::from_secs)
        .or_else(|| {
            header_u64(headers, "x-ratelimit-reset").map(|reset| {
                let now = Utc::now().timestamp().max(0) as u64;
                Duration::from_secs(reset.saturating_sub(now))
            })
        });
    Some(FetchError::RateLimited { retry_after })
}

/// `rel="next"` target from a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == r#"rel="next""#)
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

fn normalize_issue(repo: &str, issue: ApiIssue) -> GitHubItem {
    let external_id = issue.id.to_string();
    let (author, author_is_bot) = issue
        .user
        .as_ref()
        .map(normalize_login)
        .unwrap_or_else(|| ("ghost".to_string(), false));
    let is_pr = issue.pull_request.is_some();
    GitHubItem {
        id: internal_item_id(PROVIDER, &external_id),
        provider: PROVIDER.to_string(),
        external_id,
        repo: repo.to_string(),
        number: issue.number,
        item_type: if is_pr {
            ItemType::PullRequest
        } else {
            ItemType::Issue
        },
        title: issue.title,
        description: issue.body.unwrap_or_default(),
        url: issue.html_url,
        author,
        author_is_bot,
        assignees: issue
            .assignees
            .iter()
            .map(|u| normalize_login(u).0)
            .collect(),
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
        is_open: issue.state == "open",
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        closed_at: issue.closed_at,
        pull_request: is_pr.then(PullRequestState::default),
    }
}

pub struct GitHubCollector {
    client: reqwest::Client,
    api_base: String,
    token: String,
    repos: Vec<String>,
    per_page: u32,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    /// internal id → (repo, number) for items seen by the last fetch.
    known: Mutex<HashMap<String, (String, i64)>>,
}

impl GitHubCollector {
    pub fn new(section: &GitHubSection, token: String) -> Self {
        Self {
            client: http_client(Duration::from_secs(section.request_timeout_secs.max(1))),
            api_base: section.api_base.trim_end_matches('/').to_string(),
            token,
            repos: section.repos.clone(),
            per_page: section.per_page.clamp(1, 100),
            retry: section.retry.clone(),
            fetch_timeout: Duration::from_secs(section.fetch_timeout_secs),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Build from config, reading the token from `section.token_env`.
    pub fn from_env(section: &GitHubSection) -> Result<Self, FetchError> {
        let token = std::env::var(&section.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FetchError::MissingToken(section.token_env.clone()))?;
        Ok(Self::new(section, token))
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Page<T>, FetchError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "triage")
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if let Some(err) = rate_limit_error(status, resp.headers()) {
            return Err(err);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let next = next_link(resp.headers());
        let body = resp
            .json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(Page { body, next })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        deadline: Instant,
    ) -> Result<Page<T>, RetryError<FetchError>> {
        retry_with_backoff(&self.retry, Some(deadline), url, || {
            self.send_once(url, query)
        })
        .await
    }

    async fn pull_request_state(
        &self,
        item: &GitHubItem,
        deadline: Instant,
    ) -> Result<PullRequestState, RetryError<FetchError>> {
        let base = format!("{}/repos/{}", self.api_base, item.repo);
        let pull: Page<ApiPull> = self
            .get(&format!("{}/pulls/{}", base, item.number), &[], deadline)
            .await?;
        let reviews: Page<Vec<ApiReview>> = self
            .get(
                &format!("{}/pulls/{}/reviews", base, item.number),
                &[("per_page", "100".to_string())],
                deadline,
            )
            .await?;
        let status: Page<ApiCombinedStatus> = self
            .get(
                &format!("{}/commits/{}/status", base, pull.body.head.sha),
                &[],
                deadline,
            )
            .await?;

        let (review_status, last_review_at) = review_status(&reviews.body);
        Ok(PullRequestState {
            draft: pull.body.draft,
            merge_status: merge_status(&pull.body),
            review_status,
            ci_status: ci_status(&status.body),
            last_review_at,
        })
    }

    /// Read every page of one repo. Returns `Err` only for failures that
    /// make the whole fetch meaningless (bad credentials).
    async fn fetch_repo(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        deadline: Instant,
        result: &mut FetchResult,
    ) -> Result<(), FetchError> {
        let mut url = format!("{}/repos/{}/issues", self.api_base, repo);
        let mut query = vec![
            ("state", "all".to_string()),
            ("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("per_page", self.per_page.to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
        ];

        loop {
            if Instant::now() >= deadline {
                result.mark_incomplete(format!("fetch deadline reached while reading {}", repo));
                return Ok(());
            }
            let page: Page<Vec<ApiIssue>> = match self.get(&url, &query, deadline).await {
                Ok(page) => page,
                Err(RetryError::Permanent(FetchError::Status { status: 401, message })) => {
                    return Err(FetchError::Status {
                        status: 401,
                        message,
                    });
                }
                Err(err) => {
                    let exhausted = err.is_budget_exhausted();
                    let err = err.into_inner();
                    tracing::warn!(repo, error = %err, exhausted, "stopping fetch for repo");
                    result.mark_incomplete(format!("{} partially fetched: {}", repo, err));
                    return Ok(());
                }
            };

            let mut items = Vec::with_capacity(page.body.len());
            for issue in page.body {
                let mut item = normalize_issue(repo, issue);
                if item.is_pull_request() {
                    match self.pull_request_state(&item, deadline).await {
                        Ok(state) => item.pull_request = Some(state),
                        Err(err) => {
                            let err = err.into_inner();
                            tracing::warn!(repo, number = item.number, error = %err, "PR state unavailable");
                            result.mark_incomplete(format!(
                                "PR state missing for {}#{}: {}",
                                repo, item.number, err
                            ));
                        }
                    }
                }
                items.push(item);
            }
            tracing::debug!(repo, count = items.len(), "fetched page");
            result.extend_unique(items);

            match page.next {
                Some(next) => {
                    url = next;
                    query.clear();
                }
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl ResearchCollector for GitHubCollector {
    async fn fetch_recent_activity(
        &self,
        since: DateTime<Utc>,
        repos: &[String],
    ) -> Result<FetchResult, FetchError> {
        ensure_past(since)?;
        let deadline = Instant::now() + self.fetch_timeout;
        let repos = if repos.is_empty() {
            self.repos.clone()
        } else {
            repos.to_vec()
        };

        let mut result = FetchResult::default();
        for repo in &repos {
            self.fetch_repo(repo, since, deadline, &mut result).await?;
        }

        if let Ok(mut known) = self.known.lock() {
            for item in &result.items {
                known.insert(item.id.clone(), (item.repo.clone(), item.number));
            }
        }
        tracing::info!(
            repos = repos.len(),
            items = result.items.len(),
            incomplete = result.incomplete,
            "fetched recent activity"
        );
        Ok(result)
    }

    async fn enrich_item_context(&self, item_id: &str) -> Result<String, FetchError> {
        let (repo, number) = self
            .known
            .lock()
            .ok()
            .and_then(|known| known.get(item_id).cloned())
            .ok_or_else(|| FetchError::UnknownItem(item_id.to_string()))?;

        let url = format!("{}/repos/{}/issues/{}/comments", self.api_base, repo, number);
        let deadline = Instant::now() + self.fetch_timeout;
        let page: Page<Vec<ApiComment>> = self
            .get(&url, &[("per_page", "100".to_string())], deadline)
            .await
            .map_err(RetryError::into_inner)?;

        let start = page.body.len().saturating_sub(COMMENT_CONTEXT_LIMIT);
        let text = page.body[start..]
            .iter()
            .filter_map(|c| {
                let body = c.body.as_deref()?.trim();
                if body.is_empty() {
                    return None;
                }
                let author = c
                    .user
                    .as_ref()
                    .map(|u| normalize_login(u).0)
                    .unwrap_or_else(|| "ghost".to_string());
                Some(format!("{}: {}", author, body))
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }
}
