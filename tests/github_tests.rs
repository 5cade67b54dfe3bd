//! GitHub adapter against a mock REST API.

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use triage::config::GitHubSection;
use triage::errors::FetchError;
use triage::models::{CiStatus, ItemType, MergeStatus, ReviewStatus, internal_item_id};
use triage::research::{GitHubCollector, ResearchCollector};
use triage::retry::RetryPolicy;

const REPO: &str = "acme/api";

fn section(server: &MockServer) -> GitHubSection {
    GitHubSection {
        api_base: server.uri(),
        repos: vec![REPO.to_string()],
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        },
        fetch_timeout_secs: 10,
        ..Default::default()
    }
}

fn collector(server: &MockServer) -> GitHubCollector {
    GitHubCollector::new(&section(server), "ghp_test".to_string())
}

fn api_issue(id: u64, number: i64, title: &str, labels: &[&str], pull: bool) -> Value {
    let created = (Utc::now() - Duration::hours(5)).to_rfc3339();
    let updated = (Utc::now() - Duration::hours(1)).to_rfc3339();
    let mut issue = json!({
        "id": id,
        "number": number,
        "title": title,
        "body": null,
        "state": "open",
        "html_url": format!("https://github.com/{}/issues/{}", REPO, number),
        "user": {"login": "dana", "type": "User"},
        "assignees": [],
        "labels": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
        "created_at": created,
        "updated_at": updated,
        "closed_at": null,
    });
    if pull {
        issue["pull_request"] = json!({"url": "ignored"});
        issue["user"] = json!({"login": "dependabot[bot]", "type": "Bot"});
    }
    issue
}

fn since() -> chrono::DateTime<Utc> {
    Utc::now() - Duration::hours(24)
}

#[tokio::test]
async fn fetches_issues_and_pull_request_state() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .and(header("authorization", "Bearer ghp_test"))
        .and(query_param("state", "all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            api_issue(101, 1, "Crash on login", &["bug"], false),
            api_issue(102, 2, "Bump serde", &[], true),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/pulls/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "draft": false,
            "merged": false,
            "state": "open",
            "mergeable_state": "dirty",
            "head": {"sha": "abc123"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/pulls/2/reviews"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"user": {"login": "ben", "type": "User"}, "state": "APPROVED", "submitted_at": Utc::now().to_rfc3339()}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/commits/abc123/status"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"state": "failure", "total_count": 3})),
        )
        .mount(&server)
        .await;

    let result = collector(&server)
        .fetch_recent_activity(since(), &[])
        .await
        .unwrap();

    assert!(!result.incomplete);
    assert_eq!(result.items.len(), 2);

    let issue = &result.items[0];
    assert_eq!(issue.item_type, ItemType::Issue);
    assert_eq!(issue.id, internal_item_id("github", "101"));
    assert!(issue.has_label("bug"));
    assert!(issue.description.is_empty());

    let pr = &result.items[1];
    assert_eq!(pr.item_type, ItemType::PullRequest);
    assert_eq!(pr.author, "dependabot");
    assert!(pr.author_is_bot);
    let state = pr.pull_request.as_ref().unwrap();
    assert_eq!(state.merge_status, MergeStatus::Conflict);
    assert_eq!(state.review_status, ReviewStatus::Approved);
    assert_eq!(state.ci_status, CiStatus::Failure);
    assert!(state.last_review_at.is_some());
}

#[tokio::test]
async fn follows_pagination_and_drops_duplicates() {
    let server = MockServer::start().await;
    let next = format!("{}/repos/acme/api/issues?page=2", server.uri());

    // More specific mock first; wiremock matches in mount order.
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            api_issue(102, 2, "Second", &[], false),
            api_issue(103, 3, "Third", &[], false),
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{}>; rel=\"next\"", next).as_str())
                .set_body_json(json!([
                    api_issue(101, 1, "First", &[], false),
                    api_issue(102, 2, "Second", &[], false),
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let result = collector(&server)
        .fetch_recent_activity(since(), &[REPO.to_string()])
        .await
        .unwrap();

    let numbers: Vec<i64> = result.items.iter().map(|i| i.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(!result.incomplete);
}

#[tokio::test]
async fn rate_limit_mid_fetch_returns_partial_result() {
    let server = MockServer::start().await;
    let next = format!("{}/repos/acme/api/issues?page=2", server.uri());

    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .and(query_param("page", "2"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_string("slow down"),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{}>; rel=\"next\"", next).as_str())
                .set_body_json(json!([api_issue(101, 1, "First", &[], false)])),
        )
        .mount(&server)
        .await;

    let result = collector(&server)
        .fetch_recent_activity(since(), &[])
        .await
        .unwrap();

    assert_eq!(result.items.len(), 1);
    assert!(result.incomplete);
    assert!(result.note.unwrap().contains("acme/api"));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([api_issue(101, 1, "First", &[], false)])),
        )
        .mount(&server)
        .await;

    let result = collector(&server)
        .fetch_recent_activity(since(), &[])
        .await
        .unwrap();
    assert_eq!(result.items.len(), 1);
    assert!(!result.incomplete);
}

#[tokio::test]
async fn stalled_response_is_cut_off_at_the_fetch_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([api_issue(101, 1, "First", &[], false)]))
                .set_delay(std::time::Duration::from_secs(8)),
        )
        .mount(&server)
        .await;

    let section = GitHubSection {
        fetch_timeout_secs: 1,
        ..section(&server)
    };
    let started = std::time::Instant::now();
    let result = GitHubCollector::new(&section, "ghp_test".to_string())
        .fetch_recent_activity(since(), &[])
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert!(result.items.is_empty());
    assert!(result.incomplete);
    assert!(result.note.unwrap().contains("acme/api"));
}

#[tokio::test]
async fn bad_credentials_abort_the_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .expect(1)
        .mount(&server)
        .await;

    let err = collector(&server)
        .fetch_recent_activity(since(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 401, .. }));
}

#[tokio::test]
async fn future_since_is_rejected() {
    let server = MockServer::start().await;
    let err = collector(&server)
        .fetch_recent_activity(Utc::now() + Duration::hours(1), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidSince(_)));
}

#[tokio::test]
async fn enrichment_reads_recent_comments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([api_issue(101, 7, "Flaky job", &[], false)])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/api/issues/7/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"user": {"login": "ana", "type": "User"}, "body": "Seen on main too"},
            {"user": {"login": "ben", "type": "User"}, "body": "   "},
            {"user": {"login": "ci[bot]", "type": "Bot"}, "body": "Job 42 failed"}
        ])))
        .mount(&server)
        .await;

    let collector = collector(&server);
    let result = collector.fetch_recent_activity(since(), &[]).await.unwrap();
    let text = collector
        .enrich_item_context(&result.items[0].id)
        .await
        .unwrap();
    assert_eq!(text, "ana: Seen on main too\nci: Job 42 failed");

    let err = collector.enrich_item_context("unseen").await.unwrap_err();
    assert!(matches!(err, FetchError::UnknownItem(_)));
}

#[test]
fn missing_token_is_reported_by_name() {
    let section = GitHubSection {
        token_env: "TRIAGE_TEST_UNSET_GITHUB_TOKEN".to_string(),
        ..Default::default()
    };
    match GitHubCollector::from_env(&section) {
        Err(FetchError::MissingToken(name)) => assert_eq!(name, "TRIAGE_TEST_UNSET_GITHUB_TOKEN"),
        Err(other) => panic!("Expected MissingToken, got {:?}", other),
        Ok(_) => panic!("Expected MissingToken"),
    }
}
