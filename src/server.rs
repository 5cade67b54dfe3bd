//! HTTP boundary: ad-hoc triggers, feedback capture, acknowledgements,
//! suggestions and cancellation.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::db::DbHandle;
use crate::errors::{DeliveryError, TriageError};
use crate::models::TriageFeedback;
use crate::scheduler::Scheduler;

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub user_id: String,
}

/// `action` stays a raw string; unknown values are rejected with the
/// valid set listed.
#[derive(Deserialize)]
pub struct FeedbackRequest {
    pub run_id: String,
    pub user_id: String,
    pub item_id: String,
    pub action: String,
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub workspace: Option<String>,
    pub limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TriageError> for ApiError {
    fn from(err: TriageError) -> Self {
        match err {
            TriageError::InvalidFeedbackAction(_) | TriageError::InvalidFeedback(_) => {
                ApiError::BadRequest(err.to_string())
            }
            TriageError::NotAMember(_) => ApiError::Forbidden(err.to_string()),
            TriageError::UnknownWorkspace(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::InvalidThreadId(_) => ApiError::NotFound(err.to_string()),
            DeliveryError::Ledger(_) => ApiError::Internal(err.to_string()),
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/triage", post(trigger_triage))
        .route("/api/feedback", post(record_feedback))
        .route("/api/messages/{thread_id}/ack", post(acknowledge))
        .route("/api/suggestions", get(suggestions))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/workspaces/{id}/run", delete(cancel_run))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let active = state.scheduler.registry().active();
    Json(serde_json::json!({
        "status": "ok",
        "active_runs": active
            .iter()
            .map(|r| serde_json::json!({
                "workspace_id": r.workspace_id,
                "run_id": r.run_id,
                "trigger": r.trigger,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// Ad-hoc run for the caller's workspace. Waits for the run (or the one
/// already in flight) and returns its final record.
async fn trigger_triage(
    State(state): State<SharedState>,
    Json(req): Json<TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.scheduler.trigger_ad_hoc(&req.user_id).await?;
    Ok(Json(record))
}

/// Feedback is accepted once it passes validation; storage failures are
/// logged by the recorder and never reach the caller.
async fn record_feedback(
    State(state): State<SharedState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let feedback = TriageFeedback::parse(&req.run_id, &req.user_id, &req.item_id, &req.action)?;
    state
        .scheduler
        .runner()
        .feedback()
        .record_feedback(feedback)
        .await;
    Ok(StatusCode::ACCEPTED)
}

async fn acknowledge(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .scheduler
        .runner()
        .delivery()
        .acknowledge(&thread_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn suggestions(State(state): State<SharedState>) -> impl IntoResponse {
    let suggestions = state
        .scheduler
        .runner()
        .feedback()
        .generate_optimization_suggestions()
        .await;
    Json(serde_json::json!({ "suggestions": suggestions }))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<RunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).min(200);
    let runs = state
        .db
        .call(move |db| db.recent_runs(query.workspace.as_deref(), limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let run = state
        .db
        .call(move |db| db.get_run(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.scheduler.cancel(&id) {
        Some(run_id) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "workspace_id": id, "run_id": run_id })),
        )),
        None => Err(ApiError::NotFound(format!("No run in progress for workspace {}", id))),
    }
}

// ── Server ────────────────────────────────────────────────────────────

/// Serve the HTTP boundary and the cron loop until Ctrl+C.
pub async fn start_server(state: SharedState, port: u16) -> Result<()> {
    let shutdown = CancellationToken::new();
    let scheduler = Arc::clone(&state.scheduler);
    let cron_shutdown = shutdown.clone();
    let cron = tokio::spawn(async move { scheduler.run_forever(cron_shutdown).await });

    let app = build_router(state);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "triage server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = cron.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brief::DigestSynthesizer;
    use crate::config::TriageConfig;
    use crate::context::ConfigContextProvider;
    use crate::db::TriageDb;
    use crate::delivery::{DeliveryChannel, MessageState};
    use crate::errors::FetchError;
    use crate::feedback::StoreFeedbackRecorder;
    use crate::models::{DailyTriageBrief, TriagedItem, fixtures};
    use crate::pipeline::state::RunState;
    use crate::pipeline::{Agents, PipelineRunner};
    use crate::research::{FetchResult, ResearchCollector};
    use crate::triage::RuleBasedOrchestrator;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct OneIssue;

    #[async_trait]
    impl ResearchCollector for OneIssue {
        async fn fetch_recent_activity(
            &self,
            _since: DateTime<Utc>,
            _repos: &[String],
        ) -> Result<FetchResult, FetchError> {
            Ok(FetchResult::complete(vec![fixtures::issue(1, "Leak", &["security"])]))
        }

        async fn enrich_item_context(&self, _item_id: &str) -> Result<String, FetchError> {
            Ok(String::new())
        }
    }

    struct Accepting;

    #[async_trait]
    impl DeliveryChannel for Accepting {
        async fn post_daily_brief(
            &self,
            _brief: &DailyTriageBrief,
            _items: &[TriagedItem],
            channel_id: &str,
        ) -> Result<String, DeliveryError> {
            Ok(format!("{}:1700000000.000100", channel_id))
        }

        async fn post_alert(
            &self,
            _item: &TriagedItem,
            _channel_id: &str,
            _thread_id: Option<&str>,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }

        async fn update_message_state(
            &self,
            _message_id: &str,
            _state: MessageState,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn test_router() -> Router {
        let db = DbHandle::new(TriageDb::new_in_memory().unwrap());
        let mut config = TriageConfig::starter();
        config.workspaces[0].id = "acme".into();
        config.workspaces[0].channel = "C1".into();
        config.workspaces[0].members = vec!["ana".into()];
        let config = Arc::new(config);
        let agents = Agents {
            collector: Arc::new(OneIssue),
            context: Arc::new(ConfigContextProvider::new(&config.workspaces, db.clone())),
            orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
            synthesizer: Arc::new(DigestSynthesizer),
            channel: Arc::new(Accepting),
            feedback: Arc::new(StoreFeedbackRecorder::new(db.clone(), config.triage.clone())),
        };
        let runner = Arc::new(PipelineRunner::new(config, agents, db.clone()));
        build_router(Arc::new(AppState {
            scheduler: Arc::new(Scheduler::new(runner)),
            db,
        }))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_feedback_action_is_rejected() {
        let req = json_request(
            "POST",
            "/api/feedback",
            serde_json::json!({"run_id": "r1", "user_id": "ana", "item_id": "i1", "action": "LIKED"}),
        );
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("CLICKED_LINK"));
    }

    #[tokio::test]
    async fn test_valid_feedback_is_accepted() {
        let req = json_request(
            "POST",
            "/api/feedback",
            serde_json::json!({"run_id": "r1", "user_id": "ana", "item_id": "i1", "action": "DISMISSED"}),
        );
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_ad_hoc_trigger_runs_to_completion() {
        let app = test_router();
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/api/triage", serde_json::json!({"user_id": "ana"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let record = body_json(resp).await;
        assert_eq!(record["state"], RunState::Completed.as_str());
        assert_eq!(record["delivery"], "posted");
        assert_eq!(record["trigger"]["kind"], "ad_hoc");

        let thread = record["thread_id"].as_str().unwrap().to_string();
        let resp = app
            .clone()
            .oneshot(json_request("POST", &format!("/api/messages/{}/ack", thread), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let run_id = record["run_id"].as_str().unwrap();
        let resp = app
            .oneshot(Request::builder().uri(format!("/api/runs/{}", run_id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_member_cannot_trigger() {
        let resp = test_router()
            .oneshot(json_request("POST", "/api/triage", serde_json::json!({"user_id": "mallory"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ack_unknown_thread_is_not_found() {
        let resp = test_router()
            .oneshot(json_request("POST", "/api/messages/C1:42.0/ack", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_not_found() {
        let resp = test_router()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/workspaces/acme/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_suggestions_report_empty_window() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/api/suggestions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["suggestions"][0].as_str().unwrap().starts_with("No feedback recorded"));
    }
}
