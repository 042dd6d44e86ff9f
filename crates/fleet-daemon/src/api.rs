//! HTTP status and dispatch API.
//!
//! A small axum surface over the coordination service: health, target and
//! group listings, and the single/bulk execute endpoints. Handlers share an
//! `Arc<CoordinationService>` as router state.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use fleet_control::{CoordinationService, ExecutorError};
use fleet_core::types::{CommandRequest, CommandResult, ConnectionInfo, Target};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::EmptyBulk => ApiError::BadRequest(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TargetStatus {
    target: Target,
    connection: ConnectionInfo,
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    targets: Vec<String>,
    command: String,
    #[serde(default)]
    params: serde_json::Value,
    /// Overall deadline for the whole batch, in seconds.
    #[serde(default)]
    deadline_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(service: Arc<CoordinationService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/groups", get(list_groups))
        .route("/execute", post(execute))
        .route("/execute/bulk", post(execute_bulk))
        .with_state(service)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_targets(State(service): State<Arc<CoordinationService>>) -> impl IntoResponse {
    let mut statuses = service.connection_statuses().await;
    let targets = service.targets().await;
    let listing: Vec<TargetStatus> = targets
        .into_iter()
        .map(|target| {
            let connection = statuses.remove(&target.name).unwrap_or_default();
            TargetStatus { target, connection }
        })
        .collect();
    Json(listing)
}

async fn list_groups(State(service): State<Arc<CoordinationService>>) -> impl IntoResponse {
    Json(service.groups().await)
}

async fn execute(
    State(service): State<Arc<CoordinationService>>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResult> {
    Json(service.execute(request).await)
}

async fn execute_bulk(
    State(service): State<Arc<CoordinationService>>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<Vec<CommandResult>>, ApiError> {
    let deadline = request.deadline_secs.map(Duration::from_secs);
    let results = service
        .execute_bulk(&request.targets, &request.command, request.params, deadline)
        .await?;
    Ok(Json(results))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fleet_core::config::Config;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let doc = r#"{
            "targets": [
                {"name": "web-01", "host": "10.0.1.1", "port": 8080, "tags": ["prod"]}
            ],
            "groups": [
                {"name": "production", "tags": ["prod"]}
            ],
            "security": {"audit": {"enabled": false}}
        }"#;
        let (config, _) = Config::parse(doc).unwrap();
        let service = CoordinationService::new(config).await.unwrap();
        router(Arc::new(service))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_router().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn targets_listing_includes_connection_state() {
        let app = test_router().await;
        let response = app
            .oneshot(Request::get("/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body[0]["target"]["name"], "web-01");
        assert_eq!(body[0]["connection"]["status"], "disconnected");
    }

    #[tokio::test]
    async fn groups_listing() {
        let app = test_router().await;
        let response = app
            .oneshot(Request::get("/groups").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await[0]["name"], "production");
    }

    #[tokio::test]
    async fn execute_unknown_target_fails_in_band() {
        let app = test_router().await;
        let request = Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"target": "missing", "command": "get_status"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["failure"], "unknown_target");
    }

    #[tokio::test]
    async fn empty_bulk_is_a_bad_request() {
        let app = test_router().await;
        let request = Request::post("/execute/bulk")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"targets": [], "command": "get_status"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("no targets"));
    }

    #[tokio::test]
    async fn bulk_denied_command_reports_per_slot() {
        let app = test_router().await;
        let request = Request::post("/execute/bulk")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"targets": ["web-01"], "command": "shell_exec"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body[0]["target"], "web-01");
        assert_eq!(body[0]["failure"], "not_allowed");
    }
}
