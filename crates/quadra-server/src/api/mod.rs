//! API module for the Quadra Server
//!
//! This module contains the API routes and handlers for the Quadra
//! Server: sync triggers under `/v1/sync` and the job introspection
//! board under `/v1/board`.

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use quadra_core::JobState;

use crate::server::QuadraServer;

pub mod errors;

pub use errors::ApiError;

/// Build the router for API endpoints
pub fn build_router(server: Arc<QuadraServer>) -> Router {
    Router::new()
        // Sync triggers
        .route("/v1/sync/components", post(handle_sync_components))
        .route("/v1/sync/enrollments", post(handle_sync_enrollments))
        // Introspection board
        .route("/v1/board/queues", get(handle_list_queues))
        .route("/v1/board/queues/:queue/jobs", get(handle_queue_jobs))
        .route(
            "/v1/board/jobs/:id",
            get(handle_job_detail).delete(handle_remove_job),
        )
        .route("/v1/board/jobs/:id/retry", post(handle_retry_job))
        // Health check
        .route("/health", get(handle_health))
        // Request tracing
        .layer(TraceLayer::new_for_http())
        // Shared state
        .with_state(server)
}

/// Check the bearer token on a board write request. A server without a
/// configured admin key accepts everything.
fn require_admin(server: &QuadraServer, headers: &HeaderMap) -> Result<(), ApiError> {
    if !server.admin_auth_required() {
        return Ok(());
    }

    let token = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if server.validate_admin_token(token) => Ok(()),
        _ => Err(ApiError::Unauthorized(
            "Invalid or missing admin token".to_string(),
        )),
    }
}

/// Request for triggering a component sync.
///
/// Without `confirm_hash` this previews: the upstream catalog is
/// fetched and hashed, and nothing is dispatched. Echoing the preview's
/// hash back as `confirm_hash` dispatches the sync.
#[derive(Debug, Deserialize)]
struct ComponentsSyncRequest {
    /// Season to sync, "year:term"; defaults to the configured season
    season: Option<String>,

    /// Hash of a previous preview to confirm
    confirm_hash: Option<String>,
}

async fn handle_sync_components(
    State(server): State<Arc<QuadraServer>>,
    Json(request): Json<ComponentsSyncRequest>,
) -> Result<Response, ApiError> {
    match request.confirm_hash {
        Some(hash) => {
            let job_id = server.confirm_components(&hash).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "job_id": job_id, "status": "dispatched" })),
            )
                .into_response())
        }
        None => {
            let preview = server.preview_components(request.season.as_deref()).await?;
            Ok((StatusCode::OK, Json(preview)).into_response())
        }
    }
}

/// Request for triggering an enrollment sync flow
#[derive(Debug, Deserialize)]
struct EnrollmentsSyncRequest {
    /// Upstream link to fetch enrollments from
    link: String,

    /// Season the enrollments belong to; defaults to the configured
    /// season
    season: Option<String>,
}

async fn handle_sync_enrollments(
    State(server): State<Arc<QuadraServer>>,
    Json(request): Json<EnrollmentsSyncRequest>,
) -> Result<Response, ApiError> {
    if request.link.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Request must include a non-empty enrollment link".to_string(),
        ));
    }

    let dispatch = server
        .trigger_enrollments(&request.link, request.season.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(dispatch)).into_response())
}

async fn handle_list_queues(
    State(server): State<Arc<QuadraServer>>,
) -> Result<Response, ApiError> {
    let board = server.board().await?;
    Ok((StatusCode::OK, Json(board)).into_response())
}

#[derive(Debug, Deserialize)]
struct QueueJobsQuery {
    state: Option<JobState>,
}

async fn handle_queue_jobs(
    State(server): State<Arc<QuadraServer>>,
    Path(queue): Path<String>,
    Query(query): Query<QueueJobsQuery>,
) -> Result<Response, ApiError> {
    let jobs = server.queue_jobs(&queue, query.state).await?;
    Ok((StatusCode::OK, Json(json!({ "queue": queue, "jobs": jobs }))).into_response())
}

async fn handle_job_detail(
    State(server): State<Arc<QuadraServer>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = server.job_detail(&id).await?;
    Ok((StatusCode::OK, Json(job)).into_response())
}

async fn handle_retry_job(
    State(server): State<Arc<QuadraServer>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&server, &headers)?;
    server.retry_job(&id).await?;
    Ok((StatusCode::OK, Json(json!({ "job_id": id, "status": "requeued" }))).into_response())
}

async fn handle_remove_job(
    State(server): State<Arc<QuadraServer>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&server, &headers)?;
    server.remove_job(&id).await?;
    Ok((StatusCode::OK, Json(json!({ "job_id": id, "status": "removed" }))).into_response())
}

async fn handle_health(State(server): State<Arc<QuadraServer>>) -> impl IntoResponse {
    (StatusCode::OK, Json(server.health().await))
}
