//! Push-notification receiver.
//!
//! Accepts broker notifications for subscription-triggered tasks and hands
//! each entity batch to the task identified by the correlation id in the
//! path.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/update/{cid}` | Feed a notification to task `cid` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The notification body is `{ "subscriptionId": "...", "data": [entity, ...] }`.
//! Scope paths are read from the comma-separated `Fiware-ServicePath`
//! header and matched to entities by position.
//!
//! The receiver answers as soon as the batch is routed; the feed itself runs
//! in the background and its outcome is only logged.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no task with cid: 1234" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404).

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use context_feeder_core::models::Entity;

use crate::orchestrator::TaskRegistry;

const SERVICE_PATH_HEADER: &str = "fiware-servicepath";

/// Build the receiver's router.
pub fn router(registry: Arc<TaskRegistry>) -> Router {
    Router::new()
        .route("/api/update/{cid}", post(handle_update))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve the receiver on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, registry: Arc<TaskRegistry>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, tasks = registry.len(), "receiver listening");
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/update/{cid} ============

/// Notification body sent by the broker.
#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "subscriptionId", default)]
    subscription_id: Option<String>,
    data: Vec<Entity>,
}

#[derive(Serialize)]
struct UpdateAccepted {
    status: &'static str,
    entities: usize,
}

/// Scope paths from a `Fiware-ServicePath` header value.
pub fn parse_scope_paths(header: Option<&str>) -> Vec<String> {
    header
        .into_iter()
        .flat_map(|h| h.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

async fn handle_update(
    State(registry): State<Arc<TaskRegistry>>,
    Path(cid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UpdateAccepted>, AppError> {
    let task = registry
        .get(&cid)
        .ok_or_else(|| not_found(format!("no task with cid: {}", cid)))?;

    let notification: Notification = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid notification: {}", e)))?;

    let scope_paths = parse_scope_paths(
        headers
            .get(SERVICE_PATH_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let entities = notification.data;
    let count = entities.len();

    info!(
        task = %task.name(),
        cid = %cid,
        subscription = notification.subscription_id.as_deref().unwrap_or("-"),
        entities = count,
        "notification received"
    );

    tokio::spawn(async move {
        let report = task.feed(&entities, &scope_paths).await;
        if report.failed_items > 0 || report.failed_requests > 0 {
            warn!(
                task = %task.name(),
                documents = report.documents_written,
                failed_items = report.failed_items,
                failed_requests = report.failed_requests,
                "notification fed with failures"
            );
        } else {
            info!(
                task = %task.name(),
                documents = report.documents_written,
                skipped = report.attributes_skipped,
                "notification fed"
            );
        }
    });

    Ok(Json(UpdateAccepted {
        status: "accepted",
        entities: count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope_paths() {
        assert!(parse_scope_paths(None).is_empty());
        assert_eq!(parse_scope_paths(Some("/a")), vec!["/a"]);
        assert_eq!(
            parse_scope_paths(Some("/a, /b/c ,,")),
            vec!["/a", "/b/c"]
        );
    }
}
