//! Read-only HTTP API for the dashboard.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use queuectl_core::app::App;
use queuectl_core::domain::{JobState, QueueError, UnknownState};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

const DASHBOARD_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

type ApiResult = Result<Json<Value>, Response>;

pub(crate) fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/status", get(status))
        .route("/api/jobs", get(jobs))
        .route("/api/jobs/:state", get(jobs_by_state))
        .route("/api/workers", get(workers))
        .layer(cors())
        .with_state(app)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(DASHBOARD_ORIGINS.map(HeaderValue::from_static))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "queuectl API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(app): State<Arc<App>>) -> ApiResult {
    let report = app.status().await.map_err(queue_error)?;
    Ok(Json(json!({
        "success": true,
        "summary": report.summary,
        "queues": report.depths,
        "worker_count": report.worker_count,
        "workers": report.workers,
    })))
}

async fn jobs(State(app): State<Arc<App>>) -> ApiResult {
    let jobs = app.engine.list_jobs(None).await.map_err(queue_error)?;
    Ok(Json(json!({
        "success": true,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

async fn jobs_by_state(State(app): State<Arc<App>>, Path(state): Path<String>) -> ApiResult {
    let parsed: JobState = state.parse().map_err(|e: UnknownState| {
        json_error(StatusCode::BAD_REQUEST, "invalid_state", e.to_string())
    })?;
    let jobs = app
        .engine
        .list_jobs(Some(parsed))
        .await
        .map_err(queue_error)?;
    Ok(Json(json!({
        "success": true,
        "state": parsed,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

async fn workers(State(app): State<Arc<App>>) -> ApiResult {
    let workers = app.registry.list().await.map_err(|e| {
        error!(error = %e, "listing workers failed");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
    })?;
    Ok(Json(json!({
        "success": true,
        "count": workers.len(),
        "workers": workers,
    })))
}

fn queue_error(err: QueueError) -> Response {
    error!(error = %err, "api query failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use queuectl_core::app::AppBuilder;
    use queuectl_core::config::QueueConfig;
    use queuectl_core::impls::MemoryStore;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStore>, Arc<App>) {
        let store = Arc::new(MemoryStore::new());
        let app = AppBuilder::new(QueueConfig::default())
            .store(store.clone())
            .build()
            .unwrap();
        (store, Arc::new(app))
    }

    async fn get_json(app: Arc<App>, uri: &str) -> (StatusCode, Value) {
        let response = router(app)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_reports_counts_and_workers() {
        let (_, app) = app();
        app.engine.submit("echo hi", None).await.unwrap();

        let (status, body) = get_json(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["summary"]["counts"]["PENDING"], 1);
        assert_eq!(body["summary"]["total"], 1);
        assert_eq!(body["queues"]["pending"], 1);
        assert_eq!(body["worker_count"], 0);
    }

    #[tokio::test]
    async fn jobs_by_state_is_case_insensitive() {
        let (_, app) = app();
        app.engine.submit("echo a", None).await.unwrap();
        app.engine.submit("echo b", None).await.unwrap();
        app.engine.fetch_next().await.unwrap();

        let (status, body) = get_json(app.clone(), "/api/jobs/pending").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "PENDING");
        assert_eq!(body["count"], 1);
        assert_eq!(body["jobs"][0]["command"], "echo b");

        let (_, all) = get_json(app, "/api/jobs").await;
        assert_eq!(all["count"], 2);
    }

    #[tokio::test]
    async fn unknown_state_is_a_bad_request() {
        let (_, app) = app();
        let (status, body) = get_json(app, "/api/jobs/failed").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_state");
    }

    #[tokio::test]
    async fn store_failures_are_internal_errors() {
        let (store, app) = app();
        store.set_unavailable(true);

        let (status, body) = get_json(app.clone(), "/api/jobs").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "store_error");

        let (status, _) = get_json(app, "/api/workers").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn root_names_the_service() {
        let (_, app) = app();
        let (status, body) = get_json(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "queuectl API");
    }
}
