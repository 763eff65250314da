//! Kernel service HTTP API.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::ApiError;
use crate::kernel::{Heartbeat, KernelManager};
use crate::state::KernelResource;

#[derive(Clone)]
pub struct KernelAppState {
    pub kernels: Arc<KernelManager>,
}

/// `?callback=&token=` on allocate.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    callback: String,
    token: String,
}

/// Optional `?callback=&token=` on delete.
#[derive(Debug, Default, Deserialize)]
struct OptionalCallbackQuery {
    callback: Option<String>,
    token: Option<String>,
}

pub fn build_kernel_router(state: KernelAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runtime/ping", get(runtime_ping))
        .route("/kernels", post(allocate_kernel).get(list_kernels))
        .route("/kernels/{kernel_id}", get(get_kernel).delete(delete_kernel))
        .route("/kernels/{kernel_id}/stats", get(kernel_stats))
        .route("/internal/register/{kernel_id}", post(register_kernel))
        .with_state(state)
}

async fn health(State(state): State<KernelAppState>) -> impl IntoResponse {
    match state.kernels.runtime_version().await {
        Ok(runtime) => (StatusCode::OK, Json(json!({ "status": "OK", "runtime": runtime }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "UNAVAILABLE", "message": e.to_string() })),
        ),
    }
}

async fn runtime_ping(State(state): State<KernelAppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": state.kernels.runtime().ping().await }))
}

async fn allocate_kernel(
    State(state): State<KernelAppState>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<KernelResource>), ApiError> {
    let Query(query) = query?;
    let kernel = state.kernels.allocate(&query.callback, &query.token).await?;
    Ok((StatusCode::CREATED, Json(kernel)))
}

async fn list_kernels(
    State(state): State<KernelAppState>,
) -> Result<Json<Vec<KernelResource>>, ApiError> {
    Ok(Json(state.kernels.list().await?))
}

async fn get_kernel(
    State(state): State<KernelAppState>,
    Path(kernel_id): Path<String>,
) -> Result<Json<KernelResource>, ApiError> {
    Ok(Json(state.kernels.get(&kernel_id).await?))
}

async fn delete_kernel(
    State(state): State<KernelAppState>,
    Path(kernel_id): Path<String>,
    query: Result<Query<OptionalCallbackQuery>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(query) = query?;
    state
        .kernels
        .delete(&kernel_id, query.callback.as_deref(), query.token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kernel_stats(
    State(state): State<KernelAppState>,
    Path(kernel_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.kernels.stats(&kernel_id).await?))
}

async fn register_kernel(
    State(state): State<KernelAppState>,
    Path(kernel_id): Path<String>,
    heartbeat: Result<Json<Heartbeat>, JsonRejection>,
) -> Result<Json<KernelResource>, ApiError> {
    let Json(heartbeat) = heartbeat?;
    let kernel = state
        .kernels
        .register_container_ready(&kernel_id, &heartbeat)
        .await?;
    Ok(Json(kernel))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::adapters::FakeRuntime;
    use crate::config::KernelServiceConfig;
    use crate::state::KernelRepository;

    fn router(runtime: Arc<FakeRuntime>) -> Router {
        let manager = KernelManager::new(
            &KernelServiceConfig::default(),
            KernelRepository::in_memory().unwrap(),
            runtime,
        )
        .unwrap();
        build_kernel_router(KernelAppState {
            kernels: Arc::new(manager),
        })
    }

    async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn allocate_get_list_delete() {
        let runtime = Arc::new(FakeRuntime::new());
        let router = router(runtime.clone());

        let (status, kernel) = send(&router, Method::POST, "/kernels?callback=http://cb&token=t").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(kernel["status"], "starting");
        let id = kernel["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&router, Method::GET, &format!("/kernels/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["container_id"], kernel["container_id"]);

        let (_, all) = send(&router, Method::GET, "/kernels").await;
        assert_eq!(all.as_array().unwrap().len(), 1);

        let (status, _) = send(&router, Method::DELETE, &format!("/kernels/{id}")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(runtime.terminated().len(), 1);

        let (status, body) = send(&router, Method::GET, &format!("/kernels/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn allocate_requires_callback_query() {
        let router = router(Arc::new(FakeRuntime::new()));
        let (status, body) = send(&router, Method::POST, "/kernels").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn health_and_ping_report_runtime() {
        let router = router(Arc::new(FakeRuntime::new()));

        let (status, health) = send(&router, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["runtime"]["Version"], "fake");

        let (_, ping) = send(&router, Method::GET, "/runtime/ping").await;
        assert_eq!(ping["ok"], true);
    }

    #[tokio::test]
    async fn failed_launch_is_bad_gateway() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_launches(true);
        let router = router(runtime);

        let (status, body) = send(&router, Method::POST, "/kernels?callback=c&token=t").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "upstream_failure");
    }
}
