//! Project service HTTP API, kernel webhook and tunnel.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiError;
use crate::credential::CredentialSigner;
use crate::event::KernelEvent;
use crate::project::{ConnectOutcome, ProjectManager, Tunnel, TunnelRequest};
use crate::state::Project;

#[derive(Clone)]
pub struct ProjectAppState {
    pub projects: Arc<ProjectManager>,
    pub tunnel: Tunnel,
    pub signer: CredentialSigner,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    skip: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    10
}

pub fn build_project_router(state: ProjectAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(list_projects))
        .route(
            "/projects/{project_id}",
            get(get_project).delete(delete_project),
        )
        .route("/projects/{project_id}/connect", post(connect_kernel))
        .route("/projects/{project_id}/disconnect", post(disconnect_kernel))
        .route("/projects/{project_id}/checkpoint", post(checkpoint))
        .route("/webhook/kernel/projects", put(kernel_webhook))
        .route("/tunnel/{kernel_id}", any(tunnel_root))
        .route("/tunnel/{kernel_id}/", any(tunnel_root))
        .route("/tunnel/{kernel_id}/{*destination}", any(tunnel))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

async fn create_project(
    State(state): State<ProjectAppState>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.projects.create().await?)))
}

async fn list_projects(
    State(state): State<ProjectAppState>,
    page: Result<Query<Page>, QueryRejection>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let Query(page) = page?;
    Ok(Json(state.projects.list(page.skip, page.limit).await?))
}

async fn get_project(
    State(state): State<ProjectAppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.get(&project_id).await?))
}

async fn delete_project(
    State(state): State<ProjectAppState>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.projects.delete(&project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn connect_kernel(
    State(state): State<ProjectAppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ConnectOutcome>, ApiError> {
    Ok(Json(state.projects.connect_kernel(&project_id).await?))
}

async fn disconnect_kernel(
    State(state): State<ProjectAppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.disconnect_kernel(&project_id).await?))
}

async fn checkpoint(
    State(state): State<ProjectAppState>,
    Path(project_id): Path<String>,
    graph: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(graph) = graph?;
    let saved_at = state.projects.checkpoint(&project_id, graph).await?;
    Ok(Json(json!({ "status": "ok", "saved_at": saved_at })))
}

async fn kernel_webhook(
    State(state): State<ProjectAppState>,
    headers: HeaderMap,
    event: Result<Json<KernelEvent>, JsonRejection>,
) -> Result<Json<Project>, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let claims = state.signer.verify_header(authorization)?;
    let Json(event) = event?;

    tracing::debug!(
        project_id = %claims.project_id,
        kernel_id = %event.kernel_id,
        event = event.kind.as_str(),
        "Kernel webhook received"
    );
    Ok(Json(
        state.projects.handle_kernel_event(&claims.project_id, &event).await?,
    ))
}

async fn tunnel_root(
    State(state): State<ProjectAppState>,
    Path(kernel_id): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    forward(&state, &kernel_id, "", method, headers, query, body).await
}

async fn tunnel(
    State(state): State<ProjectAppState>,
    Path((kernel_id, destination)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    forward(&state, &kernel_id, &destination, method, headers, query, body).await
}

async fn forward(
    state: &ProjectAppState,
    kernel_id: &str,
    destination: &str,
    method: Method,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = TunnelRequest {
        method,
        headers,
        query,
        body,
    };
    let upstream = state.tunnel.forward(kernel_id, destination, request).await?;

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}
