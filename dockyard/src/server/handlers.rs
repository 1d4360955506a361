//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::deploy::log_sink::{LogSink, LogSubscription};
use crate::errors::EngineError;
use crate::models::{Deployment, NewProject, Project, ProjectStatus, ProjectUpdate};
use crate::server::state::ServerState;
use crate::utils::version_info;

type ApiResult<T> = Result<T, EngineError>;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "dockyard".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================= PROJECTS ====================================== //

/// Public view of a project. Environment values and the deploy key stay server-side.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectResponse {
    pub id: i64,
    pub name: String,
    pub domain: Option<String>,
    pub repo_url: String,
    pub branch: String,
    pub has_deploy_key: bool,
    pub install_command: String,
    pub build_command: String,
    pub start_command: String,
    pub port: u16,
    pub env_count: usize,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub current_build: i64,
    pub auto_deploy: bool,
    pub webhook_token: String,
    pub host_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Project> for ProjectResponse {
    fn from(project: Project) -> Self {
        Self {
            has_deploy_key: project.deploy_key().is_some(),
            env_count: project.env_vars.len(),
            id: project.id,
            name: project.name,
            domain: project.domain,
            repo_url: project.repo_url,
            branch: project.branch,
            install_command: project.install_command,
            build_command: project.build_command,
            start_command: project.start_command,
            port: project.port,
            status: project.status,
            error_message: project.error_message,
            current_build: project.current_build,
            auto_deploy: project.auto_deploy,
            webhook_token: project.webhook_token,
            host_id: project.host_id,
            created_at: project.created_at,
            updated_at: project.updated_at,
        }
    }
}

pub async fn list_projects_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<Vec<ProjectResponse>>> {
    let projects = state.orchestrator.list_projects().await?;
    Ok(Json(projects.into_iter().map(ProjectResponse::from).collect()))
}

pub async fn create_project_handler(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<NewProject>,
) -> ApiResult<(StatusCode, Json<ProjectResponse>)> {
    let project = state.orchestrator.create_project(req).await?;
    Ok((StatusCode::CREATED, Json(project.into())))
}

pub async fn get_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(state.orchestrator.get_project(id).await?.into()))
}

pub async fn update_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
    Json(patch): Json<ProjectUpdate>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(state.orchestrator.update_project(id, patch).await?.into()))
}

pub async fn delete_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_project(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn regenerate_token_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(
        state.orchestrator.regenerate_webhook_token(id).await?.into(),
    ))
}

// ================================= LIFECYCLE ===================================== //

/// Accepted immediately; the pipeline keeps running in the background
pub async fn build_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let deployment = state.orchestrator.build(id).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(state.orchestrator.start_project(id).await?.into()))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(state.orchestrator.stop_project(id).await?.into()))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub build_num: i64,
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(
        state.orchestrator.rollback(id, req.build_num).await?.into(),
    ))
}

pub async fn deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Deployment>>> {
    Ok(Json(state.orchestrator.list_deployments(id).await?))
}

/// Public webhook; the token is the only credential
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    Path(token): Path<String>,
) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let deployment = state.orchestrator.handle_webhook(&token).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

// =================================== LOGS ======================================== //

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// `build` (default) or `runtime`
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Build number; the project's current build when absent
    pub build: Option<i64>,
    /// Runtime log lines
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<i64>,
    pub content: String,
}

pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    match query.kind.as_deref().unwrap_or("build") {
        "build" => {
            let build_num = match query.build {
                Some(n) => n,
                None => state.orchestrator.get_project(id).await?.current_build,
            };
            if build_num <= 0 {
                return Err(EngineError::NotFound(format!(
                    "project {} has no builds",
                    id
                )));
            }
            let content = state.orchestrator.build_log(id, build_num).await?;
            Ok(Json(LogsResponse {
                kind: "build".to_string(),
                build: Some(build_num),
                content,
            }))
        }
        "runtime" => {
            let content = state.orchestrator.runtime_log(id, query.lines).await?;
            Ok(Json(LogsResponse {
                kind: "runtime".to_string(),
                build: None,
                content,
            }))
        }
        other => Err(EngineError::ValidationError(format!(
            "unknown log type '{}'",
            other
        ))),
    }
}

/// Unsubscribes from the sink when the client goes away
struct Viewer {
    sink: Arc<LogSink>,
    subscription: LogSubscription,
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.sink.unsubscribe(self.subscription.id());
    }
}

/// Live output of the build in flight, one SSE event per chunk.
/// The stream ends when the build finishes.
pub async fn stream_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (sink, subscription) = state.orchestrator.subscribe_build_log(id)?;
    let viewer = Viewer { sink, subscription };

    let stream = stream::unfold(viewer, |mut viewer| async move {
        let chunk = viewer.subscription.recv().await?;
        let text = String::from_utf8_lossy(&chunk).replace('\r', "");
        let event = Event::default().data(text.trim_end_matches('\n'));
        Some((Ok(event), viewer))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
