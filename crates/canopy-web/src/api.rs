//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use canopy_core::datasync::SyncFilter;
use canopy_core::error::CanopyError;
use canopy_core::health;
use canopy_core::session::Agent;
use canopy_core::workspace::{CreateRequest, ServiceOp, ServicesOp};
use canopy_core::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
}

impl AppState {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub has_dirty_state: bool,
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeResponse {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
    pub is_main: bool,
    pub ports: BTreeMap<String, u16>,
    pub docker_state: String,
    pub git_state: String,
    pub ahead: usize,
    pub behind: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorktreeRequest {
    pub branch_name: String,
    #[serde(default)]
    pub from_branch: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub data: Option<DataOptions>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataOptions {
    #[serde(default)]
    pub skip_all: bool,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl From<DataOptions> for SyncFilter {
    fn from(value: DataOptions) -> Self {
        SyncFilter {
            skip_all: value.skip_all,
            include: value.include,
            exclude: value.exclude,
        }
    }
}

#[derive(Deserialize, Default)]
pub struct CreateQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub name: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: Vec<health::HealthCheck>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn map_err(e: CanopyError) -> ApiError {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_conflict() {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_REQUEST
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

/// Health and diagnostics endpoint
pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let repo_root = state.ctx.config.repository_root.clone();
    let registry_path =
        canopy_core::config::Config::ports_file().unwrap_or_else(|_| "ports.json".into());

    let checks = tokio::task::spawn_blocking(move || {
        vec![
            health::check_disk_space(&repo_root),
            health::check_git(),
            health::check_registry_file(&registry_path),
        ]
    })
    .await
    .unwrap_or_default();

    let status = if checks
        .iter()
        .any(|c| c.status == health::CheckStatus::Error)
    {
        "error"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        checks,
    })
}

/// List workspaces with ports, container state, and git state
pub async fn list_worktrees(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorktreeResponse>>, ApiError> {
    let listings = state.ctx.engine.list().await.map_err(map_err)?;

    let responses = listings
        .into_iter()
        .map(|w| {
            let docker_state = match w.container_state {
                canopy_core::workspace::ContainerState::Running => "running",
                canopy_core::workspace::ContainerState::Stopped => "stopped",
                canopy_core::workspace::ContainerState::NotFound => "not-found",
                canopy_core::workspace::ContainerState::Unknown => "unknown",
            };
            WorktreeResponse {
                name: w.name,
                path: w.path.display().to_string(),
                branch: w.branch,
                is_main: w.is_main,
                ports: w.ports,
                docker_state: docker_state.to_string(),
                git_state: w.git.label().to_string(),
                ahead: w.git.ahead,
                behind: w.git.behind,
            }
        })
        .collect();

    Ok(Json(responses))
}

/// Create a workspace.
///
/// Conflicts are reported synchronously as 409 with `hasDirtyState`;
/// otherwise the pipeline runs in the background and the progress
/// event stream is the canonical record (202).
pub async fn create_worktree(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    Json(req): Json<CreateWorktreeRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), Response> {
    let name = req
        .name
        .clone()
        .unwrap_or_else(|| canopy_core::workspace::name_from_branch(&req.branch_name));

    if !query.force {
        if let Ok(existing) = state.ctx.engine.find(&name).await {
            return Err((
                StatusCode::CONFLICT,
                Json(ConflictResponse {
                    has_dirty_state: existing.git.has_uncommitted,
                    message: format!("workspace {name} already exists"),
                }),
            )
                .into_response());
        }
    }

    let agent = match req.agent.as_deref() {
        None => Agent::Shell,
        Some(a) => Agent::parse(a).ok_or_else(|| {
            map_err(CanopyError::InvalidRequest {
                reason: format!("unknown agent: {a}"),
            })
            .into_response()
        })?,
    };

    let create = CreateRequest {
        branch_name: req.branch_name,
        from_branch: req.from_branch,
        name: req.name,
        agent,
        force: query.force,
        data: req.data.unwrap_or_default().into(),
    };

    let engine = Arc::clone(&state.ctx.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.create(create).await {
            // The error progress event already reached subscribers.
            error!(category = "gateway", error = %e, "Background workspace create failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            name,
        }),
    ))
}

/// Delete a workspace and its terminal sessions
pub async fn delete_worktree(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ctx.sessions.destroy_for_workspace(&name).await;
    state.ctx.engine.delete(&name).await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stack-wide service operation: start / stop / restart
pub async fn services_op(
    State(state): State<AppState>,
    Path((name, op)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let op = match op.as_str() {
        "start" => ServicesOp::Start,
        "stop" => ServicesOp::Stop,
        "restart" => ServicesOp::Restart,
        other => {
            return Err(map_err(CanopyError::InvalidRequest {
                reason: format!("unknown services operation: {other}"),
            }))
        }
    };
    state.ctx.engine.services(&name, op).await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Single-service operation: restart / rebuild
pub async fn service_op(
    State(state): State<AppState>,
    Path((name, service, op)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let op = match op.as_str() {
        "restart" => ServiceOp::Restart,
        "rebuild" => ServiceOp::Rebuild,
        other => {
            return Err(map_err(CanopyError::InvalidRequest {
                reason: format!("unknown service operation: {other}"),
            }))
        }
    };
    state
        .ctx
        .engine
        .service(&name, &service, op)
        .await
        .map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Diagnostics: the raw port allocation table
pub async fn get_ports(State(state): State<AppState>) -> Json<BTreeMap<String, u16>> {
    Json(state.ctx.registry.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_options_into_filter() {
        let options = DataOptions {
            skip_all: false,
            include: Some(vec!["postgres-data".to_string()]),
            exclude: vec!["redis-data".to_string()],
        };
        let filter: SyncFilter = options.into();
        assert!(!filter.skip_all);
        assert_eq!(filter.include.as_deref().unwrap().len(), 1);
        assert_eq!(filter.exclude, vec!["redis-data"]);
    }

    #[test]
    fn test_conflict_response_shape() {
        let body = serde_json::to_value(ConflictResponse {
            has_dirty_state: true,
            message: "workspace x already exists".to_string(),
        })
        .unwrap();
        assert_eq!(body["hasDirtyState"], true);
        assert!(body["message"].as_str().unwrap().contains("exists"));
    }

    #[test]
    fn test_create_request_parses_camel_case() {
        let req: CreateWorktreeRequest = serde_json::from_str(
            r#"{
                "branchName": "feature/login",
                "fromBranch": "main",
                "agent": "claude",
                "data": {"skipAll": false, "include": ["postgres-data"]}
            }"#,
        )
        .unwrap();
        assert_eq!(req.branch_name, "feature/login");
        assert_eq!(req.from_branch.as_deref(), Some("main"));
        assert_eq!(req.agent.as_deref(), Some("claude"));
        assert!(req.data.unwrap().include.is_some());
    }
}
