//! REST API handlers using axum

use crate::application::{ProcessStatus, StatusEntry, Supervisor};
use crate::domain::DomainError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared application state
pub type AppState = Arc<Supervisor>;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

impl From<DomainError> for ErrorResponse {
    fn from(e: DomainError) -> Self {
        Self { error: e.to_string() }
    }
}

/// Map a domain error onto an HTTP status
fn api_error(e: DomainError) -> ApiError {
    let status = match e {
        DomainError::ProcessNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(e.into()))
}

/// Command request; `args` names processes or groups
#[derive(Debug, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub args: Vec<String>,
}

/// Load request
#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub path: String,
}

/// Processes affected by a command
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub processes: Vec<ProcessStatus>,
}

/// Status listing
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub processes: Vec<StatusEntry>,
}

/// Names registered by a load
#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub loaded: Vec<String>,
}

/// Simple success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

// ===== Handlers =====

/// POST /commands/:command - Apply a user command
pub async fn run_command(
    State(supervisor): State<AppState>,
    Path(command): Path<String>,
    body: Option<Json<CommandRequest>>,
) -> Result<Json<CommandResponse>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    info!(command = %command, args = ?req.args, "REST command request");

    let processes = supervisor.command(&command, &req.args).await.map_err(|e| {
        warn!(command = %command, error = %e, "Command rejected");
        api_error(e)
    })?;
    Ok(Json(CommandResponse { processes }))
}

/// GET /status - Every process
pub async fn status_all(State(supervisor): State<AppState>) -> Json<StatusResponse> {
    debug!("REST status request");
    Json(StatusResponse {
        processes: supervisor.status(&[]).await,
    })
}

/// GET /status/:target - A process or group
pub async fn status_target(
    State(supervisor): State<AppState>,
    Path(target): Path<String>,
) -> Json<StatusResponse> {
    debug!(target = %target, "REST status request");
    Json(StatusResponse {
        processes: supervisor.status(&[target]).await,
    })
}

/// POST /load - Load a YAML file or directory
pub async fn load_config(
    State(supervisor): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadResponse>, ApiError> {
    info!(path = %req.path, "REST load request");
    let loaded = supervisor
        .load(std::path::Path::new(&req.path))
        .await
        .map_err(|e| {
            warn!(path = %req.path, error = %e, "Load failed");
            api_error(e)
        })?;
    Ok(Json(LoadResponse { loaded }))
}

/// DELETE /processes/:name - Stop supervising and forget a process
pub async fn remove_process(
    State(supervisor): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    info!(process = %name, "REST remove request");
    supervisor.remove(&name).await.map_err(api_error)?;
    Ok(Json(SuccessResponse {
        message: format!("Process '{}' removed", name),
    }))
}

/// POST /shutdown - Stop the daemon
pub async fn shutdown(State(supervisor): State<AppState>) -> Json<SuccessResponse> {
    info!("REST shutdown request");
    supervisor.shutdown().await;
    Json(SuccessResponse {
        message: "Shutting down".to_string(),
    })
}
