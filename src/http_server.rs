//! HTTP server implementation using Axum.

use crate::error::{AbortReason, SessionError, SupervisorError};
use crate::session::{Input, Step};
use crate::state::AppState;
use crate::supervisor::{DeployRequest, Deployed, Removal};
use crate::types::{Deployment, DeploymentId, DeploymentSummary, EntryPoint, OwnerId};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Base64 inflates archives by a third; this leaves room for ~48 MiB zips.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_OUTPUT_BYTES: u64 = 64 * 1024;

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn api_error(status: StatusCode, error: &'static str, message: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error,
            message: message.to_string(),
        }),
    )
}

impl From<AbortReason> for ApiError {
    fn from(reason: AbortReason) -> Self {
        let status = match reason {
            AbortReason::LaunchFailed(_) | AbortReason::RegistrationFailed(_) | AbortReason::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        api_error(status, reason.kind(), &reason)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoSession => api_error(StatusCode::NOT_FOUND, "no_session", &e),
            SessionError::UnexpectedInput { .. } => {
                api_error(StatusCode::CONFLICT, "unexpected_input", &e)
            }
            SessionError::InvalidInput(inner) => AbortReason::from(inner).into(),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "not_found", &e),
            _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &e),
        }
    }
}

// Request/Response types
#[derive(Deserialize)]
struct DeployBody {
    /// Base64-encoded zip archive.
    archive: String,
    #[serde(default)]
    archive_name: Option<String>,
    entry_point: String,
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Deserialize)]
struct ArchiveBody {
    archive: String,
    #[serde(default)]
    archive_name: Option<String>,
}

#[derive(Deserialize)]
struct EntryPointBody {
    entry_point: String,
}

#[derive(Deserialize)]
struct SecretBody {
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Deserialize)]
struct OutputQuery {
    max_bytes: Option<u64>,
}

#[derive(Serialize)]
struct SessionStarted {
    awaiting: &'static str,
    replaced: bool,
}

#[derive(Serialize)]
struct Awaiting {
    awaiting: &'static str,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/owners/:owner/deployments",
            post(deploy).get(list_deployments),
        )
        .route(
            "/owners/:owner/deployments/:id",
            get(get_deployment).delete(terminate_deployment),
        )
        .route("/owners/:owner/deployments/:id/output", get(read_output))
        .route(
            "/owners/:owner/session",
            post(start_session).get(session_info).delete(cancel_session),
        )
        .route("/owners/:owner/session/archive", post(session_archive))
        .route("/owners/:owner/session/entry-point", post(session_entry_point))
        .route("/owners/:owner/session/secret", post(session_secret))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until the process is stopped.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    state.sessions.spawn_janitor(SESSION_SWEEP_PERIOD);
    state.supervisor.spawn_reconciler();

    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

/// Run the HTTP server on the given address with the provided state.
pub async fn run_server(addr: SocketAddr, state: AppState) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

async fn health() -> &'static str {
    "OK"
}

fn owner_id(raw: String) -> ApiResult<OwnerId> {
    OwnerId::new(raw).map_err(|e| AbortReason::from(e).into())
}

fn decode_archive(encoded: &str) -> ApiResult<Vec<u8>> {
    STANDARD.decode(encoded.trim()).map_err(|e| {
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_archive",
            format!("archive is not valid base64: {e}"),
        )
    })
}

async fn run_deploy(
    state: &AppState,
    request: DeployRequest,
) -> ApiResult<(StatusCode, Json<Deployed>)> {
    let deployed = state.supervisor.deploy(request).await?;
    Ok((StatusCode::CREATED, Json(deployed)))
}

async fn deploy(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<DeployBody>,
) -> ApiResult<(StatusCode, Json<Deployed>)> {
    let owner = owner_id(owner)?;
    let entry_point = EntryPoint::new(body.entry_point).map_err(AbortReason::from)?;
    let archive = decode_archive(&body.archive)?;
    info!(%owner, bytes = archive.len(), "POST deploy");

    run_deploy(
        &state,
        DeployRequest {
            owner,
            archive,
            archive_name: body.archive_name,
            entry_point,
            secret: body.secret,
        },
    )
    .await
}

async fn list_deployments(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<Vec<DeploymentSummary>>> {
    let owner = owner_id(owner)?;
    Ok(Json(state.supervisor.list(&owner).await))
}

async fn get_deployment(
    State(state): State<AppState>,
    Path((owner, id)): Path<(String, u64)>,
) -> ApiResult<Json<Deployment>> {
    let owner = owner_id(owner)?;
    let id = DeploymentId::new(id);
    state
        .supervisor
        .get(&owner, id)
        .await
        .map(Json)
        .ok_or_else(|| SupervisorError::NotFound(id).into())
}

async fn read_output(
    State(state): State<AppState>,
    Path((owner, id)): Path<(String, u64)>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<String> {
    let owner = owner_id(owner)?;
    let max_bytes = query.max_bytes.unwrap_or(DEFAULT_OUTPUT_BYTES);
    let bytes = state
        .supervisor
        .read_output(&owner, DeploymentId::new(id), max_bytes)
        .await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn terminate_deployment(
    State(state): State<AppState>,
    Path((owner, id)): Path<(String, u64)>,
) -> ApiResult<Json<Removal>> {
    let owner = owner_id(owner)?;
    let removal = state
        .supervisor
        .terminate(&owner, DeploymentId::new(id))
        .await
        .map_err(|e| {
            warn!(%owner, id, error = %e, "terminate failed");
            ApiError::from(e)
        })?;
    Ok(Json(removal))
}

async fn start_session(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<(StatusCode, Json<SessionStarted>)> {
    let owner = owner_id(owner)?;
    let replaced = state.sessions.start(&owner).await;
    Ok((
        StatusCode::CREATED,
        Json(SessionStarted {
            awaiting: "archive",
            replaced,
        }),
    ))
}

async fn session_info(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<crate::session::SessionInfo>> {
    let owner = owner_id(owner)?;
    state
        .sessions
        .info(&owner)
        .await
        .map(Json)
        .ok_or_else(|| SessionError::NoSession.into())
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<StatusCode> {
    let owner = owner_id(owner)?;
    if state.sessions.cancel(&owner).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SessionError::NoSession.into())
    }
}

async fn session_archive(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<ArchiveBody>,
) -> ApiResult<Json<Awaiting>> {
    let owner = owner_id(owner)?;
    let bytes = decode_archive(&body.archive)?;
    let input = Input::Archive {
        bytes,
        name: body.archive_name,
    };
    match state.sessions.submit(&owner, input).await? {
        Step::Awaiting(awaiting) => Ok(Json(Awaiting { awaiting })),
        Step::Ready(_) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "session completed on archive input",
        )),
    }
}

async fn session_entry_point(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<EntryPointBody>,
) -> ApiResult<Json<Awaiting>> {
    let owner = owner_id(owner)?;
    match state
        .sessions
        .submit(&owner, Input::EntryPoint(body.entry_point))
        .await?
    {
        Step::Awaiting(awaiting) => Ok(Json(Awaiting { awaiting })),
        Step::Ready(_) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "session completed on entry point input",
        )),
    }
}

/// Final turn: the secret (possibly absent) completes the session and the
/// collected request is deployed.
async fn session_secret(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(body): Json<SecretBody>,
) -> ApiResult<(StatusCode, Json<Deployed>)> {
    let owner = owner_id(owner)?;
    match state
        .sessions
        .submit(&owner, Input::Secret(body.secret))
        .await?
    {
        Step::Ready(request) => run_deploy(&state, request).await,
        Step::Awaiting(awaiting) => Err(api_error(
            StatusCode::CONFLICT,
            "unexpected_input",
            format!("session still awaiting {awaiting}"),
        )),
    }
}
