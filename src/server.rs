use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::Action;
use crate::admission::{AdmissionControl, SubmitRequest};
use crate::database::{
    Event, Mission, MissionStatus, OpsDatabase, Priority, Proposal, ProposalStatus, StepStatus,
};
use crate::healing::{Sweeper, SystemHealth};
use crate::heartbeat::{ControlLoop, TickReport};
use crate::policy::PolicyStore;
use crate::reactions::ReactionMatrix;
use crate::runtime::OpsRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<OpsDatabase>,
    pub admission: Arc<AdmissionControl>,
    pub control: Arc<ControlLoop>,
    pub sweeper: Arc<Sweeper>,
    pub policy: PolicyStore,
    pub auth: ApiAuthConfig,
}

#[derive(Debug, Clone)]
pub struct ApiAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct SubmitProposalRequest {
    agent: String,
    action: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitProposalResponse {
    success: bool,
    rejected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    auto_approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    proposal: Option<Proposal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mission: Option<Mission>,
}

#[derive(Debug, Deserialize)]
struct UpdateProposalStatusRequest {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusCounts {
    pending_proposals: u32,
    accepted_proposals: u32,
    running_missions: u32,
    succeeded_missions: u32,
    failed_missions: u32,
    queued_steps: u32,
    running_steps: u32,
    failed_steps: u32,
    events_last_day: u32,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    timestamp: DateTime<Utc>,
    health: SystemHealth,
    counts: StatusCounts,
    recent_missions: Vec<Mission>,
    recent_events: Vec<Event>,
    policies: Vec<(String, Value)>,
}

/// Serve the API. Background loops are spawned by the runtime before this
/// is called; this only owns the HTTP surface.
pub async fn serve(runtime: &OpsRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}'", runtime.config.bind_addr))?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState {
        db: runtime.db.clone(),
        admission: runtime.admission.clone(),
        control: runtime.control.clone(),
        sweeper: runtime.sweeper.clone(),
        policy: runtime.policy.clone(),
        auth,
    });

    let protected = Router::new()
        .route("/health", get(health))
        .route("/proposals", post(submit_proposal))
        .route("/proposals/:id/status", put(update_proposal_status))
        .route("/heartbeat", post(run_heartbeat))
        .route("/status", get(get_status))
        .route(
            "/reaction-matrix",
            get(get_reaction_matrix).put(update_reaction_matrix),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", bind_addr))?;
    tracing::info!("Opsforge API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("API server failed")?;
    Ok(())
}

fn load_auth_config() -> Result<ApiAuthConfig> {
    let mode = parse_auth_mode(std::env::var("OPSFORGE_AUTH_MODE").ok())?;
    let token = std::env::var("OPSFORGE_API_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "OPSFORGE_API_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("API auth mode is disabled; all routes are unauthenticated");
    }

    Ok(ApiAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid OPSFORGE_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &ApiAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn submit_proposal(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SubmitProposalRequest>,
) -> Result<(StatusCode, Json<SubmitProposalResponse>), (StatusCode, String)> {
    let Some(action) = Action::parse(&body.action) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Unknown action '{}'", body.action),
        ));
    };

    let request = SubmitRequest {
        source: body.source.unwrap_or_else(|| "api".to_string()),
        agent: body.agent,
        action,
        params: body.params.unwrap_or_else(|| serde_json::json!({})),
        priority: body
            .priority
            .as_deref()
            .map(Priority::from_db)
            .unwrap_or(Priority::Normal),
    };

    let outcome = state
        .admission
        .submit(request, Utc::now())
        .map_err(internal_error)?;

    let status = if outcome.rejected {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SubmitProposalResponse {
            success: !outcome.rejected,
            rejected: outcome.rejected,
            reason: outcome.reason,
            auto_approved: outcome.auto_approved,
            proposal: outcome.proposal,
            mission: outcome.mission,
        }),
    ))
}

async fn update_proposal_status(
    State(state): State<Arc<ServerState>>,
    Path(proposal_id): Path<String>,
    Json(body): Json<UpdateProposalStatusRequest>,
) -> Result<Json<Proposal>, (StatusCode, String)> {
    let status = match body.status.trim() {
        "accepted" => ProposalStatus::Accepted,
        "rejected" => ProposalStatus::Rejected,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Invalid status '{}'. Expected 'accepted' or 'rejected'", other),
            ))
        }
    };

    state
        .admission
        .update_proposal_status(&proposal_id, status, body.reason.as_deref(), Utc::now())
        .map(Json)
        .map_err(|e| (StatusCode::CONFLICT, format!("{:#}", e)))
}

async fn run_heartbeat(State(state): State<Arc<ServerState>>) -> Json<TickReport> {
    Json(state.control.run_tick(Utc::now()))
}

async fn get_status(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let health = state.sweeper.system_health(now).map_err(internal_error)?;

    let counts = StatusCounts {
        pending_proposals: state
            .db
            .count_proposals_by_status(ProposalStatus::Pending)
            .map_err(internal_error)?,
        accepted_proposals: state
            .db
            .count_proposals_by_status(ProposalStatus::Accepted)
            .map_err(internal_error)?,
        running_missions: state
            .db
            .count_missions_by_status(MissionStatus::Running)
            .map_err(internal_error)?,
        succeeded_missions: state
            .db
            .count_missions_by_status(MissionStatus::Succeeded)
            .map_err(internal_error)?,
        failed_missions: state
            .db
            .count_missions_by_status(MissionStatus::Failed)
            .map_err(internal_error)?,
        queued_steps: state
            .db
            .count_steps_by_status(StepStatus::Queued)
            .map_err(internal_error)?,
        running_steps: state
            .db
            .count_steps_by_status(StepStatus::Running)
            .map_err(internal_error)?,
        failed_steps: state
            .db
            .count_steps_by_status(StepStatus::Failed)
            .map_err(internal_error)?,
        events_last_day: state
            .db
            .count_events_since(now - Duration::hours(24))
            .map_err(internal_error)?,
    };

    Ok(Json(StatusResponse {
        timestamp: now,
        health,
        counts,
        recent_missions: state.db.recent_missions(10).map_err(internal_error)?,
        recent_events: state.db.recent_events(20).map_err(internal_error)?,
        policies: state.db.list_policies().map_err(internal_error)?,
    }))
}

async fn get_reaction_matrix(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ReactionMatrix>, (StatusCode, String)> {
    state
        .policy
        .reaction_matrix()
        .map(Json)
        .map_err(internal_error)
}

async fn update_reaction_matrix(
    State(state): State<Arc<ServerState>>,
    Json(matrix): Json<ReactionMatrix>,
) -> Result<Json<ReactionMatrix>, (StatusCode, String)> {
    state
        .policy
        .set_reaction_matrix(&matrix, Utc::now())
        .map_err(internal_error)?;
    Ok(Json(matrix))
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
