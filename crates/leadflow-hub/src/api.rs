//! REST API server: expose LeadFlow as an HTTP service.
//!
//! Endpoints:
//! - GET  /v1/health: Health check
//! - GET  /v1/metrics: Request and lead counters
//! - POST /v1/leads: Capture, score and assign a lead
//! - GET  /v1/leads/{id}: Lead with assignment and follow-ups
//! - PATCH /v1/leads/{id}: Status, activity and interest update
//! - POST /v1/leads/{id}/reassign: Manual or automatic reassignment
//! - POST /v1/scoring/preview: Explain the score a capture would get
//! - GET|POST /v1/agents: List or register agents
//! - GET  /v1/agents/{id}/workload: Active leads against capacity
//! - POST /v1/agents/{id}/performance: Record a performance snapshot
//! - GET|POST /v1/scoring/rules: List or create custom scoring rules

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use leadflow_core::agent::{Agent, AgentFilter, AgentId, AssignedAgent, PerformanceMetric};
use leadflow_core::config::LeadFlowConfig;
use leadflow_core::lead::LeadId;
use leadflow_core::repository::LeadRepository;
use leadflow_core::scoring::{RuleCriterion, ScoreBreakdown, ScoringRule};
use leadflow_core::service::{
    CaptureRequest, CaptureResponse, LeadDetails, LeadService, UpdateRequest, UpdateResponse,
};
use leadflow_core::workload::AgentWorkload;
use leadflow_core::LeadFlowError;

use crate::metrics::{self, SharedMetrics};
use crate::middleware::{auth_middleware, logging_middleware};
use crate::store::SqliteRepository;

/// Shared API state.
pub struct ApiState {
    pub service: LeadService,
    pub metrics: SharedMetrics,
}

type SharedState = Arc<ApiState>;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

// ─── Request/Response types ────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct ReassignRequest {
    pub reason: String,
    /// Manual target; omitted = pick through the normal selection.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Serialize)]
pub struct ReassignResponse {
    pub lead_id: LeadId,
    pub assigned_agent: AssignedAgent,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct NewAgentRequest {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub specialization: Vec<String>,
    #[serde(default)]
    pub preferred_areas: Vec<String>,
}

#[derive(Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Deserialize)]
pub struct PerformanceRequest {
    /// Defaults to today (UTC).
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub total_active_leads: u32,
    #[serde(default)]
    pub conversions: u32,
    #[serde(default)]
    pub conversion_rate: Option<f64>,
}

#[derive(Deserialize)]
pub struct RuleQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Deserialize)]
pub struct NewRuleRequest {
    pub rule_name: String,
    pub criterion: RuleCriterion,
    pub score_delta: i32,
}

// ─── Errors ────────────────────────────────────────────────

fn error_status(err: &LeadFlowError) -> StatusCode {
    match err {
        LeadFlowError::Validation(_) | LeadFlowError::DuplicateLead(_) => StatusCode::BAD_REQUEST,
        LeadFlowError::NotFound { .. } => StatusCode::NOT_FOUND,
        LeadFlowError::NoEligibleAgent
        | LeadFlowError::CapacityExceeded { .. }
        | LeadFlowError::AlreadyAssigned(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: LeadFlowError) -> ApiError {
    let status = error_status(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// ─── Handlers ──────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn metrics_snapshot(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json())
}

async fn capture_lead(
    State(state): State<SharedState>,
    Json(req): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureResponse>), ApiError> {
    let response = state.service.capture(req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_lead(
    State(state): State<SharedState>,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<LeadDetails> {
    state
        .service
        .lead_details(lead_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn update_lead(
    State(state): State<SharedState>,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<UpdateResponse> {
    state
        .service
        .update(lead_id, req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reassign_lead(
    State(state): State<SharedState>,
    Path(lead_id): Path<Uuid>,
    Json(req): Json<ReassignRequest>,
) -> ApiResult<ReassignResponse> {
    if req.reason.trim().is_empty() {
        return Err(api_error(LeadFlowError::Validation(
            "reason is required".to_string(),
        )));
    }

    let assigned_agent = state
        .service
        .reassign(lead_id, &req.reason, req.agent_id)
        .await
        .map_err(api_error)?;

    Ok(Json(ReassignResponse {
        lead_id,
        assigned_agent,
        reason: req.reason,
    }))
}

async fn preview_score(
    State(state): State<SharedState>,
    Json(req): Json<CaptureRequest>,
) -> ApiResult<ScoreBreakdown> {
    state
        .service
        .preview_score(&req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn list_agents(
    State(state): State<SharedState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Vec<Agent>> {
    let filter = AgentFilter {
        active_only: query.active_only,
        language: query.language,
    };
    state
        .service
        .repository()
        .list_agents(&filter)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn create_agent(
    State(state): State<SharedState>,
    Json(req): Json<NewAgentRequest>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    if req.full_name.trim().is_empty() || req.phone.trim().is_empty() {
        return Err(api_error(LeadFlowError::Validation(
            "full_name and phone are required".to_string(),
        )));
    }

    let mut agent = Agent::new(&req.full_name, &req.email, &req.phone);
    agent.language = req.language;
    agent.specialization = req.specialization;
    agent.preferred_areas = req.preferred_areas;

    state
        .service
        .repository()
        .upsert_agent(&agent)
        .await
        .map_err(api_error)?;
    info!("Registered agent {} ({})", agent.full_name, agent.agent_id);

    Ok((StatusCode::CREATED, Json(agent)))
}

async fn agent_workload(
    State(state): State<SharedState>,
    Path(agent_id): Path<Uuid>,
) -> ApiResult<AgentWorkload> {
    state
        .service
        .manager()
        .tracker()
        .workload(agent_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn record_performance(
    State(state): State<SharedState>,
    Path(agent_id): Path<Uuid>,
    Json(req): Json<PerformanceRequest>,
) -> ApiResult<PerformanceMetric> {
    let repo = state.service.repository();
    if repo.get_agent(agent_id).await.map_err(api_error)?.is_none() {
        return Err(api_error(LeadFlowError::agent_not_found(agent_id)));
    }
    if req.conversion_rate.is_some_and(|r| !r.is_finite() || r < 0.0) {
        return Err(api_error(LeadFlowError::Validation(
            "conversion_rate must be a non-negative number".to_string(),
        )));
    }

    let metric = PerformanceMetric {
        agent_id,
        date: req.date.unwrap_or_else(|| Utc::now().date_naive()),
        total_active_leads: req.total_active_leads,
        conversions: req.conversions,
        conversion_rate: req.conversion_rate,
    };
    repo.record_performance(&metric).await.map_err(api_error)?;
    Ok(Json(metric))
}

async fn list_rules(
    State(state): State<SharedState>,
    Query(query): Query<RuleQuery>,
) -> ApiResult<Vec<ScoringRule>> {
    state
        .service
        .repository()
        .list_scoring_rules(query.active_only)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn create_rule(
    State(state): State<SharedState>,
    Json(req): Json<NewRuleRequest>,
) -> Result<(StatusCode, Json<ScoringRule>), ApiError> {
    let rule = ScoringRule::new(&req.rule_name, req.criterion, req.score_delta);
    rule.validate().map_err(api_error)?;
    state
        .service
        .repository()
        .create_scoring_rule(&rule)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

// ─── Router ────────────────────────────────────────────────

/// Build the router. Everything except the health check sits behind the API key.
pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/v1/metrics", get(metrics_snapshot))
        .route("/v1/leads", post(capture_lead))
        .route("/v1/leads/{id}", get(get_lead).patch(update_lead))
        .route("/v1/leads/{id}/reassign", post(reassign_lead))
        .route("/v1/scoring/preview", post(preview_score))
        .route("/v1/scoring/rules", get(list_rules).post(create_rule))
        .route("/v1/agents", get(list_agents).post(create_agent))
        .route("/v1/agents/{id}/workload", get(agent_workload))
        .route("/v1/agents/{id}/performance", post(record_performance))
        .route_layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/v1/health", get(health))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            logging_middleware,
        ))
        .with_state(state)
}

/// Start the API server backed by the configured SQLite database.
pub async fn start_server(config: &LeadFlowConfig) -> anyhow::Result<()> {
    let db_path = config.database_path();
    let repo = Arc::new(SqliteRepository::open(&db_path)?);
    info!("📦 Database: {}", db_path.display());

    let service = LeadService::from_config(repo, config);
    let metrics = metrics::new_metrics();
    metrics::spawn_event_listener(metrics.clone(), service.events());

    let app = build_router(Arc::new(ApiState { service, metrics }));

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("🌐 API server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
