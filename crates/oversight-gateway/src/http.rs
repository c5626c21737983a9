//! HTTP/WebSocket transport: a thin marshalling layer over [`crate::engine::Engine`].
//!
//! Router shape, the `X-API-Key` middleware, and the server wiring follow
//! `agentkern-gate`'s `bin/server.rs` (`Router::new()` + `TraceLayer` +
//! `axum::middleware::from_fn` + `Arc<AppState>`). Route paths, bodies, and
//! status codes restate `original_source/oversight_gateway/main.py` /
//! `auth.py` (`/health`, `/evaluate`, `/approve`, `/near-miss`, `/budget/{id}`,
//! `/stats`); `/config/webhooks`, `/config/reload`, `/audit/export`, and
//! `/ws/dashboard` have no original counterpart and are built directly from
//! the route table this repo's specification adds. This layer holds no
//! business logic: it only converts bodies to/from engine types and engine
//! errors to status codes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gateway_common::{health_check, GatewayError, HealthResponse};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::engine::Engine;
use crate::model::{Metadata, NearMissType, NewNearMiss};

pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_keys: Vec<String>,
    pub policy_path: std::path::PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/evaluate", post(evaluate))
        .route("/approve", post(approve))
        .route("/near-miss", post(near_miss))
        .route("/budget/:session_id", get(budget))
        .route("/stats", get(stats))
        .route("/config/webhooks", post(create_webhook).get(list_webhooks))
        .route("/config/webhooks/:id", delete(delete_webhook))
        .route("/config/reload", post(reload_policy))
        .route("/audit/export", get(audit_export))
        .route("/ws/dashboard", get(ws_dashboard))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────

const API_KEY_HEADER: &str = "X-API-Key";

async fn auth(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match key {
        Some(key) if state.api_keys.iter().any(|k| k.as_str() == key) => Ok(next.run(req).await),
        _ => Err(ApiError(GatewayError::Unauthorized)),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────

/// Wraps [`GatewayError`] so it can implement axum's `IntoResponse`, per
/// spec §7's status-code taxonomy.
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AlreadyDecided(_) => StatusCode::CONFLICT,
            GatewayError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PolicyLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { detail: self.0.to_string() })).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────
// /health
// ─────────────────────────────────────────────────────────────────────────

async fn health() -> Json<HealthResponse> {
    Json(health_check())
}

// ─────────────────────────────────────────────────────────────────────────
// /evaluate
// ─────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EvaluateRequest {
    session_id: String,
    action: String,
    target: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Serialize)]
struct EvaluateResponse {
    action_id: i64,
    session_id: String,
    risk_score: f64,
    impact: f64,
    breadth: f64,
    probability: f64,
    needs_checkpoint: bool,
    checkpoint_reason: String,
    remaining_budget: f64,
    is_compound: bool,
    compound_count: u32,
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let outcome = state
        .engine
        .evaluate(&request.session_id, &request.action, request.target.as_deref(), request.metadata)
        .await?;

    Ok(Json(EvaluateResponse {
        action_id: outcome.action.id,
        session_id: outcome.action.session_id,
        risk_score: outcome.action.risk_score,
        impact: outcome.action.impact,
        breadth: outcome.action.breadth,
        probability: outcome.action.probability,
        needs_checkpoint: outcome.action.needs_checkpoint,
        checkpoint_reason: outcome.action.checkpoint_reason,
        remaining_budget: outcome.remaining_budget,
        is_compound: outcome.action.is_compound,
        compound_count: outcome.action.compound_count,
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /approve
// ─────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApprovalRequest {
    action_id: i64,
    approved: bool,
    notes: Option<String>,
    channel: Option<String>,
}

#[derive(Serialize)]
struct ApprovalResponse {
    action_id: i64,
    approved: bool,
    message: String,
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let action = state
        .engine
        .approve(request.action_id, request.approved, request.channel, request.notes)
        .await?;

    let verb = if request.approved { "approved" } else { "rejected" };
    Ok(Json(ApprovalResponse {
        action_id: action.id,
        approved: request.approved,
        message: format!("Action {} {}", action.id, verb),
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /near-miss
// ─────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NearMissRequest {
    session_id: String,
    action: String,
    near_miss_type: String,
    actual_severity: f64,
    target: Option<String>,
    description: Option<String>,
    #[serde(default)]
    metadata: Metadata,
    original_risk: Option<f64>,
}

#[derive(Serialize)]
struct NearMissResponse {
    message: String,
    near_miss_id: i64,
}

async fn near_miss(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NearMissRequest>,
) -> Result<Json<NearMissResponse>, ApiError> {
    if !(0.0..=1.0).contains(&request.actual_severity) {
        return Err(ApiError(GatewayError::ValidationFailed {
            field: "actual_severity".to_string(),
            message: "must be within [0, 1]".to_string(),
        }));
    }

    let near_miss_type = NearMissType::parse(&request.near_miss_type).ok_or_else(|| {
        ApiError(GatewayError::ValidationFailed {
            field: "near_miss_type".to_string(),
            message: format!("unknown near-miss type: {}", request.near_miss_type),
        })
    })?;

    let recorded = state
        .engine
        .record_near_miss(NewNearMiss {
            session_id: request.session_id,
            action: request.action,
            target: request.target,
            near_miss_type,
            description: request.description,
            metadata: request.metadata,
            original_risk: request.original_risk,
            actual_severity: request.actual_severity,
        })
        .await?;

    Ok(Json(NearMissResponse {
        message: "Near-miss recorded successfully".to_string(),
        near_miss_id: recorded.id,
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /budget/:session_id
// ─────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BudgetResponse {
    session_id: String,
    risk_budget: f64,
    cumulative_risk: f64,
    remaining_budget: f64,
    utilization_percent: f64,
}

async fn budget(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<BudgetResponse>, ApiError> {
    let session = state.engine.budget(&session_id).await?;
    Ok(Json(BudgetResponse {
        session_id: session.session_id,
        risk_budget: session.risk_budget,
        cumulative_risk: session.cumulative_risk,
        remaining_budget: session.remaining_budget(),
        utilization_percent: session.utilization_percent(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /stats
// ─────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatsResponse {
    total_actions: u64,
    checkpoints_triggered: u64,
    checkpoints_approved: u64,
    checkpoints_rejected: u64,
    approval_rate: f64,
    total_near_misses: u64,
    near_miss_breakdown: BTreeMap<String, u64>,
    average_risk_score: f64,
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.engine.stats().await?;
    Ok(Json(StatsResponse {
        total_actions: stats.action_counts.total,
        checkpoints_triggered: stats.action_counts.needs_checkpoint,
        checkpoints_approved: stats.action_counts.approved,
        checkpoints_rejected: stats.action_counts.rejected,
        approval_rate: stats.action_counts.approval_rate(),
        total_near_misses: stats.total_near_misses,
        near_miss_breakdown: stats.near_miss_breakdown,
        average_risk_score: stats.action_counts.average_risk_score,
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /config/webhooks
// ─────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateWebhookRequest {
    url: String,
    events: Vec<String>,
    secret: Option<String>,
}

#[derive(Serialize)]
struct CreateWebhookResponse {
    webhook_id: i64,
    url: String,
    events: Vec<String>,
    message: String,
}

async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<Json<CreateWebhookResponse>, ApiError> {
    let webhook = state
        .engine
        .register_webhook(request.url, request.events, request.secret)
        .await?;

    Ok(Json(CreateWebhookResponse {
        webhook_id: webhook.id,
        url: webhook.url,
        events: webhook.events,
        message: "Webhook registered".to_string(),
    }))
}

async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::model::Webhook>>, ApiError> {
    Ok(Json(state.engine.list_webhooks().await?))
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    let removed = state.engine.delete_webhook(id).await?;
    if !removed {
        return Err(ApiError(GatewayError::NotFound(format!("webhook {id}"))));
    }
    Ok(Json(MessageResponse {
        message: format!("Webhook {id} deleted"),
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /config/reload
// ─────────────────────────────────────────────────────────────────────────

async fn reload_policy(State(state): State<Arc<AppState>>) -> Result<Json<MessageResponse>, ApiError> {
    let source = std::fs::read_to_string(&state.policy_path)
        .map_err(|err| ApiError(GatewayError::PolicyLoad(format!("{}: {err}", state.policy_path.display()))))?;
    let policy = crate::policy::Policy::from_yaml(&source)
        .map_err(|err| ApiError(GatewayError::PolicyLoad(err.to_string())))?;

    state.engine.reload_policy(policy)?;
    Ok(Json(MessageResponse {
        message: "Policy reloaded".to_string(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /audit/export
// ─────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AuditQuery {
    from_date: DateTime<Utc>,
    to_date: DateTime<Utc>,
}

#[derive(Serialize)]
struct AuditResponse {
    total_entries: usize,
    entries: Vec<crate::model::Action>,
    from_date: DateTime<Utc>,
    to_date: DateTime<Utc>,
}

async fn audit_export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditResponse>, ApiError> {
    let entries = state.engine.audit_export(query.from_date, query.to_date).await?;
    Ok(Json(AuditResponse {
        total_entries: entries.len(),
        entries,
        from_date: query.from_date,
        to_date: query.to_date,
    }))
}

// ─────────────────────────────────────────────────────────────────────────
// /ws/dashboard
// ─────────────────────────────────────────────────────────────────────────

async fn ws_dashboard(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| dashboard_loop(socket, state))
}

async fn dashboard_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.engine.subscribe_events();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(message)) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "dashboard websocket receive error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let payload = serde_json::to_string(&event).unwrap_or_default();
                        if socket.send(WsMessage::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
