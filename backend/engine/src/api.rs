//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::campaign::{self, SqliteCampaignLedger};
use crate::checkout::{CheckoutRequest, CheckoutService, CheckoutSession};
use crate::config::Config;
use crate::errors::{EngineError, Result, ValidationCode, ValidationError};
use crate::gateway::PaymentGateway;
use crate::ledger::SqliteEventLedger;
use crate::models::{Campaign, Donation, MilestoneProof, WebhookEventRecord};
use crate::notify::EventBus;
use crate::reconcile::{self, ReconciliationReport};
use crate::refund::RefundService;
use crate::release::{MilestoneReleaseWorkflow, ReviewDecision, ReviewOutcome};
use crate::settings;
use crate::signature::SIGNATURE_HEADER;
use crate::store::{self, NewDonation, NewProof};
use crate::webhook::WebhookProcessor;

pub const ADMIN_ID_HEADER: &str = "x-admin-id";

pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub webhooks: WebhookProcessor,
    pub checkout: CheckoutService,
    pub releases: MilestoneReleaseWorkflow,
    pub refunds: RefundService,
}

impl AppState {
    /// Wire every service onto one pool, gateway and event bus.
    pub fn new(pool: SqlitePool, config: Config, gateway: Arc<dyn PaymentGateway>) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::with_defaults(pool.clone());
        let campaigns = Arc::new(SqliteCampaignLedger::new(pool.clone()));

        Self {
            webhooks: WebhookProcessor::new(
                pool.clone(),
                &config,
                Arc::new(SqliteEventLedger::new(pool.clone())),
                campaigns.clone(),
                gateway.clone(),
                bus.clone(),
            ),
            checkout: CheckoutService::new(pool.clone(), config.clone(), gateway),
            releases: MilestoneReleaseWorkflow::new(pool.clone(), bus.clone()),
            refunds: RefundService::new(pool.clone(), campaigns, bus),
            pool,
            config,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::MalformedPayload(_) | Self::BusinessRule(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSignature | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            error!(error = %self, "Request failed");
        }
        let details = match &self {
            Self::Validation(v) => v.details.clone(),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Admin gate
// ─────────────────────────────────────────────────────────

/// The verifier identity of an authenticated admin request.
pub struct AdminActor(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminActor {
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self> {
        let Some(expected) = state.config.admin_api_token.as_deref() else {
            return Err(EngineError::Forbidden("admin API is disabled".to_string()));
        };
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(EngineError::Unauthorized)?;
        if !tokens_match(token.trim(), expected) {
            return Err(EngineError::Unauthorized);
        }

        let admin_id = parts
            .headers
            .get(ADMIN_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ValidationError::new(ValidationCode::InvalidRequest, "X-Admin-Id header is required")
            })?;
        Ok(AdminActor(admin_id.to_string()))
    }
}

fn tokens_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Deserialize)]
pub struct CreateDonationRequest {
    pub donor_id: String,
    pub campaign_id: String,
    pub amount: i64,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

fn default_payment_method() -> String {
    "gcash".to_string()
}

#[derive(Deserialize)]
pub struct SubmitProofRequest {
    pub submitted_by: String,
    pub description: String,
    #[serde(default)]
    pub evidence_url: Option<String>,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct WebhookEventsQuery {
    #[serde(default)]
    pub unprocessed: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Serialize)]
pub struct WebhookEventsResponse {
    pub count: usize,
    pub events: Vec<WebhookEventRecord>,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    pub id: i64,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

// ─────────────────────────────────────────────────────────
// Public handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /webhooks/payments`
///
/// Acknowledges every verified, well-formed delivery; only signature and
/// payload failures, or a failed ledger write, produce an error status.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    state.webhooks.handle(&body, signature).await?;
    Ok(Json(json!({ "received": true })))
}

/// `POST /donations`
pub async fn create_donation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDonationRequest>,
) -> Result<(StatusCode, Json<Donation>)> {
    if req.amount <= 0 {
        return Err(ValidationError::new(ValidationCode::InvalidAmount, "amount must be positive").into());
    }
    if req.donor_id.trim().is_empty() {
        return Err(ValidationError::new(ValidationCode::InvalidRequest, "donor_id is required").into());
    }
    campaign::get_campaign(&state.pool, &req.campaign_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("campaign {}", req.campaign_id)))?;

    let donation = store::insert_donation(
        &state.pool,
        &NewDonation {
            donor_id: req.donor_id,
            campaign_id: req.campaign_id,
            amount: req.amount,
            payment_method: req.payment_method,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(donation)))
}

/// `GET /donations/:id`
pub async fn get_donation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Donation>> {
    let donation = store::get_donation(&state.pool, &id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("donation {id}")))?;
    Ok(Json(donation))
}

/// `POST /donations/:id/checkout`
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSession>> {
    Ok(Json(state.checkout.create_session(&id, &req).await?))
}

/// `GET /campaigns/:id`
pub async fn get_campaign(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Campaign>> {
    let campaign = campaign::get_campaign(&state.pool, &id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("campaign {id}")))?;
    Ok(Json(campaign))
}

/// `POST /milestones/:id/proofs`
pub async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<String>,
    Json(req): Json<SubmitProofRequest>,
) -> Result<(StatusCode, Json<MilestoneProof>)> {
    if req.description.trim().is_empty() {
        return Err(ValidationError::new(ValidationCode::InvalidRequest, "description is required").into());
    }
    let proof = state
        .releases
        .submit_proof(&NewProof {
            milestone_id,
            submitted_by: req.submitted_by,
            description: req.description,
            evidence_url: req.evidence_url,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(proof)))
}

// ─────────────────────────────────────────────────────────
// Admin handlers
// ─────────────────────────────────────────────────────────

/// `GET /admin/webhook-events?unprocessed=true`
pub async fn list_webhook_events(
    State(state): State<Arc<AppState>>,
    _admin: AdminActor,
    Query(query): Query<WebhookEventsQuery>,
) -> Result<Json<WebhookEventsResponse>> {
    let events = state
        .webhooks
        .ledger()
        .list(query.unprocessed, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(WebhookEventsResponse {
        count: events.len(),
        events,
    }))
}

/// `POST /admin/webhook-events/:id/replay`
pub async fn replay_webhook_event(
    State(state): State<Arc<AppState>>,
    AdminActor(admin_id): AdminActor,
    Path(id): Path<i64>,
) -> Result<Json<ReplayResponse>> {
    info!(ledger_id = id, admin_id = %admin_id, "Webhook replay requested");
    let note = state.webhooks.replay(id).await?;
    Ok(Json(ReplayResponse { id, note }))
}

/// `POST /admin/proofs/:id/review`
pub async fn review_proof(
    State(state): State<Arc<AppState>>,
    AdminActor(admin_id): AdminActor,
    Path(proof_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<ReviewOutcome>> {
    let outcome = state
        .releases
        .review(&proof_id, req.decision, &admin_id, req.notes.as_deref())
        .await?;
    Ok(Json(outcome))
}

/// `POST /admin/donations/:id/refund`
pub async fn refund_donation(
    State(state): State<Arc<AppState>>,
    AdminActor(admin_id): AdminActor,
    Path(id): Path<String>,
) -> Result<Json<Donation>> {
    Ok(Json(state.refunds.refund(&id, &admin_id).await?))
}

/// `GET /admin/reconciliation`
pub async fn reconciliation_report(
    State(state): State<Arc<AppState>>,
    _admin: AdminActor,
) -> Result<Json<ReconciliationReport>> {
    Ok(Json(reconcile::report(&state.pool).await?))
}

/// `POST /admin/reconciliation/repair`
pub async fn reconciliation_repair(
    State(state): State<Arc<AppState>>,
    AdminActor(admin_id): AdminActor,
) -> Result<Json<ReconciliationReport>> {
    info!(admin_id = %admin_id, "Reconciliation repair requested");
    Ok(Json(reconcile::repair(&state.pool).await?))
}

/// `PUT /admin/settings/:key`
pub async fn update_setting(
    State(state): State<Arc<AppState>>,
    AdminActor(admin_id): AdminActor,
    Path(key): Path<String>,
    Json(req): Json<SettingRequest>,
) -> Result<Json<Value>> {
    settings::set(&state.pool, &key, &req.value, &admin_id).await?;
    let effective = settings::effective(&state.pool, &state.config).await?;
    Ok(Json(json!({
        "platform_fee_bps": effective.platform_fee_bps,
        "minimum_donation": effective.minimum_donation,
    })))
}
