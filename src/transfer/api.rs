//! HTTP surface
//!
//! JSON envelope `{code, msg, data}`; `code` is 0 on success. Amounts cross
//! the wire as major-unit strings ("500.25") and are converted with
//! [`crate::money`] at the edge. The owner id is read from `x-owner-id`,
//! set by the authenticating gateway in front of this service.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use validator::Validate;

use super::admin::AdminService;
use super::orchestrator::TransferOrchestrator;
use super::reconcile::ReconciliationWorker;
use super::state::TransactionStatus;
use super::types::{
    Counterparty, Transaction, TransferContext, TransferRequest, TransferResponse,
};
use crate::audit::Actor;
use crate::core_types::{Currency, OwnerId, TransactionClass, TransactionId, WalletId};
use crate::db::Database;
use crate::error::EngineError;
use crate::limits::{TransactionLimit, VerificationTier};
use crate::money::{MoneyError, format_minor, parse_major};
use crate::wallet::Wallet;

pub const OWNER_HEADER: &str = "x-owner-id";

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const COUNTERPARTY_INVALID: i32 = 1002;
    pub const LIMIT_EXCEEDED: i32 = 2001;
    pub const RISK_DENIED: i32 = 2002;
    pub const INSUFFICIENT_FUNDS: i32 = 2003;
    pub const WALLET_FROZEN: i32 = 2004;
    pub const UNAUTHORIZED: i32 = 4010;
    pub const WALLET_NOT_FOUND: i32 = 4041;
    pub const TRANSACTION_NOT_FOUND: i32 = 4042;
    pub const INVALID_TRANSITION: i32 = 4091;
    pub const CONFLICT: i32 = 4092;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const PROVIDER_UNAVAILABLE: i32 = 5031;
    pub const PROVIDER_REJECTED: i32 = 5032;
    pub const INDETERMINATE_STATE: i32 = 5033;
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: i32,
    msg: String,
    data: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
            data: None,
        }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match &e {
            EngineError::Validation(_) | EngineError::Config(_) => error_codes::INVALID_PARAMETER,
            EngineError::CounterpartyInvalid(_) => error_codes::COUNTERPARTY_INVALID,
            EngineError::LimitExceeded { .. } => error_codes::LIMIT_EXCEEDED,
            EngineError::RiskDenied { .. } => error_codes::RISK_DENIED,
            EngineError::InsufficientFunds { .. } => error_codes::INSUFFICIENT_FUNDS,
            EngineError::WalletFrozen => error_codes::WALLET_FROZEN,
            EngineError::WalletNotFound(_) => error_codes::WALLET_NOT_FOUND,
            EngineError::TransactionNotFound(_) => error_codes::TRANSACTION_NOT_FOUND,
            EngineError::InvalidTransition { .. } => error_codes::INVALID_TRANSITION,
            EngineError::Conflict(_) => error_codes::CONFLICT,
            EngineError::ProviderUnavailable(_) => error_codes::PROVIDER_UNAVAILABLE,
            EngineError::ProviderRejected(_) => error_codes::PROVIDER_REJECTED,
            EngineError::IndeterminateState { .. } => error_codes::INDETERMINATE_STATE,
            EngineError::Storage(_) => error_codes::INTERNAL_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "Request failed");
        }
        let mut err = ApiError::new(status, code, e.to_string());
        if let EngineError::LimitExceeded { available } = e {
            err.data = Some(json!({ "available": available }));
        }
        err
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            code: self.code,
            msg: self.msg,
            data: self.data,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

// ============================================================================
// State & router
// ============================================================================

pub struct AppState {
    pub orchestrator: Arc<TransferOrchestrator>,
    pub worker: Arc<ReconciliationWorker>,
    pub admin: Arc<AdminService>,
    /// None when running on in-memory stores
    pub database: Option<Database>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let transfer_routes = Router::new()
        .route("/transfers", post(create_transfer))
        .route("/transfers/{id}", get(get_transfer));

    let admin_routes = Router::new()
        .route("/transactions/indeterminate", get(list_indeterminate))
        .route("/transactions/{id}/reconcile", post(reconcile))
        .route("/transactions/{id}/force-complete", post(force_complete))
        .route("/transactions/{id}/force-fail", post(force_fail))
        .route("/wallets", post(open_wallet))
        .route("/wallets/{id}", get(get_wallet))
        .route("/wallets/{id}/adjust", post(adjust_balance))
        .route("/wallets/{id}/freeze", post(freeze_wallet))
        .route("/limits/{owner_id}", put(set_limit));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", transfer_routes)
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct TransferApiRequest {
    pub class: TransactionClass,
    /// Major units, e.g. "500.25"
    #[validate(length(min = 1, max = 32))]
    pub amount: String,
    #[validate(length(equal = 3))]
    pub currency: String,
    pub counterparty: Counterparty,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub description: String,
    #[serde(default)]
    pub context: TransferContext,
    #[validate(length(min = 1, max = 64))]
    pub client_reference: Option<String>,
}

/// What an owner sees of one of their transactions
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionView {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub class: TransactionClass,
    pub amount: String,
    pub currency: Currency,
    pub counterparty: Counterparty,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            status: tx.status,
            class: tx.class,
            amount: format_minor(tx.amount, tx.currency.decimals()),
            currency: tx.currency.clone(),
            counterparty: tx.counterparty.clone(),
            description: tx.description.clone(),
            provider_ref: tx.provider_ref.as_ref().map(|r| r.reference.clone()),
            reason_code: tx.reason_code.clone(),
            refunded: tx.compensated,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletView {
    pub wallet_id: WalletId,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub balance: String,
    pub frozen: bool,
    pub version: u64,
}

impl From<&Wallet> for WalletView {
    fn from(w: &Wallet) -> Self {
        Self {
            wallet_id: w.id,
            owner_id: w.owner_id,
            currency: w.currency.clone(),
            balance: format_minor(w.balance, w.currency.decimals()),
            frozen: w.frozen,
            version: w.version,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct OverrideRequest {
    #[validate(length(min = 1, max = 64))]
    pub actor: String,
    #[validate(length(min = 1, max = 1000))]
    pub note: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OpenWalletRequest {
    #[validate(range(min = 1))]
    pub owner_id: OwnerId,
    #[validate(length(equal = 3))]
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustBalanceRequest {
    /// Major units; "0" is allowed here
    #[validate(length(min = 1, max = 32))]
    pub new_balance: String,
    #[validate(length(min = 1, max = 64))]
    pub actor: String,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FreezeRequest {
    pub frozen: bool,
    #[validate(length(min = 1, max = 64))]
    pub actor: String,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetLimitRequest {
    pub tier: VerificationTier,
    /// Daily caps in minor units
    pub caps: HashMap<TransactionClass, u64>,
    #[validate(length(min = 1, max = 64))]
    pub actor: String,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndeterminateView {
    pub transaction_id: TransactionId,
    pub owner_id: OwnerId,
    pub amount: String,
    pub currency: Currency,
    pub pending_secs: i64,
    pub reason_code: String,
}

// ============================================================================
// Helpers
// ============================================================================

fn owner_from(headers: &HeaderMap) -> Result<OwnerId, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<OwnerId>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                error_codes::UNAUTHORIZED,
                format!("missing or invalid {} header", OWNER_HEADER),
            )
        })
}

fn parse_id(raw: &str) -> Result<TransactionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid transaction id: {}", raw)))
}

fn parse_currency(raw: &str) -> Result<Currency, ApiError> {
    Currency::new(raw).map_err(ApiError::bad_request)
}

/// Like `parse_major`, but zero is a legal balance
fn parse_balance(raw: &str, decimals: u32) -> Result<u64, ApiError> {
    let trimmed = raw.trim();
    match parse_major(trimmed, decimals) {
        Ok(amount) => Ok(amount),
        Err(MoneyError::InvalidAmount) if !trimmed.starts_with(['-', '+']) => Ok(0),
        Err(e) => Err(ApiError::bad_request(e.to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = match &state.database {
        None => "disabled",
        Some(db) => match db.health_check().await {
            Ok(()) => "up",
            Err(_) => "down",
        },
    };
    let status = if database == "down" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = ApiResponse::success(json!({
        "status": if database == "down" { "degraded" } else { "ok" },
        "database": database,
        "version": env!("CARGO_PKG_VERSION"),
    }));
    (status, Json(body)).into_response()
}

async fn create_transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TransferApiRequest>,
) -> ApiResult<TransferResponse> {
    let owner_id = owner_from(&headers)?;
    req.validate()?;
    let currency = parse_currency(&req.currency)?;
    let amount = parse_major(&req.amount, currency.decimals())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let id = TransactionId::new();
    let request = TransferRequest {
        owner_id,
        class: req.class,
        amount,
        currency,
        counterparty: req.counterparty,
        description: req.description,
        context: req.context,
        client_reference: req.client_reference,
    };
    info!(transaction_id = %id, owner_id, class = %request.class, amount, "Transfer requested");

    match state.orchestrator.submit_with_id(id, request).await {
        Ok(tx) => ok(TransferResponse::from_transaction(&tx)),
        Err(e) => {
            let receipt = serde_json::to_value(TransferResponse::rejected(id, e.code()))
                .unwrap_or_default();
            let mut err = ApiError::from(e);
            let data = match err.data.take() {
                Some(serde_json::Value::Object(extra)) => {
                    let mut merged = receipt;
                    if let Some(obj) = merged.as_object_mut() {
                        obj.extend(extra);
                    }
                    merged
                }
                _ => receipt,
            };
            Err(err.with_data(data))
        }
    }
}

async fn get_transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<TransactionView> {
    let owner_id = owner_from(&headers)?;
    let id = parse_id(&id)?;
    let tx = state.orchestrator.transaction(id).await?;
    // Other owners' transactions do not exist as far as the caller knows
    if tx.owner_id != owner_id {
        return Err(EngineError::TransactionNotFound(id.to_string()).into());
    }
    ok(TransactionView::from(&tx))
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let id = parse_id(&id)?;
    let status = state.worker.reconcile(id).await?;
    ok(json!({ "transaction_id": id, "status": status }))
}

async fn force_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<TransactionView> {
    let id = parse_id(&id)?;
    req.validate()?;
    let tx = state
        .worker
        .force_complete(id, Actor::Admin(req.actor), &req.note)
        .await?;
    ok(TransactionView::from(&tx))
}

async fn force_fail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<TransactionView> {
    let id = parse_id(&id)?;
    req.validate()?;
    let tx = state
        .worker
        .force_fail(id, Actor::Admin(req.actor), &req.note)
        .await?;
    ok(TransactionView::from(&tx))
}

async fn list_indeterminate(State(state): State<Arc<AppState>>) -> ApiResult<Vec<IndeterminateView>> {
    let items = state.worker.indeterminate().await?;
    ok(items
        .iter()
        .map(|item| IndeterminateView {
            transaction_id: item.transaction.id,
            owner_id: item.transaction.owner_id,
            amount: format_minor(item.transaction.amount, item.transaction.currency.decimals()),
            currency: item.transaction.currency.clone(),
            pending_secs: item.pending_secs,
            reason_code: item.to_error().code().to_string(),
        })
        .collect())
}

async fn open_wallet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenWalletRequest>,
) -> ApiResult<WalletView> {
    req.validate()?;
    let currency = parse_currency(&req.currency)?;
    let wallet = state.admin.open_wallet(req.owner_id, &currency).await?;
    ok(WalletView::from(&wallet))
}

async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WalletId>,
) -> ApiResult<WalletView> {
    let wallet = state.admin.wallet(id).await?;
    ok(WalletView::from(&wallet))
}

async fn adjust_balance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WalletId>,
    Json(req): Json<AdjustBalanceRequest>,
) -> ApiResult<WalletView> {
    req.validate()?;
    let wallet = state.admin.wallet(id).await?;
    let new_balance = parse_balance(&req.new_balance, wallet.currency.decimals())?;
    let wallet = state
        .admin
        .adjust_balance(id, new_balance, Actor::Admin(req.actor), &req.reason)
        .await?;
    ok(WalletView::from(&wallet))
}

async fn freeze_wallet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WalletId>,
    Json(req): Json<FreezeRequest>,
) -> ApiResult<WalletView> {
    req.validate()?;
    let wallet = state
        .admin
        .set_frozen(id, req.frozen, Actor::Admin(req.actor), &req.reason)
        .await?;
    ok(WalletView::from(&wallet))
}

async fn set_limit(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<OwnerId>,
    Json(req): Json<SetLimitRequest>,
) -> ApiResult<TransactionLimit> {
    req.validate()?;
    let limit = TransactionLimit {
        owner_id,
        tier: req.tier,
        caps: req.caps,
    };
    state
        .admin
        .set_limit(limit.clone(), Actor::Admin(req.actor), &req.reason)
        .await?;
    ok(limit)
}

// ============================================================================
// Tests
// ============================================================================
