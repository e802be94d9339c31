//! HTTP API for queries, user operations, health and metrics

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::info;

use yield_bridge::{
    format_units, Address, Amount, BridgeError, ErrorCategory, MessageId, PendingWithdrawal,
    PoolStats, UserAccount, WithdrawalStatus,
};

use crate::metrics;
use crate::relay::Gateways;

#[derive(Clone)]
pub struct AppState {
    pub gateways: Gateways,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(gateways: Gateways) -> Self {
        Self {
            gateways,
            started_at: Utc::now(),
        }
    }
}

/// Ledger error mapped onto an HTTP status
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::WithdrawalNotFound { .. } | BridgeError::DepositNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            BridgeError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            e => match e.category() {
                ErrorCategory::Validation => StatusCode::BAD_REQUEST,
                ErrorCategory::Funds => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCategory::Delivery | ErrorCategory::Fatal => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCategory::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error("api", &self.0);
        let status = self.status();
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub halt_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub sender_nonce: u64,
    pub in_flight_withdrawals: usize,
    pub stuck_withdrawals: usize,
    pub processed_messages: usize,
    pub pending_replies: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub user: Address,
    /// Origin view, updated on confirmations and yield syncs
    pub origin: UserAccount,
    /// Destination view, accrued to now
    pub destination: UserAccount,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AmountResponse {
    pub user: Address,
    pub amount: Amount,
    pub formatted: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressResponse {
    pub address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AmountRequest {
    pub user: String,
    pub amount: Amount,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawalStatusResponse {
    pub id: MessageId,
    pub status: WithdrawalStatus,
    pub attempts: u32,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let sender = state.gateways.sender.lock().await;
    let sender_nonce = sender.nonce();
    let in_flight_withdrawals = sender.in_flight_withdrawals();
    let stuck_withdrawals = sender.stuck_withdrawals().len();
    drop(sender);

    let receiver = state.gateways.receiver.lock().await;
    Json(HealthResponse {
        status: (if receiver.is_halted() { "halted" } else { "healthy" }).to_string(),
        halt_reason: receiver.halt_reason().map(str::to_string),
        started_at: state.started_at,
        sender_nonce,
        in_flight_withdrawals,
        stuck_withdrawals,
        processed_messages: receiver.processed_count(),
        pending_replies: receiver.pending_replies(),
    })
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    state.gateways.export_gauges().await;

    let (content_type, buffer) = match metrics::encode() {
        Ok(encoded) => encoded,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn get_user(State(state): State<AppState>, Path(user): Path<String>) -> ApiResult<UserResponse> {
    let user = Address::new(user)?;
    let origin = state.gateways.sender.lock().await.user_account(&user);
    let destination = state
        .gateways
        .receiver
        .lock()
        .await
        .user_account(&user, crate::now_unix());
    Ok(Json(UserResponse {
        user,
        origin,
        destination,
    }))
}

async fn get_user_balance(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<AmountResponse> {
    let user = Address::new(user)?;
    let amount = state.gateways.sender.lock().await.get_user_balance(&user);
    Ok(Json(AmountResponse {
        user,
        amount,
        formatted: format_units(amount),
    }))
}

async fn get_user_yield(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<AmountResponse> {
    let user = Address::new(user)?;
    let amount = state.gateways.sender.lock().await.get_user_total_yield(&user);
    Ok(Json(AmountResponse {
        user,
        amount,
        formatted: format_units(amount),
    }))
}

async fn get_pool_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.gateways.receiver.lock().await.pool_stats())
}

async fn get_lending_pool(State(state): State<AppState>) -> Json<AddressResponse> {
    let address = state.gateways.receiver.lock().await.get_lending_pool().clone();
    Json(AddressResponse { address })
}

async fn get_receiver_owner(State(state): State<AppState>) -> Json<AddressResponse> {
    let address = state.gateways.receiver.lock().await.owner().clone();
    Json(AddressResponse { address })
}

async fn get_receiver_contract(State(state): State<AppState>) -> Json<AddressResponse> {
    let address = state.gateways.sender.lock().await.receiver_contract().clone();
    Json(AddressResponse { address })
}

async fn get_sender_owner(State(state): State<AppState>) -> Json<AddressResponse> {
    let address = state.gateways.sender.lock().await.owner().clone();
    Json(AddressResponse { address })
}

async fn get_stuck_withdrawals(State(state): State<AppState>) -> Json<Vec<PendingWithdrawal>> {
    Json(state.gateways.sender.lock().await.stuck_withdrawals())
}

async fn get_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<PendingWithdrawal> {
    let id = MessageId::from_hex(&id)?;
    state
        .gateways
        .sender
        .lock()
        .await
        .withdrawal(&id)
        .cloned()
        .map(Json)
        .ok_or(ApiError(BridgeError::WithdrawalNotFound { id }))
}

async fn post_deposit(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> ApiResult<MessageResponse> {
    let user = Address::new(request.user)?;
    let id = state
        .gateways
        .sender
        .lock()
        .await
        .deposit(&user, request.amount, crate::now_unix())
        .await?;
    Ok(Json(MessageResponse { id }))
}

async fn post_withdraw(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> ApiResult<MessageResponse> {
    let user = Address::new(request.user)?;
    let id = state
        .gateways
        .sender
        .lock()
        .await
        .withdraw(&user, request.amount, crate::now_unix())
        .await?;
    Ok(Json(MessageResponse { id }))
}

async fn post_retry_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WithdrawalStatusResponse> {
    let id = MessageId::from_hex(&id)?;
    let mut sender = state.gateways.sender.lock().await;
    sender.retry_withdrawal(&id, crate::now_unix()).await?;
    status_of(&sender, id)
}

async fn post_abandon_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WithdrawalStatusResponse> {
    let id = MessageId::from_hex(&id)?;
    let mut sender = state.gateways.sender.lock().await;
    sender.abandon_withdrawal(&id)?;
    status_of(&sender, id)
}

fn status_of(sender: &yield_bridge::Sender, id: MessageId) -> ApiResult<WithdrawalStatusResponse> {
    let withdrawal = sender
        .withdrawal(&id)
        .ok_or(ApiError(BridgeError::WithdrawalNotFound { id }))?;
    Ok(Json(WithdrawalStatusResponse {
        id,
        status: withdrawal.status,
        attempts: withdrawal.attempts,
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/users/{user}", get(get_user))
        .route("/users/{user}/balance", get(get_user_balance))
        .route("/users/{user}/yield", get(get_user_yield))
        .route("/pool/stats", get(get_pool_stats))
        .route("/receiver/lending-pool", get(get_lending_pool))
        .route("/receiver/owner", get(get_receiver_owner))
        .route("/sender/receiver-contract", get(get_receiver_contract))
        .route("/sender/owner", get(get_sender_owner))
        .route("/withdrawals/stuck", get(get_stuck_withdrawals))
        .route("/withdrawals/{id}", get(get_withdrawal))
        .route("/withdrawals/{id}/retry", post(post_retry_withdrawal))
        .route("/withdrawals/{id}/abandon", post(post_abandon_withdrawal))
        .route("/deposit", post(post_deposit))
        .route("/withdraw", post(post_withdraw))
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health  - Gateway health (JSON)");
    info!("  /metrics - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
