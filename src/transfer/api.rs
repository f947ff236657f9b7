//! Transfer API Layer
//!
//! HTTP handlers for submitting transfers and querying saga status.
//! Body shape is checked with `validator` before anything reaches the saga.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::Database;
use crate::mutex::RedisLockStore;

use super::coordinator::TransferSaga;
use super::error::TransferError;
use super::types::{SagaRecord, TransferRequest, TransferResult};

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Body of `POST /api/v1/transfers`. Amounts are minor units.
#[derive(Debug, Deserialize, Validate)]
pub struct TransferApiRequest {
    pub reference_id: Uuid,
    #[validate(range(min = 1, message = "amount must be greater than zero"))]
    pub amount: i64,
    #[validate(range(min = 0, message = "fee_amount must not be negative"))]
    pub fee_amount: Option<i64>,
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<TransferApiRequest> for TransferRequest {
    fn from(req: TransferApiRequest) -> Self {
        TransferRequest {
            reference_id: req.reference_id,
            amount: req.amount,
            fee_amount: req.fee_amount,
            source_account_id: req.source_account_id,
            destination_account_id: req.destination_account_id,
            metadata: req.metadata,
        }
    }
}

/// Saga status as returned by `GET /api/v1/transfers/{reference_id}`
#[derive(Debug, Serialize)]
pub struct SagaStatusResponse {
    pub reference_id: Uuid,
    pub saga_id: Uuid,
    pub state: &'static str,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<i64>,
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SagaRecord> for SagaStatusResponse {
    fn from(record: SagaRecord) -> Self {
        Self {
            reference_id: record.request.reference_id,
            saga_id: record.saga_id,
            state: record.state.as_str(),
            amount: record.request.amount,
            fee_amount: record.request.fee_amount,
            source_account_id: record.request.source_account_id,
            destination_account_id: record.request.destination_account_id,
            error_code: record.error_code,
            error_message: record.error_message,
            attempts: record.attempts,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub postgres: bool,
    pub redis: bool,
}

/// API wrapper for standard response format
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            data: Some(data),
            msg: None,
        }
    }

    pub fn error(code: i32, msg: impl ToString) -> Self {
        Self {
            code,
            data: None,
            msg: Some(msg.to_string()),
        }
    }
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = -1001;
    pub const INVALID_AMOUNT: i32 = -1002;
    pub const SAME_ACCOUNT: i32 = -1004;
    pub const INSUFFICIENT_BALANCE: i32 = -2001;
    pub const ACCOUNT_NOT_FOUND: i32 = -2002;
    pub const ACCOUNT_NOT_ACTIVE: i32 = -2003;
    pub const CURRENCY_MISMATCH: i32 = -2004;
    pub const REFERENCE_CONFLICT: i32 = -3001;
    pub const SERVICE_UNAVAILABLE: i32 = -5001;
    pub const REQUEST_TIMEOUT: i32 = -5002;
    pub const TRANSFER_NOT_FOUND: i32 = -6001;
    pub const TRANSFER_FAILED: i32 = -6002;
}

/// Map TransferError to (StatusCode, error_code, message)
fn map_error(e: &TransferError) -> (StatusCode, i32, String) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let code = match e.code() {
        "INVALID_AMOUNT" | "INVALID_FEE" | "OVERFLOW" => error_codes::INVALID_AMOUNT,
        "SAME_ACCOUNT" => error_codes::SAME_ACCOUNT,
        "INSUFFICIENT_BALANCE" => error_codes::INSUFFICIENT_BALANCE,
        "ACCOUNT_NOT_FOUND" => error_codes::ACCOUNT_NOT_FOUND,
        "ACCOUNT_NOT_ACTIVE" => error_codes::ACCOUNT_NOT_ACTIVE,
        "CURRENCY_MISMATCH" => error_codes::CURRENCY_MISMATCH,
        "REFERENCE_CONFLICT" => error_codes::REFERENCE_CONFLICT,
        "LOCK_CONTENDED" | "LOCK_TIMEOUT" | "LOCK_STORE_ERROR" => error_codes::SERVICE_UNAVAILABLE,
        "ACTIVITY_TIMEOUT" => error_codes::REQUEST_TIMEOUT,
        "TRANSFER_NOT_FOUND" => error_codes::TRANSFER_NOT_FOUND,
        _ => error_codes::TRANSFER_FAILED,
    };

    (status, code, format!("{}: {}", e.code(), e))
}

fn error_response<T>(e: &TransferError) -> (StatusCode, Json<ApiResponse<T>>) {
    let (status, code, msg) = map_error(e);
    (status, Json(ApiResponse::error(code, msg)))
}

// ============================================================================
// State & Router
// ============================================================================

pub struct AppState {
    pub saga: Arc<TransferSaga>,
    /// Health-checked when present
    pub db: Option<Database>,
    pub locks: Option<RedisLockStore>,
    /// How long POST waits for the saga before answering 504; the saga keeps running
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(saga: Arc<TransferSaga>, request_timeout: Duration) -> Self {
        Self {
            saga,
            db: None,
            locks: None,
            request_timeout,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_lock_store(mut self, locks: RedisLockStore) -> Self {
        self.locks = Some(locks);
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/transfers", post(create_transfer))
        .route("/api/v1/transfers/{reference_id}", get(get_transfer_status))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a transfer and wait for the saga outcome
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransferApiRequest>,
) -> (StatusCode, Json<ApiResponse<TransferResult>>) {
    if let Err(e) = req.validate() {
        warn!(reference_id = %req.reference_id, error = %e, "Rejected transfer request");
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(error_codes::INVALID_PARAMETER, e)),
        );
    }

    let request = TransferRequest::from(req);
    let reference_id = request.reference_id;
    info!(
        reference_id = %reference_id,
        amount = request.amount,
        fee_amount = ?request.fee_amount,
        "Transfer submitted"
    );

    match tokio::time::timeout(state.request_timeout, state.saga.run(request)).await {
        Ok(Ok(result)) => (StatusCode::CREATED, Json(ApiResponse::success(result))),
        Ok(Err(e)) => error_response(&e),
        Err(_) => {
            warn!(reference_id = %reference_id, "Transfer still running after request timeout");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ApiResponse::error(
                    error_codes::REQUEST_TIMEOUT,
                    "transfer is still in progress; query its status or resubmit",
                )),
            )
        }
    }
}

pub async fn get_transfer_status(
    State(state): State<Arc<AppState>>,
    Path(reference_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<SagaStatusResponse>>) {
    match state.saga.status(reference_id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(ApiResponse::success(SagaStatusResponse::from(record))),
        ),
        Err(e) => error_response(&e),
    }
}

/// 200 when every configured dependency answers, 503 otherwise
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let postgres = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => true,
            Err(e) => {
                error!("[HEALTH] PostgreSQL ping failed: {}", e);
                false
            }
        },
        None => true,
    };
    let redis = match &state.locks {
        Some(locks) => match locks.health_check().await {
            Ok(()) => true,
            Err(e) => {
                error!("[HEALTH] Redis ping failed: {}", e);
                false
            }
        },
        None => true,
    };

    if postgres && redis {
        (
            StatusCode::OK,
            Json(ApiResponse::success(HealthResponse { postgres, redis })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse {
                code: 503,
                data: Some(HealthResponse { postgres, redis }),
                msg: Some("unavailable".to_string()),
            }),
        )
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
