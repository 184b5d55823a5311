use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::DealState;

pub type AppResult<T> = Result<T, AppError>;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Failures surfaced by the settlement engine.
///
/// Only `QuoteUnavailable` may be retried by the caller; every other variant
/// needs an operator or counterparty action first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("Clock skew: now {now} is before snapshot time {as_of}")]
    ClockSkew { now: i64, as_of: i64 },

    #[error("Deal {deal_id} is {current:?}, expected {expected}")]
    InvalidState {
        deal_id: Uuid,
        current: DealState,
        expected: String,
    },

    #[error("No verified yield read since funding for deal {0}")]
    NoVerifiedYield(Uuid),

    #[error("Slippage exceeded: minimum out {to_amount_min} below floor {floor}")]
    SlippageExceeded { to_amount_min: u64, floor: u64 },

    #[error("Quote has no execution payload")]
    NoExecutionPayload,

    #[error("Quote unavailable: {0}")]
    QuoteUnavailable(String),

    #[error("Malformed quote: {0}")]
    MalformedQuote(String),

    #[error("Quote expired at {0}")]
    QuoteExpired(chrono::DateTime<chrono::Utc>),

    #[error("Same chain and token payout does not need a quote")]
    QuoteNotRequired,

    #[error("Settlement already in progress for deal {0}")]
    SettlementInProgress(Uuid),

    #[error("Dispute timeout elapsed for deal {0}")]
    DisputeTimeoutElapsed(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Conservation violated: {depositor} + {counterparty} != {expected}")]
    ConservationViolated {
        depositor: u64,
        counterparty: u64,
        expected: u128,
    },

    #[error("Instruction signature does not verify")]
    InvalidSignature,
}

impl SettlementError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::QuoteUnavailable(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SettlementError::ClockSkew { .. } => "CLOCK_SKEW",
            SettlementError::InvalidState { .. } => "INVALID_STATE",
            SettlementError::NoVerifiedYield(_) => "NO_VERIFIED_YIELD",
            SettlementError::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            SettlementError::NoExecutionPayload => "NO_EXECUTION_PAYLOAD",
            SettlementError::QuoteUnavailable(_) => "QUOTE_UNAVAILABLE",
            SettlementError::MalformedQuote(_) => "MALFORMED_QUOTE",
            SettlementError::QuoteExpired(_) => "QUOTE_EXPIRED",
            SettlementError::QuoteNotRequired => "QUOTE_NOT_REQUIRED",
            SettlementError::SettlementInProgress(_) => "SETTLEMENT_IN_PROGRESS",
            SettlementError::DisputeTimeoutElapsed(_) => "DISPUTE_TIMEOUT_ELAPSED",
            SettlementError::InvalidAmount(_) => "INVALID_AMOUNT",
            SettlementError::ConservationViolated { .. } => "CONSERVATION_VIOLATED",
            SettlementError::InvalidSignature => "INVALID_SIGNATURE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SettlementError::InvalidState { .. }
            | SettlementError::NoVerifiedYield(_)
            | SettlementError::SettlementInProgress(_)
            | SettlementError::DisputeTimeoutElapsed(_)
            | SettlementError::QuoteNotRequired => StatusCode::CONFLICT,
            SettlementError::QuoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SettlementError::NoExecutionPayload | SettlementError::MalformedQuote(_) => {
                StatusCode::BAD_GATEWAY
            }
            SettlementError::SlippageExceeded { .. }
            | SettlementError::QuoteExpired(_)
            | SettlementError::InvalidAmount(_)
            | SettlementError::ClockSkew { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SettlementError::ConservationViolated { .. } | SettlementError::InvalidSignature => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, retryable) = match &self {
            AppError::Settlement(err) => (err.status(), err.error_code(), err.is_retryable()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", false),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", false),
            AppError::Config(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false)
            }
        };

        let message = match &self {
            AppError::Config(_) | AppError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            retryable,
        });

        (status, body).into_response()
    }
}
