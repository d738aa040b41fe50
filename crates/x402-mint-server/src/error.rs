//! Mapping of settlement outcomes onto HTTP.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use x402_mint::{DecodeError, LedgerError, SettlementError, SettlementRecord, SettlementState};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid payment header: {0}")]
    InvalidPayment(#[from] DecodeError),

    #[error("invalid {field}: {reason}")]
    InvalidPath { field: &'static str, reason: String },

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

/// Where to poll a settlement that is still in flight.
pub fn status_path(record: &SettlementRecord) -> String {
    format!("/claims/{:#x}/{:#x}", record.payer, record.nonce)
}

fn hash(h: Option<alloy::primitives::TxHash>) -> serde_json::Value {
    match h {
        Some(h) => json!(format!("{h:#x}")),
        None => serde_json::Value::Null,
    }
}

impl ApiError {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            ApiError::InvalidPayment(_) | ApiError::InvalidPath { .. } => "invalid",
            ApiError::Unauthorized | ApiError::Forbidden(_) => "unauthorized",
            ApiError::Settlement(e) => match e {
                SettlementError::Validation(_) => "rejected",
                SettlementError::Replay(_) => "replay",
                SettlementError::Chain { record, .. } => match record.state {
                    SettlementState::MintFailedAfterPayment => "partial",
                    s if s.is_terminal() => "payment_failed",
                    _ => "pending",
                },
                SettlementError::PartialSettlement { .. } => "partial",
                SettlementError::Ledger(LedgerError::NotFound) => "not_found",
                SettlementError::Ledger(LedgerError::Unavailable(_))
                | SettlementError::RelayerUnavailable(_) => "unavailable",
                SettlementError::Ledger(_) | SettlementError::Internal(_) => "internal",
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayment(_) | ApiError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Settlement(e) => match e {
                SettlementError::Validation(v) if crate::gate::is_payment_problem(v) => {
                    StatusCode::PAYMENT_REQUIRED
                }
                SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
                SettlementError::Replay(_) => StatusCode::CONFLICT,
                SettlementError::Chain { record, .. } => match record.state {
                    SettlementState::MintFailedAfterPayment => StatusCode::INTERNAL_SERVER_ERROR,
                    s if s.is_terminal() => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::ACCEPTED,
                },
                SettlementError::PartialSettlement { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                SettlementError::Ledger(LedgerError::NotFound) => StatusCode::NOT_FOUND,
                SettlementError::Ledger(LedgerError::Unavailable(_))
                | SettlementError::RelayerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SettlementError::Ledger(_) | SettlementError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = match self {
            ApiError::InvalidPayment(e) => json!({
                "success": false,
                "error": "invalid_payment_header",
                "message": e.to_string(),
            }),
            ApiError::InvalidPath { .. } => json!({
                "success": false,
                "error": "invalid_path",
                "message": self.to_string(),
            }),
            ApiError::Unauthorized => json!({
                "error": "unauthorized",
                "message": "Valid Bearer token required",
            }),
            ApiError::Forbidden(message) => json!({
                "error": "forbidden",
                "message": message,
            }),
            ApiError::Settlement(e) => settlement_body(e),
        };
        HttpResponse::build(status).json(body)
    }
}

fn settlement_body(err: &SettlementError) -> serde_json::Value {
    match err {
        SettlementError::Validation(v) => json!({
            "success": false,
            "error": v.code(),
            "message": v.to_string(),
        }),
        SettlementError::Replay(record) => json!({
            "success": false,
            "error": "authorization_already_used",
            "message": err.to_string(),
            "state": record.state,
            "paymentTxHash": hash(record.payment_tx_hash),
            "mintTxHash": hash(record.mint_tx_hash),
            "statusUrl": status_path(record),
        }),
        SettlementError::PartialSettlement { record, reason, .. } => partial_body(record, reason),
        SettlementError::Chain {
            phase,
            source,
            record,
        } => match record.state {
            SettlementState::MintFailedAfterPayment => partial_body(record, &source.to_string()),
            s if s.is_terminal() => json!({
                "success": false,
                "error": format!("{phase}_failed"),
                "message": source.to_string(),
                "state": record.state,
                "paymentTxHash": hash(record.payment_tx_hash),
            }),
            _ => json!({
                "success": false,
                "pending": true,
                "message": format!("{phase} not yet confirmed: {source}"),
                "state": record.state,
                "paymentTxHash": hash(record.payment_tx_hash),
                "mintTxHash": hash(record.mint_tx_hash),
                "statusUrl": status_path(record),
            }),
        },
        SettlementError::Ledger(LedgerError::NotFound) => json!({
            "success": false,
            "error": "not_found",
        }),
        SettlementError::Ledger(LedgerError::Unavailable(_)) => json!({
            "success": false,
            "error": "ledger_unavailable",
            "message": "settlement ledger unavailable, try again later",
        }),
        SettlementError::RelayerUnavailable(_) => json!({
            "success": false,
            "error": "relayer_unavailable",
            "message": "relayer cannot accept new settlements right now",
        }),
        SettlementError::Ledger(_) | SettlementError::Internal(_) => json!({
            "success": false,
            "error": "internal_error",
        }),
    }
}

fn partial_body(record: &SettlementRecord, reason: &str) -> serde_json::Value {
    json!({
        "success": false,
        "error": "mint_failed_after_payment",
        "message": reason,
        "state": record.state,
        "paymentTxHash": hash(record.payment_tx_hash),
        "recipient": format!("{:#x}", record.recipient),
        "requiresManualReconciliation": true,
        "statusUrl": status_path(record),
    })
}
