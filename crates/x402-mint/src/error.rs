use std::fmt;

use alloy::primitives::{Address, TxHash, U256};
use thiserror::Error;

use crate::ledger::{SettlementRecord, SettlementState};

/// Rejection of an authorization before any relayer transaction for it
/// lands. Never retried: the caller must sign a corrected authorization or
/// fund the payer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payment recipient mismatch: expected {expected}, got {got}")]
    RecipientMismatch { expected: Address, got: Address },

    #[error("insufficient amount: offered {offered}, required {required}")]
    InsufficientAmount { offered: U256, required: U256 },

    #[error("validity window is empty: validAfter {valid_after} >= validBefore {valid_before}")]
    InvalidWindow { valid_after: u64, valid_before: u64 },

    #[error("authorization not yet valid (validAfter {valid_after}, now {now})")]
    NotYetValid { valid_after: u64, now: u64 },

    #[error("authorization expired (validBefore {valid_before}, now {now})")]
    Expired { valid_before: u64, now: u64 },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The payer's token balance cannot cover the transfer.
    #[error("payer has insufficient token balance: {0}")]
    InsufficientFunds(String),
}

impl ValidationError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::RecipientMismatch { .. } => "recipient_mismatch",
            ValidationError::InsufficientAmount { .. } => "insufficient_amount",
            ValidationError::InvalidWindow { .. } => "invalid_validity_window",
            ValidationError::NotYetValid { .. } => "authorization_not_yet_valid",
            ValidationError::Expired { .. } => "authorization_expired",
            ValidationError::InvalidSignature(_) => "invalid_signature",
            ValidationError::InsufficientFunds(_) => "insufficient_funds",
        }
    }
}

/// Malformed wire payload (before any validation of its contents).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("invalid JSON payload: {0}")]
    Json(String),

    #[error("unsupported x402 version {0} (expected 1)")]
    UnsupportedVersion(u32),

    #[error("scheme mismatch: expected '{expected}', got '{got}'")]
    SchemeMismatch { expected: String, got: String },

    #[error("network mismatch: expected '{expected}', got '{got}'")]
    NetworkMismatch { expected: String, got: String },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A price string that does not describe a token amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid price '{input}': {reason}")]
pub struct PriceError {
    pub input: String,
    pub reason: String,
}

/// Errors from the settlement ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Store outage. Callers must fail closed.
    #[error("settlement ledger unavailable: {0}")]
    Unavailable(String),

    #[error("settlement record not found")]
    NotFound,

    /// The stored state does not permit the requested edge. Also the signal
    /// that a concurrent writer won a compare-and-set.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: SettlementState,
        to: SettlementState,
    },

    #[error("corrupt settlement record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Unavailable(e.to_string())
    }
}

/// Chain-level failures surfaced by the chain client or the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("submit failed: {0}")]
    SubmitFailed(String),

    /// A token transfer in the transaction exceeds the sender's balance.
    /// Nothing was broadcast.
    #[error("insufficient token balance: {0}")]
    InsufficientBalance(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("confirmation timed out for {0:#x}")]
    TimedOut(TxHash),

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Which leg of the settlement a chain error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPhase {
    Payment,
    Mint,
}

impl fmt::Display for SettlementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementPhase::Payment => f.write_str("payment"),
            SettlementPhase::Mint => f.write_str("mint"),
        }
    }
}

/// Everything the orchestrator can return instead of a settled record.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("authorization rejected: {0}")]
    Validation(#[from] ValidationError),

    /// The nonce is already in the ledger; carries its current record.
    #[error("authorization already claimed (state {})", .0.state)]
    Replay(Box<SettlementRecord>),

    /// Payment-phase errors are terminal for the nonce unless `TimedOut`,
    /// in which case the record stays `*_SUBMITTED` for a later re-check.
    #[error("{phase} chain error: {source}")]
    Chain {
        phase: SettlementPhase,
        #[source]
        source: ChainError,
        record: Box<SettlementRecord>,
    },

    /// Payment confirmed and irreversible, mint did not complete. Resolved
    /// only by resuming the mint, never by a fresh payment.
    #[error("payment confirmed but mint failed: {reason}")]
    PartialSettlement {
        record: Box<SettlementRecord>,
        reason: String,
        /// Reported from the ledger for a repeated claim, not produced by
        /// this call.
        replayed: bool,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("relayer unavailable: {0}")]
    RelayerUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}
