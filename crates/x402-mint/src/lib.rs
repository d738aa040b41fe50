//! Pay-then-mint settlement for x402.
//!
//! A client presents a signed EIP-3009 `transferWithAuthorization` for the
//! stablecoin. The relayer validates it, claims its `(payer, nonce)` in a
//! durable ledger, submits the payment, and only after the payment confirms
//! mints the collectible to the recipient.
//!
//! # Pieces
//!
//! - [`AuthorizationValidator`] checks payee, amount, validity window and signature, with no I/O
//! - [`SettlementLedger`] / [`SqliteLedger`] hold one record per authorization and its state
//! - [`RelayerSequencer`] serializes the relayer's transactions so sequence numbers never collide
//! - [`ChainClient`] / [`AlloyChainClient`] submit and confirm transactions
//! - [`SettlementOrchestrator`] drives a claim through the state machine
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use x402_mint::{ClaimRequest, PaymentPayload, SettlementOrchestrator};
//!
//! # async fn run<C: x402_mint::ChainClient>(
//! #     orchestrator: Arc<SettlementOrchestrator<C>>,
//! #     header: &str,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let payload = PaymentPayload::from_header(header)?;
//! let claim = ClaimRequest::from_payload(&payload, orchestrator.chain_config())?;
//! let settlement = orchestrator.process(claim).await?;
//! println!("minted {:?}", settlement.record.token_ids);
//! # Ok(())
//! # }
//! ```

// Core types
pub mod constants;
pub mod error;
pub mod payment;
pub mod price;

// Authorization checks
pub mod eip3009;
pub mod validator;

// Durable state
pub mod ledger;

// Chain access
pub mod calls;
pub mod chain;
pub mod sequencer;

// Settlement
pub mod orchestrator;

// Shared helpers
pub mod hmac;
pub mod security;

use alloy::sol;

// EIP-3009 typed-data struct signed by the payer.
// The sol! macro derives SolStruct which provides eip712_signing_hash().
sol! {
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// EIP-3009 stablecoin surface the relayer touches.
sol! {
    #[sol(rpc)]
    interface IEIP3009 {
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

// Collection the relayer is authorized to mint from.
sol! {
    #[sol(rpc)]
    interface IMintableCollection {
        function mint(address to, uint256 amount) external;
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

// Re-exports
pub use constants::*;
pub use error::{
    ChainError, DecodeError, LedgerError, PriceError, SettlementError, SettlementPhase,
    ValidationError,
};
pub use payment::*;

pub use chain::{
    AlloyChainClient, ChainClient, Confirmation, Receipt, SubmitError, TxPurpose, TxRequest,
};
pub use ledger::{
    Advance, ClaimMeta, ClaimOutcome, SettlementLedger, SettlementRecord, SettlementState,
    SqliteLedger,
};
pub use orchestrator::{Settlement, SettlementOrchestrator, SettlementPolicy, SweepReport};
pub use sequencer::{RelayerSequencer, SequencerPolicy};
pub use validator::AuthorizationValidator;
