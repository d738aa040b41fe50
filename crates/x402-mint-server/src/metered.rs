//! [`ChainClient`] wrapper that records submissions and confirmations in
//! Prometheus.

use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};
use x402_mint::{ChainClient, ChainError, Confirmation, SubmitError, TxRequest};

use crate::metrics::{CHAIN_SUBMISSIONS, CONFIRMATIONS};

pub struct MeteredChain<C> {
    inner: C,
}

impl<C> MeteredChain<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

fn submit_label(result: &Result<TxHash, SubmitError>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(SubmitError::SequenceConflict(_)) => "sequence_conflict",
        Err(SubmitError::SequenceGap(_)) => "sequence_gap",
        Err(SubmitError::Rejected(_)) => "rejected",
        Err(SubmitError::InsufficientBalance(_)) => "insufficient_balance",
        Err(SubmitError::Indeterminate(_)) => "indeterminate",
    }
}

fn confirmation_label(result: &Result<Confirmation, ChainError>) -> &'static str {
    match result {
        Ok(Confirmation::Confirmed(_)) => "confirmed",
        Ok(Confirmation::Reverted(_)) => "reverted",
        Ok(Confirmation::TimedOut) => "timed_out",
        Err(_) => "rpc_error",
    }
}

impl<C: ChainClient> ChainClient for MeteredChain<C> {
    fn relayer(&self) -> Address {
        self.inner.relayer()
    }

    async fn confirmed_sequence(&self) -> Result<u64, ChainError> {
        self.inner.confirmed_sequence().await
    }

    async fn submit(&self, tx: TxRequest, sequence: u64) -> Result<TxHash, SubmitError> {
        let purpose = tx.purpose.to_string();
        let result = self.inner.submit(tx, sequence).await;
        CHAIN_SUBMISSIONS
            .with_label_values(&[purpose.as_str(), submit_label(&result)])
            .inc();
        result
    }

    async fn await_confirmation(
        &self,
        hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, ChainError> {
        let result = self.inner.await_confirmation(hash, timeout).await;
        CONFIRMATIONS
            .with_label_values(&[confirmation_label(&result)])
            .inc();
        result
    }

    async fn authorization_used(
        &self,
        token: Address,
        payer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError> {
        self.inner.authorization_used(token, payer, nonce).await
    }

    async fn relayer_balance(&self) -> Result<U256, ChainError> {
        self.inner.relayer_balance().await
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.inner.latest_block().await
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        self.inner.token_balance(token, owner).await
    }
}
