//! Chain access for the relayer.
//!
//! [`ChainClient`] is the seam between settlement logic and the network.
//! [`AlloyChainClient`] implements it over any alloy [`Provider`] that can
//! sign for the relayer.

use std::future::Future;
use std::time::{Duration, Instant};

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::{BlockId, TransactionRequest};
use alloy::sol_types::SolEvent;

use crate::error::ChainError;
use crate::{IEIP3009, IMintableCollection};

/// What a relayer transaction is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxPurpose {
    Payment,
    Mint,
}

impl std::fmt::Display for TxPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxPurpose::Payment => f.write_str("payment"),
            TxPurpose::Mint => f.write_str("mint"),
        }
    }
}

/// An unsigned relayer transaction, minus its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub purpose: TxPurpose,
    pub to: Address,
    pub input: Bytes,
    /// Fixed gas limit. `None` lets the provider estimate.
    pub gas_limit: Option<u64>,
}

/// Why the node refused a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The sequence number is already used or taken by a pending transaction.
    SequenceConflict(String),
    /// The sequence number is ahead of the account's next expected one.
    SequenceGap(String),
    /// The node rejected the transaction outright. Nothing was broadcast.
    Rejected(String),
    /// Rejected because a token transfer inside it exceeds the sender's
    /// balance. Nothing was broadcast.
    InsufficientBalance(String),
    /// The request failed in transit; the transaction may or may not have
    /// reached the mempool.
    Indeterminate(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::SequenceConflict(m) => write!(f, "sequence conflict: {m}"),
            SubmitError::SequenceGap(m) => write!(f, "sequence gap: {m}"),
            SubmitError::Rejected(m) => write!(f, "rejected: {m}"),
            SubmitError::InsufficientBalance(m) => write!(f, "insufficient balance: {m}"),
            SubmitError::Indeterminate(m) => write!(f, "indeterminate: {m}"),
        }
    }
}

/// A mined, successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    /// Token ids of ERC-721 `Transfer` events minted (from the zero address)
    /// in this transaction.
    pub minted_token_ids: Vec<String>,
}

/// Outcome of waiting on a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(Receipt),
    Reverted(String),
    /// Not mined before the deadline. Not a failure: it may still land.
    TimedOut,
}

/// Network operations the settlement engine needs.
pub trait ChainClient: Send + Sync + 'static {
    /// The account that signs and pays gas for every transaction.
    fn relayer(&self) -> Address;

    /// Number of relayer transactions already mined; the lowest sequence
    /// number not yet consumed on-chain.
    fn confirmed_sequence(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Sign and broadcast `tx` with the given sequence number.
    fn submit(
        &self,
        tx: TxRequest,
        sequence: u64,
    ) -> impl Future<Output = Result<TxHash, SubmitError>> + Send;

    /// Wait up to `timeout` for `hash` to be mined.
    fn await_confirmation(
        &self,
        hash: TxHash,
        timeout: Duration,
    ) -> impl Future<Output = Result<Confirmation, ChainError>> + Send;

    /// Whether the EIP-3009 `(payer, nonce)` has been consumed on `token`.
    fn authorization_used(
        &self,
        token: Address,
        payer: Address,
        nonce: B256,
    ) -> impl Future<Output = Result<bool, ChainError>> + Send;

    /// Native gas balance of the relayer.
    fn relayer_balance(&self) -> impl Future<Output = Result<U256, ChainError>> + Send;

    /// Height of the latest block; doubles as a liveness check.
    fn latest_block(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// `balanceOf(owner)` on the ERC-20 `token`.
    fn token_balance(
        &self,
        token: Address,
        owner: Address,
    ) -> impl Future<Output = Result<U256, ChainError>> + Send;
}

/// Time allowed for a single `eth_sendRawTransaction` round trip.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ChainClient`] over an alloy provider that holds the relayer's wallet.
pub struct AlloyChainClient<P> {
    provider: P,
    relayer: Address,
    poll_interval: Duration,
}

impl<P> AlloyChainClient<P> {
    pub fn new(provider: P, relayer: Address) -> Self {
        Self {
            provider,
            relayer,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Map a node error message onto the sequencing outcome it implies.
///
/// Error text differs between clients; these substrings cover geth, reth,
/// erigon and the OP-stack sequencer. Token balance shortfalls surface as
/// revert reasons from gas estimation; gas shortfalls ("insufficient funds
/// for gas") are the relayer's and stay plain rejections.
pub fn classify_node_error(message: &str) -> SubmitError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("nonce too low")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
    {
        SubmitError::SequenceConflict(message.to_string())
    } else if lower.contains("nonce too high") || lower.contains("nonce gap") {
        SubmitError::SequenceGap(message.to_string())
    } else if lower.contains("transfer amount exceeds balance")
        || lower.contains("insufficient balance")
    {
        SubmitError::InsufficientBalance(message.to_string())
    } else {
        SubmitError::Rejected(message.to_string())
    }
}

/// Token ids minted in a receipt: ERC-721 `Transfer` with `from == 0`.
/// ERC-20 transfers carry only three topics and are skipped.
pub fn minted_token_ids<'a, I>(logs: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a Address, &'a [B256])>,
{
    logs.into_iter()
        .filter_map(|(_, topics)| {
            if topics.len() == 4
                && topics[0] == IMintableCollection::Transfer::SIGNATURE_HASH
                && topics[1] == B256::ZERO
            {
                Some(U256::from_be_bytes(topics[3].0).to_string())
            } else {
                None
            }
        })
        .collect()
}

impl<P> ChainClient for AlloyChainClient<P>
where
    P: Provider + Send + Sync + 'static,
{
    fn relayer(&self) -> Address {
        self.relayer
    }

    async fn confirmed_sequence(&self) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(self.relayer)
            .block_id(BlockId::latest())
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_getTransactionCount failed: {e}")))
    }

    async fn submit(&self, tx: TxRequest, sequence: u64) -> Result<TxHash, SubmitError> {
        let mut request = TransactionRequest::default()
            .with_from(self.relayer)
            .with_to(tx.to)
            .with_input(tx.input)
            .with_nonce(sequence);
        if let Some(gas) = tx.gas_limit {
            request = request.with_gas_limit(gas);
        }

        let pending = tokio::time::timeout(SEND_TIMEOUT, self.provider.send_transaction(request))
            .await
            .map_err(|_| {
                SubmitError::Indeterminate(format!(
                    "{} send timed out after {}s",
                    tx.purpose,
                    SEND_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| match e.as_error_resp() {
                Some(payload) => classify_node_error(&payload.message),
                None => SubmitError::Indeterminate(format!("{} send failed: {e}", tx.purpose)),
            })?;

        Ok(*pending.tx_hash())
    }

    async fn await_confirmation(
        &self,
        hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, ChainError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    if !receipt.status() {
                        return Ok(Confirmation::Reverted(format!(
                            "transaction {hash:#x} reverted"
                        )));
                    }
                    let logs = receipt.inner.logs();
                    let minted =
                        minted_token_ids(logs.iter().map(|log| (&log.inner.address, log.topics())));
                    return Ok(Confirmation::Confirmed(Receipt {
                        tx_hash: receipt.transaction_hash,
                        block_number: receipt.block_number,
                        minted_token_ids: minted,
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tx = %hash, error = %e, "receipt poll failed, retrying");
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Ok(Confirmation::TimedOut);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn authorization_used(
        &self,
        token: Address,
        payer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError> {
        let contract = IEIP3009::new(token, &self.provider);
        contract
            .authorizationState(payer, nonce)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(format!("authorizationState failed: {e}")))
    }

    async fn relayer_balance(&self) -> Result<U256, ChainError> {
        self.provider
            .get_balance(self.relayer)
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_getBalance failed: {e}")))
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_blockNumber failed: {e}")))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        let contract = IEIP3009::new(token, &self.provider);
        contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(format!("balanceOf failed: {e}")))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_node_errors() {
        assert!(matches!(
            classify_node_error("nonce too low: next nonce 5, tx nonce 4"),
            SubmitError::SequenceConflict(_)
        ));
        assert!(matches!(
            classify_node_error("Replacement transaction underpriced"),
            SubmitError::SequenceConflict(_)
        ));
        assert!(matches!(
            classify_node_error("nonce too high"),
            SubmitError::SequenceGap(_)
        ));
        assert!(matches!(
            classify_node_error("insufficient funds for gas * price + value"),
            SubmitError::Rejected(_)
        ));
        assert!(matches!(
            classify_node_error("execution reverted: ERC20: transfer amount exceeds balance"),
            SubmitError::InsufficientBalance(_)
        ));
        assert!(matches!(
            classify_node_error("FiatToken: Insufficient Balance"),
            SubmitError::InsufficientBalance(_)
        ));
    }

    #[test]
    fn test_minted_token_ids_only_counts_mints() {
        let collection = Address::repeat_byte(0xaa);
        let sig = IMintableCollection::Transfer::SIGNATURE_HASH;
        let to = B256::left_padding_from(Address::repeat_byte(0x01).as_slice());

        let mint = [sig, B256::ZERO, to, B256::from(U256::from(42u64).to_be_bytes::<32>())];
        let transfer = [sig, to, to, B256::from(U256::from(7u64).to_be_bytes::<32>())];
        let erc20 = [sig, B256::ZERO, to];

        let logs: Vec<(&Address, &[B256])> = vec![
            (&collection, &mint[..]),
            (&collection, &transfer[..]),
            (&collection, &erc20[..]),
        ];
        assert_eq!(minted_token_ids(logs), vec!["42".to_string()]);
    }
}
