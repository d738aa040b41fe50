//! Single-writer queue for relayer transactions.
//!
//! The relayer's account sequence number is one strictly ordered counter
//! shared by every request. All chain writes go through one worker task,
//! which assigns `confirmed + outstanding` to each submission in arrival
//! order and re-reads the chain when the node reports a conflict.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::TxHash;
use tokio::sync::{mpsc, oneshot};

use crate::chain::{ChainClient, SubmitError, TxRequest};
use crate::error::ChainError;

/// Retry and queueing limits for the sequencer worker.
#[derive(Debug, Clone)]
pub struct SequencerPolicy {
    /// Submission attempts per transaction before giving up.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Pending jobs buffered before `enqueue` waits for room.
    pub queue_depth: usize,
}

impl Default for SequencerPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            queue_depth: 256,
        }
    }
}

impl SequencerPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

type BuildTx = Box<dyn FnOnce() -> TxRequest + Send>;

struct Job {
    build: BuildTx,
    reply: oneshot::Sender<Result<TxHash, ChainError>>,
}

/// Handle to the relayer's submission queue. Cheap to clone.
#[derive(Clone)]
pub struct RelayerSequencer {
    jobs: mpsc::Sender<Job>,
}

impl RelayerSequencer {
    /// Start the worker on the current tokio runtime.
    ///
    /// There must be exactly one sequencer per relayer account per process.
    pub fn spawn<C: ChainClient>(chain: Arc<C>, policy: SequencerPolicy) -> Self {
        let (jobs, rx) = mpsc::channel(policy.queue_depth.max(1));
        tokio::spawn(run_worker(chain, rx, policy));
        Self { jobs }
    }

    /// Queue a transaction and wait until it is accepted by the node.
    ///
    /// `build` runs on the worker when the job reaches the head of the queue.
    /// Returns once the transaction is broadcast, not once it is mined.
    pub async fn enqueue<F>(&self, build: F) -> Result<TxHash, ChainError>
    where
        F: FnOnce() -> TxRequest + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job {
                build: Box::new(build),
                reply,
            })
            .await
            .map_err(|_| ChainError::SubmitFailed("relayer sequencer has stopped".to_string()))?;
        rx.await.map_err(|_| {
            ChainError::SubmitFailed("relayer sequencer dropped the request".to_string())
        })?
    }
}

async fn run_worker<C: ChainClient>(
    chain: Arc<C>,
    mut rx: mpsc::Receiver<Job>,
    policy: SequencerPolicy,
) {
    // Sequences this worker has handed to the node that the chain has not
    // yet confirmed.
    let mut in_flight: BTreeSet<u64> = BTreeSet::new();

    while let Some(job) = rx.recv().await {
        let tx = (job.build)();
        let result = submit_with_retry(chain.as_ref(), tx, &mut in_flight, &policy).await;
        // The caller may have gone away; the transaction is out either way.
        let _ = job.reply.send(result);
    }
    tracing::info!("relayer sequencer stopped");
}

async fn submit_with_retry<C: ChainClient>(
    chain: &C,
    tx: TxRequest,
    in_flight: &mut BTreeSet<u64>,
    policy: &SequencerPolicy,
) -> Result<TxHash, ChainError> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }

        // Nothing has been broadcast yet, so a failed read is just a retry.
        let confirmed = match chain.confirmed_sequence().await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                tracing::warn!(purpose = %tx.purpose, attempt = attempt, error = %e, "sequence read failed");
                last_error = e.to_string();
                continue;
            }
        };
        in_flight.retain(|s| *s >= confirmed);
        let sequence = match in_flight.last() {
            Some(highest) => (highest + 1).max(confirmed),
            None => confirmed,
        };

        match chain.submit(tx.clone(), sequence).await {
            Ok(hash) => {
                in_flight.insert(sequence);
                tracing::info!(
                    purpose = %tx.purpose,
                    sequence = sequence,
                    tx = %hash,
                    "relayer transaction submitted"
                );
                return Ok(hash);
            }
            Err(SubmitError::SequenceConflict(msg)) => {
                // Someone holds this slot; step past it on the next cycle.
                in_flight.insert(sequence);
                tracing::warn!(sequence = sequence, attempt = attempt, error = %msg, "sequence conflict");
                last_error = msg;
            }
            Err(SubmitError::SequenceGap(msg)) => {
                // Our view ran ahead of the chain (dropped transactions).
                in_flight.clear();
                tracing::warn!(sequence = sequence, attempt = attempt, error = %msg, "sequence gap");
                last_error = msg;
            }
            Err(SubmitError::Rejected(msg)) => {
                tracing::error!(purpose = %tx.purpose, sequence = sequence, error = %msg, "transaction rejected");
                return Err(ChainError::SubmitFailed(msg));
            }
            Err(SubmitError::InsufficientBalance(msg)) => {
                tracing::warn!(purpose = %tx.purpose, sequence = sequence, error = %msg, "transaction would exceed token balance");
                return Err(ChainError::InsufficientBalance(msg));
            }
            Err(SubmitError::Indeterminate(msg)) => {
                // Possibly broadcast: hold the slot, do not resend.
                in_flight.insert(sequence);
                tracing::error!(purpose = %tx.purpose, sequence = sequence, error = %msg, "submission outcome unknown");
                return Err(ChainError::Rpc(msg));
            }
        }
    }

    Err(ChainError::SubmitFailed(format!(
        "gave up after {} attempts: {last_error}",
        policy.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls;
    use crate::chain::mock::MockChain;
    use crate::chain::TxPurpose;
    use alloy::primitives::Address;

    fn fast_policy() -> SequencerPolicy {
        SequencerPolicy {
            max_attempts: 8,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            queue_depth: 16,
        }
    }

    fn mint_to(i: u8) -> impl FnOnce() -> TxRequest + Send + 'static {
        move || calls::mint(Address::repeat_byte(0xaa), Address::repeat_byte(i), 1)
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_get_contiguous_sequences() {
        let chain = Arc::new(MockChain::new().without_auto_mine());
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());

        let handles: Vec<_> = (0..10u8)
            .map(|i| {
                let sequencer = sequencer.clone();
                tokio::spawn(async move { sequencer.enqueue(mint_to(i)).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let mut sequences: Vec<u64> = chain.submitted().iter().map(|s| s.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_recovers_from_conflicts() {
        let chain = Arc::new(MockChain::new().without_auto_mine());
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());

        sequencer.enqueue(mint_to(1)).await.unwrap();
        chain.inject_conflicts(2);
        sequencer.enqueue(mint_to(2)).await.unwrap();

        let sequences: Vec<u64> = chain.submitted().iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let chain = Arc::new(MockChain::new());
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());
        chain.inject_conflicts(100);

        let err = sequencer.enqueue(mint_to(1)).await.unwrap_err();
        assert!(matches!(err, ChainError::SubmitFailed(ref m) if m.contains("8 attempts")));
        assert!(chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sequence_read_is_retried() {
        let chain = Arc::new(MockChain::new());
        chain.fail_sequence_reads(1);
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());

        sequencer.enqueue(mint_to(1)).await.unwrap();
        let sequences: Vec<u64> = chain.submitted().iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0]);
    }

    #[tokio::test]
    async fn test_unreadable_sequence_fails_as_not_sent() {
        let chain = Arc::new(MockChain::new());
        chain.fail_sequence_reads(100);
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());

        let err = sequencer.enqueue(mint_to(1)).await.unwrap_err();
        assert!(matches!(err, ChainError::SubmitFailed(ref m) if m.contains("connection reset")));
        assert!(chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let chain = Arc::new(MockChain::new());
        chain.reject(TxPurpose::Mint);
        let sequencer = RelayerSequencer::spawn(chain.clone(), fast_policy());

        let err = sequencer.enqueue(mint_to(1)).await.unwrap_err();
        assert!(matches!(err, ChainError::SubmitFailed(_)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = SequencerPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(10), Duration::from_secs(4));
    }
}
