//! Drives a claim from `CLAIMED` to `MINT_CONFIRMED`.
//!
//! Every state change goes through [`SettlementLedger::advance`]; every chain
//! write goes through the [`RelayerSequencer`]. The orchestrator holds no
//! per-claim memory of its own, so any number of request handlers and the
//! recovery sweep can work on the same ledger concurrently.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256, U256};

use crate::calls;
use crate::chain::{ChainClient, Confirmation};
use crate::error::{ChainError, LedgerError, SettlementError, SettlementPhase, ValidationError};
use crate::ledger::{
    unix_now, Advance, ClaimMeta, ClaimOutcome, SettlementLedger, SettlementRecord,
    SettlementState,
};
use crate::payment::{ClaimRequest, PaymentAuthorization};
use crate::sequencer::RelayerSequencer;
use crate::validator::AuthorizationValidator;
use crate::ChainConfig;

/// Business and timing parameters for settlement.
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// Address every authorization must pay.
    pub pay_to: Address,
    /// Minimum accepted amount, in token base units.
    pub price: U256,
    /// Collection minted on successful payment.
    pub collection: Address,
    pub mint_amount: u64,
    /// Horizon of a single confirmation wait.
    pub confirmation_timeout: Duration,
    /// Confirmation waits before a leg is reported as timed out.
    pub confirmation_attempts: u32,
    /// In-progress records untouched for this long are picked up by the sweep.
    pub stale_after: Duration,
    /// Relayer gas balance below which new claims are refused.
    pub min_relayer_balance: U256,
    /// Settled records are kept at least this long.
    pub retention: Duration,
    /// Let the sweep retry `MINT_FAILED_AFTER_PAYMENT` records on its own.
    pub auto_resume_failed_mints: bool,
    /// Records handled per sweep.
    pub sweep_batch: usize,
}

impl SettlementPolicy {
    pub fn new(pay_to: Address, price: U256, collection: Address) -> Self {
        Self {
            pay_to,
            price,
            collection,
            mint_amount: 1,
            confirmation_timeout: Duration::from_secs(60),
            confirmation_attempts: 3,
            stale_after: Duration::from_secs(600),
            // 0.001 ETH
            min_relayer_balance: U256::from(1_000_000_000_000_000u64),
            retention: Duration::from_secs(7 * 24 * 3600),
            auto_resume_failed_mints: false,
            sweep_batch: 100,
        }
    }
}

/// Tally of one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Records moved forward on the happy path.
    pub advanced: usize,
    /// Records left where they were (still waiting on the chain).
    pub pending: usize,
    /// Records moved to a failure state.
    pub failed: usize,
    pub purged: usize,
}

/// A settled claim, and whether this call did the settling.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub record: SettlementRecord,
    /// The record was already `MINT_CONFIRMED`; nothing happened on-chain.
    pub replayed: bool,
}

impl Settlement {
    fn fresh(record: SettlementRecord) -> Self {
        Self {
            record,
            replayed: false,
        }
    }
}

pub struct SettlementOrchestrator<C: ChainClient> {
    chain: Arc<C>,
    ledger: Arc<dyn SettlementLedger>,
    sequencer: RelayerSequencer,
    validator: AuthorizationValidator,
    policy: SettlementPolicy,
}

fn chain_error(
    phase: SettlementPhase,
    source: ChainError,
    record: SettlementRecord,
) -> SettlementError {
    SettlementError::Chain {
        phase,
        source,
        record: Box::new(record),
    }
}

fn now_secs() -> u64 {
    u64::try_from(unix_now()).unwrap_or(0)
}

impl<C: ChainClient> SettlementOrchestrator<C> {
    pub fn new(
        chain: Arc<C>,
        ledger: Arc<dyn SettlementLedger>,
        sequencer: RelayerSequencer,
        config: ChainConfig,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            chain,
            ledger,
            sequencer,
            validator: AuthorizationValidator::new(config),
            policy,
        }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn ledger(&self) -> &Arc<dyn SettlementLedger> {
        &self.ledger
    }

    pub fn chain_config(&self) -> &ChainConfig {
        self.validator.config()
    }

    pub fn policy(&self) -> &SettlementPolicy {
        &self.policy
    }

    /// Current record for `(payer, nonce)`.
    pub fn status(&self, payer: Address, nonce: B256) -> Result<SettlementRecord, SettlementError> {
        Ok(self.ledger.get(payer, nonce)?)
    }

    /// Settle one inbound claim.
    ///
    /// A nonce already in the ledger is answered from its record: a
    /// completed settlement is returned as-is, a confirmed payment resumes
    /// into minting, anything else is a replay. New claims are validated
    /// and the payer's balance checked before they touch the ledger, so a
    /// rejected authorization leaves no trace. Once claimed, the settlement
    /// runs on its own task and finishes even if the caller goes away.
    pub async fn process(
        self: &Arc<Self>,
        claim: ClaimRequest,
    ) -> Result<Settlement, SettlementError> {
        let auth = &claim.authorization;

        match self.ledger.get(auth.payer, auth.nonce) {
            Ok(existing) => return self.on_duplicate(existing).await,
            Err(LedgerError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        self.validator
            .validate(auth, self.policy.pay_to, self.policy.price, now_secs())?;
        self.check_payer_funds(auth).await?;
        self.preflight().await?;

        let meta = ClaimMeta {
            recipient: claim.recipient,
            valid_before: auth.valid_before,
        };
        let record = match self.ledger.try_claim(auth.payer, auth.nonce, meta)? {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::AlreadyClaimed(existing) => return self.on_duplicate(existing).await,
        };
        tracing::info!(
            payer = %record.payer,
            nonce = %format!("{:.10}", record.nonce.to_string()),
            recipient = %record.recipient,
            "claim accepted"
        );

        let this = Arc::clone(self);
        let authorization = claim.authorization;
        tokio::spawn(async move { this.settle_claimed(record, authorization).await })
            .await
            .map_err(|e| SettlementError::Internal(format!("settlement task failed: {e}")))?
            .map(Settlement::fresh)
    }

    /// Operator entry point: push a stuck or failed settlement forward.
    ///
    /// Never resubmits a payment. A confirmed payment is minted against, a
    /// submitted transaction is re-checked, everything else is reported as is.
    pub async fn resume(
        self: &Arc<Self>,
        payer: Address,
        nonce: B256,
    ) -> Result<Settlement, SettlementError> {
        let record = self.ledger.get(payer, nonce)?;
        if record.state == SettlementState::MintConfirmed {
            return Ok(Settlement {
                record,
                replayed: true,
            });
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.resume_record(record).await })
            .await
            .map_err(|e| SettlementError::Internal(format!("resume task failed: {e}")))?
            .map(Settlement::fresh)
    }

    async fn resume_record(&self, record: SettlementRecord) -> Result<SettlementRecord, SettlementError> {
        match record.state {
            SettlementState::PaymentConfirmed | SettlementState::MintFailedAfterPayment => {
                self.mint(record).await
            }
            SettlementState::PaymentSubmitted if record.payment_tx_hash.is_some() => {
                let confirmed = self.confirm_payment(record).await?;
                self.mint(confirmed).await
            }
            SettlementState::MintSubmitted if record.mint_tx_hash.is_some() => {
                self.confirm_mint(record).await
            }
            _ => Err(SettlementError::Replay(Box::new(record))),
        }
    }

    async fn on_duplicate(
        self: &Arc<Self>,
        existing: SettlementRecord,
    ) -> Result<Settlement, SettlementError> {
        match existing.state {
            SettlementState::MintConfirmed => Ok(Settlement {
                record: existing,
                replayed: true,
            }),
            SettlementState::PaymentConfirmed => {
                tracing::info!(
                    payer = %existing.payer,
                    "duplicate claim found confirmed payment, resuming mint"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move { this.mint(existing).await })
                    .await
                    .map_err(|e| SettlementError::Internal(format!("mint task failed: {e}")))?
                    .map(Settlement::fresh)
            }
            SettlementState::MintFailedAfterPayment => {
                let reason = existing
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "mint did not complete".to_string());
                Err(SettlementError::PartialSettlement {
                    record: Box::new(existing),
                    reason,
                    replayed: true,
                })
            }
            _ => Err(SettlementError::Replay(Box::new(existing))),
        }
    }

    /// Catch an unfunded payer before claiming: its transfer would only
    /// revert at the relayer's expense. An unreadable balance does not block
    /// the claim; the payment leg still decides.
    async fn check_payer_funds(&self, auth: &PaymentAuthorization) -> Result<(), SettlementError> {
        match self
            .chain
            .token_balance(self.chain_config().asset, auth.payer)
            .await
        {
            Ok(balance) if balance < auth.amount => {
                tracing::warn!(
                    payer = %auth.payer,
                    balance = %balance,
                    required = %auth.amount,
                    "payer balance too low"
                );
                Err(ValidationError::InsufficientFunds(format!(
                    "balance {balance}, required {}",
                    auth.amount
                ))
                .into())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(payer = %auth.payer, error = %e, "could not verify payer balance");
                Ok(())
            }
        }
    }

    /// Refuse new work while the relayer cannot pay for gas.
    async fn preflight(&self) -> Result<(), SettlementError> {
        let balance = self
            .chain
            .relayer_balance()
            .await
            .map_err(|e| SettlementError::RelayerUnavailable(e.to_string()))?;
        if balance < self.policy.min_relayer_balance {
            tracing::error!(
                relayer = %self.chain.relayer(),
                balance = %balance,
                "relayer balance below minimum, refusing claims"
            );
            return Err(SettlementError::RelayerUnavailable(format!(
                "relayer balance {balance} below minimum {}",
                self.policy.min_relayer_balance
            )));
        }
        Ok(())
    }

    async fn settle_claimed(
        &self,
        record: SettlementRecord,
        auth: PaymentAuthorization,
    ) -> Result<SettlementRecord, SettlementError> {
        let paid = self.pay(record, auth).await?;
        self.mint(paid).await
    }

    /// `CLAIMED -> PAYMENT_SUBMITTED -> PAYMENT_CONFIRMED`.
    async fn pay(
        &self,
        record: SettlementRecord,
        auth: PaymentAuthorization,
    ) -> Result<SettlementRecord, SettlementError> {
        let (payer, nonce) = (record.payer, record.nonce);

        let tx = match calls::transfer_with_authorization(self.chain_config().asset, &auth) {
            Ok(tx) => tx,
            Err(reason) => {
                let rejected =
                    self.ledger
                        .advance(payer, nonce, SettlementState::Rejected, Advance::error(&reason))?;
                return Err(chain_error(
                    SettlementPhase::Payment,
                    ChainError::SubmitFailed(reason),
                    rejected,
                ));
            }
        };

        // Recorded before the send: after this point the claim can no longer
        // be abandoned as never-submitted.
        let submitted =
            self.ledger
                .advance(payer, nonce, SettlementState::PaymentSubmitted, Advance::none())?;

        let hash = match self.sequencer.enqueue(move || tx).await {
            Ok(hash) => hash,
            Err(ChainError::SubmitFailed(reason)) => {
                let failed = self.ledger.advance(
                    payer,
                    nonce,
                    SettlementState::PaymentFailed,
                    Advance::error(&reason),
                )?;
                tracing::warn!(payer = %payer, error = %reason, "payment submission failed");
                return Err(chain_error(
                    SettlementPhase::Payment,
                    ChainError::SubmitFailed(reason),
                    failed,
                ));
            }
            Err(ChainError::InsufficientBalance(reason)) => {
                self.ledger.advance(
                    payer,
                    nonce,
                    SettlementState::PaymentFailed,
                    Advance::error(&reason),
                )?;
                tracing::warn!(payer = %payer, error = %reason, "payer balance too low at submission");
                return Err(ValidationError::InsufficientFunds(reason).into());
            }
            // Outcome unknown: leave PAYMENT_SUBMITTED for the sweep.
            Err(e) => return Err(chain_error(SettlementPhase::Payment, e, submitted)),
        };

        let submitted = self.ledger.advance(
            payer,
            nonce,
            SettlementState::PaymentSubmitted,
            Advance::payment_hash(hash),
        )?;
        self.confirm_payment(submitted).await
    }

    /// Wait on the recorded payment transaction.
    async fn confirm_payment(
        &self,
        record: SettlementRecord,
    ) -> Result<SettlementRecord, SettlementError> {
        let Some(hash) = record.payment_tx_hash else {
            return Err(SettlementError::Internal(
                "payment confirmation requested without a transaction hash".to_string(),
            ));
        };
        let (payer, nonce) = (record.payer, record.nonce);

        match self.wait_for(hash).await {
            Ok(Confirmation::Confirmed(receipt)) => {
                let confirmed = self.ledger.advance(
                    payer,
                    nonce,
                    SettlementState::PaymentConfirmed,
                    Advance::none(),
                )?;
                tracing::info!(
                    payer = %payer,
                    tx = %hash,
                    block = ?receipt.block_number,
                    "payment confirmed"
                );
                Ok(confirmed)
            }
            Ok(Confirmation::Reverted(reason)) => {
                // A third party may have executed the same authorization
                // first; the transfer still reached pay_to.
                match self.authorization_used(&record).await {
                    Ok(true) => {
                        tracing::warn!(payer = %payer, tx = %hash, "payment reverted but authorization was executed elsewhere");
                        Ok(self.ledger.advance(
                            payer,
                            nonce,
                            SettlementState::PaymentConfirmed,
                            Advance::none(),
                        )?)
                    }
                    Ok(false) => {
                        let failed = self.ledger.advance(
                            payer,
                            nonce,
                            SettlementState::PaymentFailed,
                            Advance::error(&reason),
                        )?;
                        tracing::warn!(payer = %payer, tx = %hash, error = %reason, "payment reverted");
                        Err(chain_error(
                            SettlementPhase::Payment,
                            ChainError::Reverted(reason),
                            failed,
                        ))
                    }
                    Err(e) => Err(chain_error(SettlementPhase::Payment, e, record)),
                }
            }
            Ok(Confirmation::TimedOut) => {
                tracing::warn!(payer = %payer, tx = %hash, "payment confirmation timed out");
                Err(chain_error(
                    SettlementPhase::Payment,
                    ChainError::TimedOut(hash),
                    record,
                ))
            }
            Err(e) => Err(chain_error(SettlementPhase::Payment, e, record)),
        }
    }

    /// `PAYMENT_CONFIRMED | MINT_FAILED_AFTER_PAYMENT -> MINT_SUBMITTED -> MINT_CONFIRMED`.
    async fn mint(&self, record: SettlementRecord) -> Result<SettlementRecord, SettlementError> {
        let (payer, nonce) = (record.payer, record.nonce);

        // The compare-and-set into MINT_SUBMITTED is what makes the mint
        // exclusive: whoever loses it must not submit.
        let minting = match self.ledger.advance(
            payer,
            nonce,
            SettlementState::MintSubmitted,
            Advance::none(),
        ) {
            Ok(r) => r,
            Err(LedgerError::IllegalTransition { .. }) => {
                let current = self.ledger.get(payer, nonce)?;
                return Err(SettlementError::Replay(Box::new(current)));
            }
            Err(e) => return Err(e.into()),
        };

        let tx = calls::mint(self.policy.collection, minting.recipient, self.policy.mint_amount);
        let hash = match self.sequencer.enqueue(move || tx).await {
            Ok(hash) => hash,
            Err(ChainError::SubmitFailed(reason) | ChainError::InsufficientBalance(reason)) => {
                return Err(self.mint_failed(&minting, reason))
            }
            // Outcome unknown: leave MINT_SUBMITTED for the sweep.
            Err(e) => return Err(chain_error(SettlementPhase::Mint, e, minting)),
        };

        let minting = self.ledger.advance(
            payer,
            nonce,
            SettlementState::MintSubmitted,
            Advance::mint_hash(hash),
        )?;
        self.confirm_mint(minting).await
    }

    async fn confirm_mint(
        &self,
        record: SettlementRecord,
    ) -> Result<SettlementRecord, SettlementError> {
        let Some(hash) = record.mint_tx_hash else {
            return Err(SettlementError::Internal(
                "mint confirmation requested without a transaction hash".to_string(),
            ));
        };

        match self.wait_for(hash).await {
            Ok(Confirmation::Confirmed(receipt)) => {
                if receipt.minted_token_ids.is_empty() {
                    tracing::warn!(
                        payer = %record.payer,
                        recipient = %record.recipient,
                        tx = %hash,
                        collection = %self.policy.collection,
                        "mint confirmed but no Transfer from the zero address was found, token ids unknown"
                    );
                }
                let done = self.ledger.advance(
                    record.payer,
                    record.nonce,
                    SettlementState::MintConfirmed,
                    Advance::minted(receipt.minted_token_ids),
                )?;
                tracing::info!(
                    payer = %done.payer,
                    recipient = %done.recipient,
                    tx = %hash,
                    token_ids = ?done.token_ids,
                    "mint confirmed"
                );
                Ok(done)
            }
            Ok(Confirmation::Reverted(reason)) => Err(self.mint_failed(&record, reason)),
            Ok(Confirmation::TimedOut) => {
                tracing::warn!(payer = %record.payer, tx = %hash, "mint confirmation timed out");
                Err(chain_error(SettlementPhase::Mint, ChainError::TimedOut(hash), record))
            }
            Err(e) => Err(chain_error(SettlementPhase::Mint, e, record)),
        }
    }

    /// Record a mint failure after a confirmed payment.
    fn mint_failed(&self, record: &SettlementRecord, reason: String) -> SettlementError {
        tracing::error!(
            payer = %record.payer,
            recipient = %record.recipient,
            payment_tx = ?record.payment_tx_hash,
            error = %reason,
            "mint failed after payment, manual reconciliation required"
        );
        match self.ledger.advance(
            record.payer,
            record.nonce,
            SettlementState::MintFailedAfterPayment,
            Advance::error(&reason),
        ) {
            Ok(failed) => SettlementError::PartialSettlement {
                record: Box::new(failed),
                reason,
                replayed: false,
            },
            Err(e) => e.into(),
        }
    }

    /// Poll for confirmation up to the configured number of horizons.
    async fn wait_for(&self, hash: TxHash) -> Result<Confirmation, ChainError> {
        for attempt in 1..=self.policy.confirmation_attempts.max(1) {
            match self
                .chain
                .await_confirmation(hash, self.policy.confirmation_timeout)
                .await?
            {
                Confirmation::TimedOut => {
                    tracing::debug!(tx = %hash, attempt = attempt, "still waiting for confirmation");
                }
                other => return Ok(other),
            }
        }
        Ok(Confirmation::TimedOut)
    }

    async fn authorization_used(&self, record: &SettlementRecord) -> Result<bool, ChainError> {
        self.chain
            .authorization_used(self.chain_config().asset, record.payer, record.nonce)
            .await
    }

    /// Reconcile in-progress records that have not moved for `stale_after`,
    /// then purge old settled records.
    pub async fn recover_stale(&self) -> Result<SweepReport, SettlementError> {
        let now = unix_now();
        let cutoff = now.saturating_sub(i64::try_from(self.policy.stale_after.as_secs()).unwrap_or(i64::MAX));
        let mut report = SweepReport::default();

        let mut candidates = self.ledger.list_stale(cutoff, self.policy.sweep_batch)?;
        if self.policy.auto_resume_failed_mints {
            candidates.extend(
                self.ledger
                    .list_by_state(SettlementState::MintFailedAfterPayment, self.policy.sweep_batch)?,
            );
        }

        for record in candidates {
            report.examined += 1;
            let before = record.state;
            let (payer, nonce) = (record.payer, record.nonce);

            let after = match self.recover_one(record, now).await {
                Ok(r) => r.state,
                Err(SettlementError::PartialSettlement { .. }) => SettlementState::MintFailedAfterPayment,
                Err(SettlementError::Chain { record, .. }) => record.state,
                Err(SettlementError::Replay(record)) => record.state,
                Err(e) => {
                    tracing::warn!(payer = %payer, nonce = %nonce, error = %e, "recovery failed");
                    before
                }
            };

            if after == before {
                report.pending += 1;
            } else if matches!(
                after,
                SettlementState::PaymentFailed
                    | SettlementState::Rejected
                    | SettlementState::MintFailedAfterPayment
            ) {
                report.failed += 1;
            } else {
                report.advanced += 1;
            }
        }

        let retention = i64::try_from(self.policy.retention.as_secs()).unwrap_or(i64::MAX);
        report.purged = self.ledger.purge_settled_before(now.saturating_sub(retention))?;

        if report.examined > 0 || report.purged > 0 {
            tracing::info!(
                examined = report.examined,
                advanced = report.advanced,
                pending = report.pending,
                failed = report.failed,
                purged = report.purged,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover_one(
        &self,
        record: SettlementRecord,
        now: i64,
    ) -> Result<SettlementRecord, SettlementError> {
        let (payer, nonce) = (record.payer, record.nonce);
        match record.state {
            SettlementState::Claimed => Ok(self.ledger.advance(
                payer,
                nonce,
                SettlementState::Rejected,
                Advance::error("abandoned before payment submission"),
            )?),
            SettlementState::PaymentSubmitted => {
                let record = match record.payment_tx_hash {
                    Some(hash) => match self
                        .chain
                        .await_confirmation(hash, self.policy.confirmation_timeout)
                        .await
                    {
                        Ok(Confirmation::TimedOut) | Err(_) => record,
                        Ok(_) => {
                            let paid = self.confirm_payment(record).await?;
                            return self.mint(paid).await;
                        }
                    },
                    None => record,
                };
                self.settle_unknown_payment(record, now).await
            }
            SettlementState::PaymentConfirmed | SettlementState::MintFailedAfterPayment => {
                self.mint(record).await
            }
            SettlementState::MintSubmitted => match record.mint_tx_hash {
                Some(hash) => match self
                    .chain
                    .await_confirmation(hash, self.policy.confirmation_timeout)
                    .await
                {
                    Ok(Confirmation::TimedOut) | Err(_) => Ok(record),
                    Ok(_) => self.confirm_mint(record).await,
                },
                None => Err(self.mint_failed(&record, "mint submission outcome unknown".to_string())),
            },
            _ => Ok(record),
        }
    }

    /// A payment whose transaction cannot be found is decided by the token:
    /// once `validBefore` has passed the authorization can never execute, so
    /// `authorizationState` is final.
    async fn settle_unknown_payment(
        &self,
        record: SettlementRecord,
        now: i64,
    ) -> Result<SettlementRecord, SettlementError> {
        if u64::try_from(now).unwrap_or(0) <= record.valid_before {
            return Ok(record);
        }
        let (payer, nonce) = (record.payer, record.nonce);
        match self.authorization_used(&record).await {
            Ok(true) => {
                let paid = self.ledger.advance(
                    payer,
                    nonce,
                    SettlementState::PaymentConfirmed,
                    Advance::none(),
                )?;
                self.mint(paid).await
            }
            Ok(false) => Ok(self.ledger.advance(
                payer,
                nonce,
                SettlementState::PaymentFailed,
                Advance::error("authorization expired without executing"),
            )?),
            Err(e) => Err(chain_error(SettlementPhase::Payment, e, record)),
        }
    }

    /// Start a background task that runs [`Self::recover_stale`] on an interval.
    pub fn start_recovery_loop(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = this.recover_stale().await {
                    tracing::error!(error = %e, "recovery sweep failed");
                }
            }
        })
    }
}
