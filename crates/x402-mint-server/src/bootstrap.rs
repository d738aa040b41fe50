//! Wire the settlement engine together from a [`ServerConfig`].

use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use thiserror::Error;
use x402_mint::{
    AlloyChainClient, ChainClient, LedgerError, RelayerSequencer, SequencerPolicy,
    SettlementLedger, SettlementOrchestrator, SettlementPolicy, SqliteLedger,
};

use crate::config::ServerConfig;
use crate::metered::MeteredChain;
use crate::state::AppState;
use crate::telemetry::{self, Telemetry};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid RELAYER_PRIVATE_KEY")]
    InvalidKey,

    #[error("invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    /// Never fall back to an in-memory ledger: claims would be forgotten on
    /// restart and could be replayed.
    #[error("failed to open settlement ledger at {path}: {source}")]
    Ledger {
        path: String,
        #[source]
        source: LedgerError,
    },

    #[error("invalid telemetry configuration: {0}")]
    Telemetry(String),
}

pub fn settlement_policy(config: &ServerConfig) -> SettlementPolicy {
    let mut policy = SettlementPolicy::new(
        config.payment_recipient,
        config.mint_price,
        config.nft_contract,
    );
    policy.mint_amount = config.mint_amount;
    policy.confirmation_timeout = config.confirmation_timeout;
    policy.confirmation_attempts = config.confirmation_attempts;
    policy.auto_resume_failed_mints = config.auto_resume_mints;
    policy
}

/// Open the durable ledger. Never falls back to an in-memory one.
pub fn open_ledger(config: &ServerConfig) -> Result<Arc<dyn SettlementLedger>, BootstrapError> {
    match SqliteLedger::open(&config.ledger_db_path) {
        Ok(ledger) => {
            tracing::info!(path = %config.ledger_db_path, "settlement ledger: SQLite");
            Ok(Arc::new(ledger))
        }
        Err(source) => Err(BootstrapError::Ledger {
            path: config.ledger_db_path.clone(),
            source,
        }),
    }
}

/// Build the shared [`AppState`] against the configured RPC. Must run
/// inside a tokio runtime: the relayer sequencer's worker is spawned here.
///
/// Does not start the recovery sweep; the caller decides when.
pub fn build_state(config: &ServerConfig) -> Result<Arc<AppState>, BootstrapError> {
    let signer: PrivateKeySigner = config
        .relayer_private_key
        .parse()
        .map_err(|_| BootstrapError::InvalidKey)?;
    let relayer = signer.address();

    let rpc_url = config
        .chain
        .rpc_url
        .parse()
        .map_err(|e: url::ParseError| BootstrapError::InvalidRpcUrl(e.to_string()))?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(rpc_url);
    let chain = Arc::new(MeteredChain::new(AlloyChainClient::new(provider, relayer)));

    assemble_state(config, chain, open_ledger(config)?)
}

/// Wire a chain client and ledger into an [`AppState`].
pub fn assemble_state<C: ChainClient>(
    config: &ServerConfig,
    chain: Arc<C>,
    ledger: Arc<dyn SettlementLedger>,
) -> Result<Arc<AppState<C>>, BootstrapError> {
    if !config.telemetry_urls.is_empty() {
        telemetry::validate_urls(&config.telemetry_urls).map_err(BootstrapError::Telemetry)?;
        tracing::info!("Telemetry URLs configured: {}", config.telemetry_urls.len());
        if config.telemetry_secret.is_none() {
            tracing::warn!("TELEMETRY_SECRET not set, telemetry will be sent unsigned");
        }
    }

    let relayer = chain.relayer();
    let sequencer = RelayerSequencer::spawn(chain.clone(), SequencerPolicy::default());
    let orchestrator = Arc::new(SettlementOrchestrator::new(
        chain,
        ledger,
        sequencer,
        config.chain.clone(),
        settlement_policy(config),
    ));

    tracing::info!(relayer = %relayer, "relayer ready");

    Ok(Arc::new(AppState {
        orchestrator,
        chain_config: config.chain.clone(),
        nft_contract: config.nft_contract,
        max_timeout_seconds: config.max_timeout_seconds,
        resource_description: config.resource_description.clone(),
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
        admin_token: config.admin_token.clone(),
        telemetry: Telemetry::new(
            config.telemetry_urls.clone(),
            config.telemetry_secret.clone(),
        ),
    }))
}
