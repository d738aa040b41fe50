use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};
use x402_mint::{AlloyChainClient, ChainClient, ChainConfig, SettlementOrchestrator};

use crate::metered::MeteredChain;
use crate::telemetry::Telemetry;

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

pub type RelayerChain = MeteredChain<AlloyChainClient<WalletProvider>>;

/// Shared application state for the mint server.
pub struct AppState<C: ChainClient = RelayerChain> {
    pub orchestrator: Arc<SettlementOrchestrator<C>>,
    pub chain_config: ChainConfig,
    pub nft_contract: Address,
    pub max_timeout_seconds: u64,
    pub resource_description: String,
    /// Bearer token for /metrics.
    pub metrics_token: Option<Vec<u8>>,
    /// Serve /metrics without a token. Off unless explicitly enabled.
    pub public_metrics: bool,
    pub admin_token: Option<Vec<u8>>,
    pub telemetry: Telemetry,
}
