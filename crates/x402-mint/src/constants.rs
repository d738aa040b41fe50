use alloy::primitives::{address, Address};

/// x402 protocol version spoken on the wire.
pub const X402_VERSION: u32 = 1;

/// x402 scheme name for EIP-3009 exact-amount payments.
pub const SCHEME_NAME: &str = "exact";

/// Base mainnet chain ID.
pub const BASE_CHAIN_ID: u64 = 8453;

/// x402 network name for Base mainnet.
pub const BASE_NETWORK: &str = "base";

/// Native USDC on Base.
pub const BASE_USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

/// USDC has 6 decimal places.
pub const TOKEN_DECIMALS: u32 = 6;

/// Default public RPC endpoint for Base.
pub const RPC_URL: &str = "https://mainnet.base.org";

/// Block explorer base URL.
pub const EXPLORER_BASE: &str = "https://basescan.org";

/// Header carrying the base64-encoded payment payload.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Header carrying the base64-encoded settlement summary on success.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Runtime chain configuration. One chain and one stablecoin per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network: String,
    pub scheme_name: String,
    /// Stablecoin contract; also the EIP-712 verifying contract.
    pub asset: Address,
    pub token_decimals: u32,
    pub rpc_url: String,
    pub explorer_base: String,
    /// EIP-712 domain name of the token (`name()` on the contract).
    pub eip712_domain_name: String,
    /// EIP-712 domain version of the token (`version()` on the contract).
    pub eip712_domain_version: String,
}

impl Default for ChainConfig {
    /// Defaults to USDC on Base mainnet.
    fn default() -> Self {
        Self {
            chain_id: BASE_CHAIN_ID,
            network: BASE_NETWORK.to_string(),
            scheme_name: SCHEME_NAME.to_string(),
            asset: BASE_USDC,
            token_decimals: TOKEN_DECIMALS,
            rpc_url: RPC_URL.to_string(),
            explorer_base: EXPLORER_BASE.to_string(),
            eip712_domain_name: "USD Coin".to_string(),
            eip712_domain_version: "2".to_string(),
        }
    }
}

impl ChainConfig {
    /// Explorer link for a transaction hash.
    pub fn tx_url(&self, tx_hash: &alloy::primitives::TxHash) -> String {
        format!("{}/tx/{tx_hash:#x}", self.explorer_base)
    }
}
