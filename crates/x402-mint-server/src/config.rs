//! Server configuration, read from the environment.

use std::fmt;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use thiserror::Error;
use x402_mint::price::{format_price, parse_price};
use x402_mint::{ChainConfig, PriceError};

const DEFAULT_PRICE: &str = "$2.00";
const DEFAULT_LEDGER_PATH: &str = "./x402-mint.db";
const DEFAULT_PORT: u16 = 4030;
const DEFAULT_DESCRIPTION: &str = "Mint one collectible";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error(transparent)]
    Price(#[from] PriceError),
}

fn invalid(name: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// Everything the binary needs to start.
#[derive(Clone)]
pub struct ServerConfig {
    pub relayer_private_key: String,
    pub chain: ChainConfig,
    pub payment_recipient: Address,
    pub nft_contract: Address,
    /// Price in stablecoin base units.
    pub mint_price: U256,
    pub mint_amount: u64,
    pub ledger_db_path: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub rate_limit_rpm: u64,
    pub metrics_token: Option<Vec<u8>>,
    pub public_metrics: bool,
    /// Bearer token for `/admin/*`. Admin routes are disabled without it.
    pub admin_token: Option<Vec<u8>>,
    pub telemetry_urls: Vec<String>,
    pub telemetry_secret: Option<Vec<u8>>,
    pub confirmation_timeout: Duration,
    pub confirmation_attempts: u32,
    /// Advertised in the 402 challenge.
    pub max_timeout_seconds: u64,
    pub auto_resume_mints: bool,
    pub sweep_interval: Duration,
    pub resource_description: String,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<Vec<u8>>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("ServerConfig")
            .field("relayer_private_key", &"<redacted>")
            .field("chain", &self.chain)
            .field("payment_recipient", &self.payment_recipient)
            .field("nft_contract", &self.nft_contract)
            .field("mint_price", &self.mint_price)
            .field("mint_amount", &self.mint_amount)
            .field("ledger_db_path", &self.ledger_db_path)
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("metrics_token", &redact(&self.metrics_token))
            .field("public_metrics", &self.public_metrics)
            .field("admin_token", &redact(&self.admin_token))
            .field("telemetry_urls", &self.telemetry_urls.len())
            .field("telemetry_secret", &redact(&self.telemetry_secret))
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("confirmation_attempts", &self.confirmation_attempts)
            .field("max_timeout_seconds", &self.max_timeout_seconds)
            .field("auto_resume_mints", &self.auto_resume_mints)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Read from the process environment. Call `dotenvy::dotenv()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through an arbitrary lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));
        let address = |name: &'static str, raw: String| -> Result<Address, ConfigError> {
            raw.parse::<Address>().map_err(|e| invalid(name, e))
        };
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match var(name) {
                Some(raw) => raw.parse::<u64>().map_err(|e| invalid(name, e)),
                None => Ok(default),
            }
        };
        let flag = |name: &str| {
            var(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };
        let list = |name: &str| -> Vec<String> {
            var(name)
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        let secret = |name: &str| var(name).map(String::into_bytes);

        let relayer_private_key = required("RELAYER_PRIVATE_KEY")?;

        let mut chain = ChainConfig::default();
        if let Some(rpc_url) = var("PROVIDER_URL").or_else(|| var("RPC_URL")) {
            url::Url::parse(&rpc_url).map_err(|e| invalid("PROVIDER_URL", e))?;
            chain.rpc_url = rpc_url;
        }
        if let Some(usdc) = var("USDC_ADDRESS") {
            chain.asset = address("USDC_ADDRESS", usdc)?;
        }

        let payment_recipient = address("PAYMENT_RECIPIENT", required("PAYMENT_RECIPIENT")?)?;
        let nft_contract = address("NFT_CONTRACT_ADDRESS", required("NFT_CONTRACT_ADDRESS")?)?;

        let price = var("MINT_PRICE")
            .or_else(|| var("MINT_PRICE_USD"))
            .unwrap_or_else(|| DEFAULT_PRICE.to_string());
        let mint_price = parse_price(&price, chain.token_decimals)?;
        if mint_price.is_zero() {
            return Err(invalid("MINT_PRICE", "price must be greater than zero"));
        }

        let mint_amount = number("MINT_AMOUNT", 1)?;
        if mint_amount == 0 {
            return Err(invalid("MINT_AMOUNT", "must be at least 1"));
        }

        let port = match var("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| invalid("PORT", e))?,
            None => DEFAULT_PORT,
        };

        let confirmation_attempts = u32::try_from(number("CONFIRMATION_ATTEMPTS", 3)?)
            .map_err(|e| invalid("CONFIRMATION_ATTEMPTS", e))?;

        Ok(Self {
            relayer_private_key,
            chain,
            payment_recipient,
            nft_contract,
            mint_price,
            mint_amount,
            ledger_db_path: var("LEDGER_DB_PATH").unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string()),
            port,
            allowed_origins: list("ALLOWED_ORIGINS"),
            rate_limit_rpm: number("RATE_LIMIT_RPM", 60)?.max(1),
            metrics_token: secret("METRICS_TOKEN"),
            public_metrics: flag("X402_PUBLIC_METRICS"),
            admin_token: secret("ADMIN_TOKEN"),
            telemetry_urls: list("TELEMETRY_URLS"),
            telemetry_secret: secret("TELEMETRY_SECRET"),
            confirmation_timeout: Duration::from_secs(number("CONFIRMATION_TIMEOUT_SECS", 60)?.max(1)),
            confirmation_attempts: confirmation_attempts.max(1),
            max_timeout_seconds: number("MAX_TIMEOUT_SECONDS", 300)?,
            auto_resume_mints: flag("AUTO_RESUME_MINTS"),
            sweep_interval: Duration::from_secs(number("SWEEP_INTERVAL_SECS", 60)?.max(1)),
            resource_description: var("RESOURCE_DESCRIPTION")
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        })
    }

    /// Price as shown to humans, e.g. `"2.00"`.
    pub fn price_display(&self) -> String {
        format_price(self.mint_price, self.chain.token_decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("RELAYER_PRIVATE_KEY", "0x0101010101010101010101010101010101010101010101010101010101010101"),
            ("PAYMENT_RECIPIENT", "0x2e6e06f71786955474d35293b09a3527debbbfce"),
            ("NFT_CONTRACT_ADDRESS", "0x00000000000000000000000000000000000000aa"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(env(&minimal())).unwrap();
        assert_eq!(config.mint_price, U256::from(2_000_000u64));
        assert_eq!(config.price_display(), "2.00");
        assert_eq!(config.mint_amount, 1);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.chain, ChainConfig::default());
        assert_eq!(config.confirmation_attempts, 3);
        assert!(config.admin_token.is_none());
        assert!(!config.public_metrics);
    }

    #[test]
    fn test_missing_key_is_reported_by_name() {
        let err = ServerConfig::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RELAYER_PRIVATE_KEY")));
    }

    #[test]
    fn test_overrides() {
        let mut pairs = minimal();
        pairs.extend([
            ("MINT_PRICE_USD", "0.50"),
            ("RPC_URL", "https://sepolia.base.org"),
            ("USDC_ADDRESS", "0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("AUTO_RESUME_MINTS", "1"),
            ("PORT", "8080"),
        ]);
        let config = ServerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.mint_price, U256::from(500_000u64));
        assert_eq!(config.chain.rpc_url, "https://sepolia.base.org");
        assert_ne!(config.chain.asset, ChainConfig::default().asset);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.auto_resume_mints);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_mint_price_takes_precedence() {
        let mut pairs = minimal();
        pairs.extend([("MINT_PRICE", "$3"), ("MINT_PRICE_USD", "1")]);
        let config = ServerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.mint_price, U256::from(3_000_000u64));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut pairs = minimal();
        pairs.push(("PAYMENT_RECIPIENT", "not-an-address"));
        // later entries win in the map
        let err = ServerConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PAYMENT_RECIPIENT", .. }));

        let mut pairs = minimal();
        pairs.push(("MINT_PRICE", "$0"));
        assert!(ServerConfig::from_lookup(env(&pairs)).is_err());

        let mut pairs = minimal();
        pairs.push(("MINT_PRICE", "free"));
        assert!(matches!(
            ServerConfig::from_lookup(env(&pairs)).unwrap_err(),
            ConfigError::Price(_)
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut pairs = minimal();
        pairs.push(("ADMIN_TOKEN", "super-secret-admin"));
        let config = ServerConfig::from_lookup(env(&pairs)).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("0101010101"));
        assert!(!debug.contains("super-secret-admin"));
        assert!(debug.contains("<redacted>"));
    }
}
