use serde::Serialize;
use x402_mint::hmac::{sign_body, SIGNATURE_HEADER};
use x402_mint::SettlementRecord;

use crate::metrics::TELEMETRY_DELIVERIES;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub event: String,
    pub payer: String,
    pub nonce: String,
    pub recipient: String,
    pub state: String,
    pub payment_tx_hash: Option<String>,
    pub mint_tx_hash: Option<String>,
    pub token_ids: Vec<String>,
    pub network: String,
    pub timestamp: i64,
}

impl SettlementEvent {
    pub fn from_record(event: &str, record: &SettlementRecord, network: &str) -> Self {
        Self {
            event: event.to_string(),
            payer: format!("{:#x}", record.payer),
            nonce: format!("{:#x}", record.nonce),
            recipient: format!("{:#x}", record.recipient),
            state: record.state.to_string(),
            payment_tx_hash: record.payment_tx_hash.map(|h| format!("{h:#x}")),
            mint_tx_hash: record.mint_tx_hash.map(|h| format!("{h:#x}")),
            token_ids: record.token_ids.clone(),
            network: network.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Reject unparsable telemetry URLs; warn on cleartext ones. Called at startup.
pub fn validate_urls(urls: &[String]) -> Result<(), String> {
    for raw in urls {
        let parsed = url::Url::parse(raw).map_err(|e| format!("invalid telemetry URL '{raw}': {e}"))?;
        match parsed.scheme() {
            "https" => {}
            "http" => tracing::warn!(
                url = %raw,
                "telemetry URL does not use HTTPS, payloads will be sent in cleartext"
            ),
            other => return Err(format!("unsupported telemetry URL scheme '{other}' in '{raw}'")),
        }
    }
    Ok(())
}

/// Outbound settlement notifications.
#[derive(Clone)]
pub struct Telemetry {
    client: reqwest::Client,
    urls: Vec<String>,
    secret: Option<Vec<u8>>,
}

impl Telemetry {
    pub fn new(urls: Vec<String>, secret: Option<Vec<u8>>) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            client,
            urls,
            secret,
        }
    }

    /// Fire-and-forget POST to each URL. If a secret is configured, the body
    /// is signed in the `X-Signature` header.
    pub fn emit(&self, event: SettlementEvent) {
        if self.urls.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(&event) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize telemetry event");
                return;
            }
        };
        let signature = self.secret.as_deref().map(|secret| sign_body(secret, &body));

        for url in &self.urls {
            let client = self.client.clone();
            let url = url.clone();
            let body = body.clone();
            let signature = signature.clone();

            tokio::spawn(async move {
                let mut req = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .timeout(std::time::Duration::from_secs(5));
                if let Some(ref sig) = signature {
                    req = req.header(SIGNATURE_HEADER, sig.as_str());
                }

                match req.body(body).send().await {
                    Ok(resp) => {
                        TELEMETRY_DELIVERIES.with_label_values(&["delivered"]).inc();
                        tracing::debug!(url = %url, status = %resp.status(), "telemetry delivered")
                    }
                    Err(e) => {
                        TELEMETRY_DELIVERIES.with_label_values(&["failed"]).inc();
                        tracing::warn!(url = %url, error = %e, "telemetry delivery failed")
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256};
    use x402_mint::{ClaimMeta, SettlementRecord};

    #[test]
    fn test_validate_urls() {
        assert!(validate_urls(&["https://hooks.example/x402".to_string()]).is_ok());
        assert!(validate_urls(&["http://localhost:9000".to_string()]).is_ok());
        assert!(validate_urls(&["ftp://hooks.example".to_string()]).is_err());
        assert!(validate_urls(&["not a url".to_string()]).is_err());
    }

    #[test]
    fn test_event_from_record() {
        let meta = ClaimMeta {
            recipient: Address::repeat_byte(0x01),
            valid_before: 10,
        };
        let record = SettlementRecord::claimed(Address::repeat_byte(0x01), B256::repeat_byte(0x02), meta, 5);
        let event = SettlementEvent::from_record("claim.accepted", &record, "base");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "CLAIMED");
        assert_eq!(json["network"], "base");
        assert!(json["paymentTxHash"].is_null());
        assert_eq!(json["nonce"], format!("0x{}", "02".repeat(32)));
    }
}
