use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DecodeError;
use crate::ChainConfig;

/// EIP-3009 authorization fields as they arrive on the wire.
///
/// Accepts both the x402 names (`from`, `to`, `value`) and the descriptive
/// ones (`payer`, `payee`, `amount`). Timestamps may be strings or numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationData {
    #[serde(alias = "payer")]
    pub from: Address,
    #[serde(alias = "payee")]
    pub to: Address,
    #[serde(alias = "amount", deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_after: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_before: String,
    pub nonce: FixedBytes<32>,
}

/// The `payload` object of an exact-scheme payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub authorization: AuthorizationData,
    pub signature: String,
}

/// Wire-format payment payload (sent in the X-PAYMENT header, base64-encoded JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub payload: ExactPayload,
}

impl PaymentPayload {
    /// Decode the X-PAYMENT header value.
    pub fn from_header(header_value: &str) -> Result<Self, DecodeError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(header_value.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))
    }

    /// Encode as an X-PAYMENT header value.
    pub fn to_header(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

/// A parsed, immutable EIP-3009 transfer authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAuthorization {
    pub payer: Address,
    pub payee: Address,
    pub amount: U256,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: FixedBytes<32>,
    pub signature: Bytes,
}

impl TryFrom<&AuthorizationData> for PaymentAuthorization {
    type Error = DecodeError;

    fn try_from(a: &AuthorizationData) -> Result<Self, Self::Error> {
        Ok(Self {
            payer: a.from,
            payee: a.to,
            amount: a.value.parse::<U256>().map_err(|e| DecodeError::InvalidField {
                field: "value",
                reason: e.to_string(),
            })?,
            valid_after: parse_timestamp("validAfter", &a.valid_after)?,
            valid_before: parse_timestamp("validBefore", &a.valid_before)?,
            nonce: a.nonce,
            signature: Bytes::new(),
        })
    }
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<u64, DecodeError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| DecodeError::InvalidField {
            field,
            reason: e.to_string(),
        })
}

/// One inbound claim: the authorization plus who receives the mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub authorization: PaymentAuthorization,
    pub recipient: Address,
}

impl ClaimRequest {
    /// The mint goes to the payer.
    pub fn new(authorization: PaymentAuthorization) -> Self {
        let recipient = authorization.payer;
        Self {
            authorization,
            recipient,
        }
    }

    /// Build a claim from a decoded payload, checking protocol version,
    /// scheme and network against this deployment.
    pub fn from_payload(payload: &PaymentPayload, config: &ChainConfig) -> Result<Self, DecodeError> {
        if payload.x402_version != crate::X402_VERSION {
            return Err(DecodeError::UnsupportedVersion(payload.x402_version));
        }
        if let Some(scheme) = &payload.scheme {
            if scheme != &config.scheme_name {
                return Err(DecodeError::SchemeMismatch {
                    expected: config.scheme_name.clone(),
                    got: scheme.clone(),
                });
            }
        }
        if let Some(network) = &payload.network {
            if network != &config.network {
                return Err(DecodeError::NetworkMismatch {
                    expected: config.network.clone(),
                    got: network.clone(),
                });
            }
        }

        let raw_sig = &payload.payload.signature;
        let signature = alloy::hex::decode(raw_sig.strip_prefix("0x").unwrap_or(raw_sig))
            .map_err(|e| DecodeError::InvalidField {
                field: "signature",
                reason: e.to_string(),
            })?;

        let mut authorization = PaymentAuthorization::try_from(&payload.payload.authorization)?;
        authorization.signature = Bytes::from(signature);
        Ok(Self::new(authorization))
    }
}

/// A single entry in the `accepts` array of a 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: Address,
    pub max_timeout_seconds: u64,
    pub asset: Address,
    /// Request and response shape of the resource, for x402 discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The 402 response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u32,
    pub error: String,
    pub accepts: Vec<PaymentRequirements>,
}

/// Settlement summary returned in the X-PAYMENT-RESPONSE header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    /// Payment transaction hash, if the payment leg confirmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: String,
}

impl SettleResponse {
    pub fn to_header(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base",
            "payload": {
                "signature": format!("0x{}", "11".repeat(65)),
                "authorization": {
                    "from": "0x00000000000000000000000000000000000000aa",
                    "to": "0x2e6e06f71786955474d35293b09a3527debbbfce",
                    "value": "2000000",
                    "validAfter": "1700000000",
                    "validBefore": 1700000600u64,
                    "nonce": format!("0x{}", "42".repeat(32)),
                }
            }
        })
    }

    #[test]
    fn test_decode_header_and_build_claim() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&sample_json()).unwrap());
        let payload = PaymentPayload::from_header(&encoded).unwrap();
        let claim = ClaimRequest::from_payload(&payload, &ChainConfig::default()).unwrap();

        let auth = &claim.authorization;
        assert_eq!(auth.amount, U256::from(2_000_000u64));
        assert_eq!(auth.valid_after, 1_700_000_000);
        assert_eq!(auth.valid_before, 1_700_000_600);
        assert_eq!(auth.signature.len(), 65);
        assert_eq!(claim.recipient, auth.payer);
    }

    #[test]
    fn test_descriptive_field_aliases() {
        let json = serde_json::json!({
            "payer": "0x00000000000000000000000000000000000000aa",
            "payee": "0x00000000000000000000000000000000000000bb",
            "amount": 5,
            "validAfter": 0,
            "validBefore": 10,
            "nonce": format!("0x{}", "00".repeat(32)),
        });
        let data: AuthorizationData = serde_json::from_value(json).unwrap();
        let auth = PaymentAuthorization::try_from(&data).unwrap();
        assert_eq!(auth.amount, U256::from(5u64));
        assert_eq!(auth.valid_before, 10);
    }

    #[test]
    fn test_decode_invalid_base64() {
        let err = PaymentPayload::from_header("not-valid-base64!!!").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn test_decode_invalid_json() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"this is not json");
        let err = PaymentPayload::from_header(&encoded).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_rejects_wrong_version_and_network() {
        let mut json = sample_json();
        json["x402Version"] = serde_json::json!(2);
        let payload: PaymentPayload = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(
            ClaimRequest::from_payload(&payload, &ChainConfig::default()).unwrap_err(),
            DecodeError::UnsupportedVersion(2)
        );

        json["x402Version"] = serde_json::json!(1);
        json["network"] = serde_json::json!("base-sepolia");
        let payload: PaymentPayload = serde_json::from_value(json).unwrap();
        assert!(matches!(
            ClaimRequest::from_payload(&payload, &ChainConfig::default()),
            Err(DecodeError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_non_numeric_amount() {
        let mut json = sample_json();
        json["payload"]["authorization"]["value"] = serde_json::json!("two dollars");
        let payload: PaymentPayload = serde_json::from_value(json).unwrap();
        assert!(matches!(
            ClaimRequest::from_payload(&payload, &ChainConfig::default()),
            Err(DecodeError::InvalidField { field: "value", .. })
        ));
    }
}
