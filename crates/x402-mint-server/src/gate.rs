//! The 402 challenge.

use actix_web::{HttpRequest, HttpResponse};
use x402_mint::{ChainClient, PaymentRequiredBody, PaymentRequirements, ValidationError, X402_VERSION};

use crate::state::AppState;

/// The resource URL as the caller addressed it.
pub fn resource_url(req: &HttpRequest) -> String {
    let conn = req.connection_info();
    format!("{}://{}{}", conn.scheme(), conn.host(), req.uri().path())
}

pub fn payment_requirements<C: ChainClient>(
    req: &HttpRequest,
    state: &AppState<C>,
) -> PaymentRequirements {
    let chain = &state.chain_config;
    let policy = state.orchestrator.policy();
    PaymentRequirements {
        scheme: chain.scheme_name.clone(),
        network: chain.network.clone(),
        max_amount_required: policy.price.to_string(),
        resource: resource_url(req),
        description: state.resource_description.clone(),
        mime_type: "application/json".to_string(),
        pay_to: policy.pay_to,
        max_timeout_seconds: state.max_timeout_seconds,
        asset: chain.asset,
        output_schema: Some(output_schema()),
        extra: Some(serde_json::json!({
            "name": chain.eip712_domain_name,
            "version": chain.eip712_domain_version,
            "contractAddress": format!("{:#x}", state.nft_contract),
        })),
    }
}

/// What `POST /mint` takes in its `X-PAYMENT` header and returns on success.
fn output_schema() -> serde_json::Value {
    let string = serde_json::json!({ "type": "string" });
    serde_json::json!({
        "input": {
            "type": "http",
            "method": "POST",
            "headerFields": {
                "X-PAYMENT": {
                    "type": "string",
                    "description": "base64 JSON: x402Version, scheme, network, payload { signature, authorization }",
                    "required": true,
                }
            },
            "properties": {
                "x402Version": { "type": "number" },
                "scheme": string,
                "network": string,
                "payload": {
                    "type": "object",
                    "properties": {
                        "signature": string,
                        "authorization": {
                            "type": "object",
                            "properties": {
                                "from": string,
                                "to": string,
                                "value": string,
                                "validAfter": string,
                                "validBefore": string,
                                "nonce": string,
                            }
                        }
                    }
                }
            }
        },
        "output": {
            "success": "boolean",
            "data": {
                "type": "object",
                "properties": {
                    "recipient": string,
                    "paymentTxHash": string,
                    "mintTxHash": string,
                    "tokenIds": { "type": "array", "items": string },
                    "nftContract": string,
                }
            }
        }
    })
}

pub fn payment_required_body<C: ChainClient>(
    req: &HttpRequest,
    state: &AppState<C>,
    error: impl Into<String>,
) -> PaymentRequiredBody {
    PaymentRequiredBody {
        x402_version: X402_VERSION,
        error: error.into(),
        accepts: vec![payment_requirements(req, state)],
    }
}

pub fn payment_required<C: ChainClient>(
    req: &HttpRequest,
    state: &AppState<C>,
    error: impl Into<String>,
) -> HttpResponse {
    HttpResponse::PaymentRequired().json(payment_required_body(req, state, error))
}

/// Rejections a fresh, correctly-priced authorization would fix. These get
/// a 402 with the challenge; the rest are plain 400s.
pub fn is_payment_problem(err: &ValidationError) -> bool {
    matches!(
        err,
        ValidationError::InsufficientAmount { .. }
            | ValidationError::InsufficientFunds(_)
            | ValidationError::Expired { .. }
            | ValidationError::NotYetValid { .. }
    )
}
