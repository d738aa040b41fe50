use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use alloy::primitives::{Address, B256, U256};
use x402_mint::security::bearer_matches;
use x402_mint::{
    ChainClient, ClaimRequest, PaymentPayload, SettleResponse, Settlement, SettlementError,
    SettlementRecord, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER,
};

use crate::error::ApiError;
use crate::gate;
use crate::metrics::{self, ADMIN_AUTH_FAILURES, MINT_REQUESTS, SETTLE_LATENCY};
use crate::state::AppState;
use crate::telemetry::SettlementEvent;

fn success_response<C: ChainClient>(record: &SettlementRecord, state: &AppState<C>) -> HttpResponse {
    let settle = SettleResponse {
        success: true,
        error_reason: None,
        payer: Some(record.payer),
        transaction: record.payment_tx_hash.map(|h| format!("{h:#x}")),
        network: state.chain_config.network.clone(),
    };

    let mut response = HttpResponse::Ok();
    match settle.to_header() {
        Ok(header) => {
            response.insert_header((PAYMENT_RESPONSE_HEADER, header));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode payment response header"),
    }
    response.json(serde_json::json!({
        "success": true,
        "data": {
            "recipient": format!("{:#x}", record.recipient),
            "paymentTxHash": record.payment_tx_hash.map(|h| format!("{h:#x}")),
            "mintTxHash": record.mint_tx_hash.map(|h| format!("{h:#x}")),
            "tokenIds": record.token_ids,
            "nftContract": format!("{:#x}", state.nft_contract),
        }
    }))
}

/// The telemetry event for an outcome an operator would care about. Answers
/// replayed from the ledger were already reported when they happened.
fn outcome_event(outcome: &Result<Settlement, ApiError>, network: &str) -> Option<SettlementEvent> {
    match outcome {
        Ok(settlement) if !settlement.replayed => Some(SettlementEvent::from_record(
            "mint.confirmed",
            &settlement.record,
            network,
        )),
        Err(ApiError::Settlement(SettlementError::PartialSettlement {
            record,
            replayed: false,
            ..
        })) => Some(SettlementEvent::from_record(
            "mint.failed_after_payment",
            record,
            network,
        )),
        Err(ApiError::Settlement(SettlementError::Chain { record, .. }))
            if record.state.is_terminal() =>
        {
            Some(SettlementEvent::from_record("payment.failed", record, network))
        }
        _ => None,
    }
}

fn emit_outcome<C: ChainClient>(state: &AppState<C>, outcome: &Result<Settlement, ApiError>) {
    if let Some(event) = outcome_event(outcome, &state.chain_config.network) {
        state.telemetry.emit(event);
    }
}

async fn settle<C: ChainClient>(header: &str, state: &AppState<C>) -> Result<Settlement, ApiError> {
    let payload = PaymentPayload::from_header(header)?;
    let claim = ClaimRequest::from_payload(&payload, &state.chain_config)?;
    tracing::info!(
        payer = %claim.authorization.payer,
        nonce = %format!("{:.10}", claim.authorization.nonce.to_string()),
        "payment attempt"
    );
    Ok(state.orchestrator.process(claim).await?)
}

/// `GET /mint`: always answers with the 402 challenge.
pub async fn mint_challenge<C: ChainClient>(
    req: HttpRequest,
    state: web::Data<AppState<C>>,
) -> HttpResponse {
    MINT_REQUESTS.with_label_values(&["payment_required"]).inc();
    gate::payment_required(&req, &state, "X-PAYMENT header is required")
}

pub async fn mint<C: ChainClient>(
    req: HttpRequest,
    state: web::Data<AppState<C>>,
) -> Result<HttpResponse, ApiError> {
    let Some(header) = req
        .headers()
        .get(PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        MINT_REQUESTS.with_label_values(&["payment_required"]).inc();
        return Ok(gate::payment_required(&req, &state, "X-PAYMENT header is required"));
    };

    let started = Instant::now();
    let outcome = settle(header, &state).await;
    let label = match &outcome {
        Ok(settlement) if settlement.replayed => "replayed",
        Ok(_) => "minted",
        Err(e) => e.label(),
    };
    MINT_REQUESTS.with_label_values(&[label]).inc();
    SETTLE_LATENCY
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());
    emit_outcome(&state, &outcome);

    match outcome {
        Ok(Settlement { record, replayed }) => {
            tracing::info!(
                payer = %record.payer,
                recipient = %record.recipient,
                token_ids = ?record.token_ids,
                replayed = replayed,
                "mint settled"
            );
            Ok(success_response(&record, &state))
        }
        Err(ApiError::Settlement(SettlementError::Validation(v))) if gate::is_payment_problem(&v) => {
            tracing::warn!(reason = v.code(), error = %v, "payment rejected");
            Ok(gate::payment_required(&req, &state, v.code()))
        }
        Err(e) => {
            tracing::warn!(result = label, error = %e, "mint request failed");
            Err(e)
        }
    }
}

fn parse_key(payer: &str, nonce: &str) -> Result<(Address, B256), ApiError> {
    let payer = payer.parse::<Address>().map_err(|e| ApiError::InvalidPath {
        field: "payer",
        reason: e.to_string(),
    })?;
    let nonce = nonce.parse::<B256>().map_err(|e| ApiError::InvalidPath {
        field: "nonce",
        reason: e.to_string(),
    })?;
    Ok((payer, nonce))
}

pub async fn claim_status<C: ChainClient>(
    path: web::Path<(String, String)>,
    state: web::Data<AppState<C>>,
) -> Result<HttpResponse, ApiError> {
    let (payer, nonce) = path.into_inner();
    let (payer, nonce) = parse_key(&payer, &nonce)?;
    let record = state.orchestrator.status(payer, nonce)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "data": record,
    })))
}

fn require_admin<C: ChainClient>(req: &HttpRequest, state: &AppState<C>) -> Result<(), ApiError> {
    let Some(token) = &state.admin_token else {
        ADMIN_AUTH_FAILURES.with_label_values(&["disabled"]).inc();
        return Err(ApiError::Forbidden("admin endpoints are disabled; set ADMIN_TOKEN"));
    };
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if !bearer_matches(header, token) {
        tracing::warn!(path = %req.path(), "admin request with missing or invalid token");
        ADMIN_AUTH_FAILURES.with_label_values(&["invalid"]).inc();
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// Operator resume of a stuck or partially settled claim.
pub async fn resume_claim<C: ChainClient>(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    state: web::Data<AppState<C>>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &state)?;
    let (payer, nonce) = path.into_inner();
    let (payer, nonce) = parse_key(&payer, &nonce)?;

    tracing::info!(payer = %payer, nonce = %nonce, "operator resume requested");
    let outcome = state
        .orchestrator
        .resume(payer, nonce)
        .await
        .map_err(ApiError::from);
    emit_outcome(&state, &outcome);

    let settlement = outcome?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "data": settlement.record,
    })))
}

pub async fn health<C: ChainClient>(state: web::Data<AppState<C>>) -> HttpResponse {
    let chain = state.orchestrator.chain();
    let block = chain.latest_block().await;
    let balance = chain.relayer_balance().await;
    let min_balance = state.orchestrator.policy().min_relayer_balance;

    if let Ok(balance) = &balance {
        let gwei = *balance / U256::from(1_000_000_000u64);
        metrics::RELAYER_BALANCE_GWEI
            .set(i64::try_from(gwei.saturating_to::<u64>()).unwrap_or(i64::MAX));
    }

    match (block, balance) {
        (Ok(block), Ok(balance)) => {
            let funded = balance >= min_balance;
            let status = if funded { "ok" } else { "degraded" };
            let body = serde_json::json!({
                "status": status,
                "service": "x402-mint",
                "network": state.chain_config.network,
                "latestBlock": block.to_string(),
                "relayer": format!("{:#x}", chain.relayer()),
                "relayerBalance": balance.to_string(),
                "minRelayerBalance": min_balance.to_string(),
            });
            if funded {
                HttpResponse::Ok().json(body)
            } else {
                HttpResponse::ServiceUnavailable().json(body)
            }
        }
        _ => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "service": "x402-mint",
            "error": "RPC unreachable",
        })),
    }
}

pub async fn metrics_endpoint<C: ChainClient>(
    req: HttpRequest,
    state: web::Data<AppState<C>>,
) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let header = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            if !bearer_matches(header, token) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if !state.public_metrics => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or X402_PUBLIC_METRICS=true to access /metrics"
            }));
        }
        None => {}
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

/// Register every route on an app whose state is `AppState<C>`.
pub fn configure<C: ChainClient>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/mint")
            .route(web::get().to(mint_challenge::<C>))
            .route(web::post().to(mint::<C>)),
    )
    .route("/claims/{payer}/{nonce}", web::get().to(claim_status::<C>))
    .route(
        "/admin/claims/{payer}/{nonce}/resume",
        web::post().to(resume_claim::<C>),
    )
    .route("/health", web::get().to(health::<C>))
    .route("/metrics", web::get().to(metrics_endpoint::<C>));
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_mint::{ClaimMeta, SettlementState};

    fn record(state: SettlementState) -> SettlementRecord {
        let meta = ClaimMeta {
            recipient: Address::repeat_byte(0x01),
            valid_before: 100,
        };
        let mut record =
            SettlementRecord::claimed(Address::repeat_byte(0x01), B256::repeat_byte(0x02), meta, 1);
        record.state = state;
        record
    }

    fn event_name(outcome: Result<Settlement, ApiError>) -> Option<String> {
        outcome_event(&outcome, "base").map(|e| e.event)
    }

    #[test]
    fn test_only_fresh_outcomes_are_reported() {
        let settled = |replayed| Settlement {
            record: record(SettlementState::MintConfirmed),
            replayed,
        };
        assert_eq!(event_name(Ok(settled(false))).as_deref(), Some("mint.confirmed"));
        assert_eq!(event_name(Ok(settled(true))), None);

        let partial = |replayed| {
            Err(ApiError::Settlement(SettlementError::PartialSettlement {
                record: Box::new(record(SettlementState::MintFailedAfterPayment)),
                reason: "mint reverted".into(),
                replayed,
            }))
        };
        assert_eq!(
            event_name(partial(false)).as_deref(),
            Some("mint.failed_after_payment")
        );
        assert_eq!(event_name(partial(true)), None);

        let replay = Err(ApiError::Settlement(SettlementError::Replay(Box::new(record(
            SettlementState::PaymentFailed,
        )))));
        assert_eq!(event_name(replay), None);
    }
}
