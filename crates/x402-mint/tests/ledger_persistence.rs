use alloy::primitives::{Address, TxHash, B256};
use std::sync::Arc;
use std::thread;
use x402_mint::{Advance, ClaimMeta, ClaimOutcome, SettlementLedger, SettlementState, SqliteLedger};

fn meta() -> ClaimMeta {
    ClaimMeta {
        recipient: Address::repeat_byte(0xaa),
        valid_before: 4_000_000_000,
    }
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();
    let (payer, nonce) = (Address::repeat_byte(1), B256::repeat_byte(2));

    {
        let ledger = SqliteLedger::open(path).unwrap();
        ledger.try_claim(payer, nonce, meta()).unwrap();
        ledger
            .advance(payer, nonce, SettlementState::PaymentSubmitted, Advance::none())
            .unwrap();
        ledger
            .advance(
                payer,
                nonce,
                SettlementState::PaymentSubmitted,
                Advance::payment_hash(TxHash::repeat_byte(3)),
            )
            .unwrap();
    }

    let reopened = SqliteLedger::open(path).unwrap();
    let record = reopened.get(payer, nonce).unwrap();
    assert_eq!(record.state, SettlementState::PaymentSubmitted);
    assert_eq!(record.payment_tx_hash, Some(TxHash::repeat_byte(3)));

    // Still claimed after restart: a replay is refused.
    assert!(matches!(
        reopened.try_claim(payer, nonce, meta()).unwrap(),
        ClaimOutcome::AlreadyClaimed(_)
    ));
}

#[cfg(unix)]
#[test]
fn test_database_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let _ledger = SqliteLedger::open(path.to_str().unwrap()).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_concurrent_claims_across_connections_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap().to_string();
    let (payer, nonce) = (Address::repeat_byte(1), B256::repeat_byte(2));

    // Separate connections stand in for separate processes.
    let ledgers: Vec<Arc<SqliteLedger>> = (0..8)
        .map(|_| Arc::new(SqliteLedger::open(&path).unwrap()))
        .collect();

    let handles: Vec<_> = ledgers
        .into_iter()
        .map(|ledger| thread::spawn(move || ledger.try_claim(payer, nonce, meta()).unwrap()))
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|outcome| matches!(outcome, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_concurrent_advances_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap().to_string();
    let (payer, nonce) = (Address::repeat_byte(1), B256::repeat_byte(2));

    let setup = SqliteLedger::open(&path).unwrap();
    setup.try_claim(payer, nonce, meta()).unwrap();
    setup
        .advance(
            payer,
            nonce,
            SettlementState::PaymentSubmitted,
            Advance::payment_hash(TxHash::repeat_byte(1)),
        )
        .unwrap();
    setup
        .advance(payer, nonce, SettlementState::PaymentConfirmed, Advance::none())
        .unwrap();

    // Eight workers race for the mint gate.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = SqliteLedger::open(&path).unwrap();
            thread::spawn(move || {
                ledger
                    .advance(payer, nonce, SettlementState::MintSubmitted, Advance::none())
                    .is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}
