//! Durable settlement ledger.
//!
//! One record per `(payer, nonce)`. The first writer to claim a key owns the
//! settlement; every later state change is a compare-and-set against the
//! state the writer last observed, so two workers can never both move a
//! record along the same edge.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::{Address, TxHash, B256};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Position of a settlement in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Claimed,
    PaymentSubmitted,
    PaymentConfirmed,
    MintSubmitted,
    MintConfirmed,
    PaymentFailed,
    MintFailedAfterPayment,
    Rejected,
}

impl SettlementState {
    pub const ALL: [SettlementState; 8] = [
        SettlementState::Claimed,
        SettlementState::PaymentSubmitted,
        SettlementState::PaymentConfirmed,
        SettlementState::MintSubmitted,
        SettlementState::MintConfirmed,
        SettlementState::PaymentFailed,
        SettlementState::MintFailedAfterPayment,
        SettlementState::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Claimed => "CLAIMED",
            SettlementState::PaymentSubmitted => "PAYMENT_SUBMITTED",
            SettlementState::PaymentConfirmed => "PAYMENT_CONFIRMED",
            SettlementState::MintSubmitted => "MINT_SUBMITTED",
            SettlementState::MintConfirmed => "MINT_CONFIRMED",
            SettlementState::PaymentFailed => "PAYMENT_FAILED",
            SettlementState::MintFailedAfterPayment => "MINT_FAILED_AFTER_PAYMENT",
            SettlementState::Rejected => "REJECTED",
        }
    }

    /// No further transitions and nothing left to reconcile.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::MintConfirmed
                | SettlementState::PaymentFailed
                | SettlementState::Rejected
        )
    }

    /// Still moving through the happy path; a record stuck here needs the
    /// recovery sweep.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SettlementState::Claimed
                | SettlementState::PaymentSubmitted
                | SettlementState::PaymentConfirmed
                | SettlementState::MintSubmitted
        )
    }

    /// The payer's funds have moved on-chain.
    pub fn payment_settled(&self) -> bool {
        matches!(
            self,
            SettlementState::PaymentConfirmed
                | SettlementState::MintSubmitted
                | SettlementState::MintConfirmed
                | SettlementState::MintFailedAfterPayment
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// The two `*_SUBMITTED` self-edges exist only to attach a transaction
    /// hash once it is known; [`SettlementRecord::transition`] enforces that.
    pub fn can_advance_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Claimed, PaymentSubmitted)
                | (Claimed, Rejected)
                | (PaymentSubmitted, PaymentSubmitted)
                | (PaymentSubmitted, PaymentConfirmed)
                | (PaymentSubmitted, PaymentFailed)
                | (PaymentConfirmed, MintSubmitted)
                | (MintSubmitted, MintSubmitted)
                | (MintSubmitted, MintConfirmed)
                | (MintSubmitted, MintFailedAfterPayment)
                | (MintFailedAfterPayment, MintSubmitted)
        )
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettlementState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown state '{s}'")))
    }
}

/// The durable record of one authorization's settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub payer: Address,
    pub nonce: B256,
    /// Address the collectible is minted to.
    pub recipient: Address,
    /// Copied from the authorization; after this instant the payment can no
    /// longer land on-chain.
    pub valid_before: u64,
    pub state: SettlementState,
    pub payment_tx_hash: Option<TxHash>,
    pub mint_tx_hash: Option<TxHash>,
    pub token_ids: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Immutable facts recorded at claim time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimMeta {
    pub recipient: Address,
    pub valid_before: u64,
}

/// Result of [`SettlementLedger::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller created the record and owns the settlement.
    Claimed(SettlementRecord),
    /// The key already existed; carries the stored record untouched.
    AlreadyClaimed(SettlementRecord),
}

/// Fields written alongside a state change. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    pub payment_tx_hash: Option<TxHash>,
    pub mint_tx_hash: Option<TxHash>,
    pub token_ids: Option<Vec<String>>,
    pub last_error: Option<String>,
}

impl Advance {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn payment_hash(hash: TxHash) -> Self {
        Self {
            payment_tx_hash: Some(hash),
            ..Self::default()
        }
    }

    pub fn mint_hash(hash: TxHash) -> Self {
        Self {
            mint_tx_hash: Some(hash),
            ..Self::default()
        }
    }

    pub fn minted(token_ids: Vec<String>) -> Self {
        Self {
            token_ids: Some(token_ids),
            ..Self::default()
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            last_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl SettlementRecord {
    /// A fresh `CLAIMED` record.
    pub fn claimed(payer: Address, nonce: B256, meta: ClaimMeta, now: i64) -> Self {
        Self {
            payer,
            nonce,
            recipient: meta.recipient,
            valid_before: meta.valid_before,
            state: SettlementState::Claimed,
            payment_tx_hash: None,
            mint_tx_hash: None,
            token_ids: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Compute the record that results from moving to `next`.
    ///
    /// Transaction hashes are write-once within a leg. A self-edge is only
    /// legal when it attaches the missing hash of that leg. Retrying a failed
    /// mint clears the previous mint hash.
    pub fn transition(
        &self,
        next: SettlementState,
        advance: &Advance,
        now: i64,
    ) -> Result<SettlementRecord, LedgerError> {
        let illegal = || LedgerError::IllegalTransition {
            from: self.state,
            to: next,
        };

        if !self.state.can_advance_to(next) {
            return Err(illegal());
        }

        let mut out = self.clone();

        if self.state == SettlementState::MintFailedAfterPayment {
            out.mint_tx_hash = None;
            out.last_error = None;
        }

        if next == self.state {
            let attaches = match next {
                SettlementState::PaymentSubmitted => {
                    self.payment_tx_hash.is_none() && advance.payment_tx_hash.is_some()
                }
                SettlementState::MintSubmitted => {
                    self.mint_tx_hash.is_none() && advance.mint_tx_hash.is_some()
                }
                _ => false,
            };
            if !attaches {
                return Err(illegal());
            }
        }

        if let Some(hash) = advance.payment_tx_hash {
            match out.payment_tx_hash {
                Some(existing) if existing != hash => return Err(illegal()),
                _ => out.payment_tx_hash = Some(hash),
            }
        }
        if let Some(hash) = advance.mint_tx_hash {
            match out.mint_tx_hash {
                Some(existing) if existing != hash => return Err(illegal()),
                _ => out.mint_tx_hash = Some(hash),
            }
        }
        if let Some(ids) = &advance.token_ids {
            out.token_ids = ids.clone();
        }
        if let Some(reason) = &advance.last_error {
            out.last_error = Some(reason.clone());
        }

        out.state = next;
        out.updated_at = now.max(self.updated_at);
        Ok(out)
    }
}

/// Trait for settlement ledger backends.
///
/// Implementations must be thread-safe (`Send + Sync`) and must make
/// `try_claim` and `advance` atomic with respect to every other process
/// sharing the same store. Any store failure is returned as an error so
/// callers can fail closed; nothing here retries.
pub trait SettlementLedger: Send + Sync {
    /// Atomically create a `CLAIMED` record, or report the existing one.
    fn try_claim(
        &self,
        payer: Address,
        nonce: B256,
        meta: ClaimMeta,
    ) -> Result<ClaimOutcome, LedgerError>;

    /// Compare-and-set the record to `next`, applying `advance`.
    /// Returns the updated record.
    fn advance(
        &self,
        payer: Address,
        nonce: B256,
        next: SettlementState,
        advance: Advance,
    ) -> Result<SettlementRecord, LedgerError>;

    fn get(&self, payer: Address, nonce: B256) -> Result<SettlementRecord, LedgerError>;

    /// In-progress records whose last update is at or before `older_than`
    /// (unix seconds), oldest first.
    fn list_stale(&self, older_than: i64, limit: usize)
        -> Result<Vec<SettlementRecord>, LedgerError>;

    /// Records currently in `state`, oldest update first.
    fn list_by_state(
        &self,
        state: SettlementState,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, LedgerError>;

    /// Delete terminal records last updated before `cutoff` whose
    /// authorization also expired before `cutoff`. Returns the number purged.
    fn purge_settled_before(&self, cutoff: i64) -> Result<usize, LedgerError>;
}

/// Persistent settlement ledger backed by SQLite. Survives restarts.
pub struct SqliteLedger {
    conn: Mutex<rusqlite::Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS settlements (
        payer TEXT NOT NULL,
        nonce TEXT NOT NULL,
        recipient TEXT NOT NULL,
        valid_before INTEGER NOT NULL,
        state TEXT NOT NULL,
        payment_tx_hash TEXT,
        mint_tx_hash TEXT,
        token_ids TEXT NOT NULL DEFAULT '',
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (payer, nonce)
    );
    CREATE INDEX IF NOT EXISTS idx_settlements_state_updated
        ON settlements(state, updated_at);";

const COLUMNS: &str = "payer, nonce, recipient, valid_before, state, payment_tx_hash, \
     mint_tx_hash, token_ids, last_error, created_at, updated_at";

impl SqliteLedger {
    /// Open (or create) a SQLite ledger at the given path.
    ///
    /// On Unix systems, the database file permissions are restricted to 0600
    /// (owner read/write only); the ledger links payers to their purchases.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set ledger database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory ledger. Not shared across processes.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("settlement ledger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn key(payer: Address, nonce: B256) -> (String, String) {
    (format!("{payer:#x}"), format!("{nonce:#x}"))
}

/// Column values exactly as stored.
struct RawRecord {
    payer: String,
    nonce: String,
    recipient: String,
    valid_before: i64,
    state: String,
    payment_tx_hash: Option<String>,
    mint_tx_hash: Option<String>,
    token_ids: String,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            payer: row.get(0)?,
            nonce: row.get(1)?,
            recipient: row.get(2)?,
            valid_before: row.get(3)?,
            state: row.get(4)?,
            payment_tx_hash: row.get(5)?,
            mint_tx_hash: row.get(6)?,
            token_ids: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

fn corrupt(field: &str, e: impl fmt::Display) -> LedgerError {
    LedgerError::Corrupt(format!("{field}: {e}"))
}

impl TryFrom<RawRecord> for SettlementRecord {
    type Error = LedgerError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let hash = |field: &str, v: Option<String>| -> Result<Option<TxHash>, LedgerError> {
            v.map(|s| s.parse::<TxHash>().map_err(|e| corrupt(field, e)))
                .transpose()
        };
        Ok(Self {
            payer: raw.payer.parse().map_err(|e| corrupt("payer", e))?,
            nonce: raw.nonce.parse().map_err(|e| corrupt("nonce", e))?,
            recipient: raw.recipient.parse().map_err(|e| corrupt("recipient", e))?,
            valid_before: u64::try_from(raw.valid_before)
                .map_err(|e| corrupt("valid_before", e))?,
            state: raw.state.parse()?,
            payment_tx_hash: hash("payment_tx_hash", raw.payment_tx_hash)?,
            mint_tx_hash: hash("mint_tx_hash", raw.mint_tx_hash)?,
            token_ids: raw
                .token_ids
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            last_error: raw.last_error,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

fn select_one(
    conn: &rusqlite::Connection,
    payer: &str,
    nonce: &str,
) -> Result<Option<SettlementRecord>, LedgerError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM settlements WHERE payer = ?1 AND nonce = ?2"),
            rusqlite::params![payer, nonce],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(SettlementRecord::try_from).transpose()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// SQLite INTEGER is signed; clamp far-future timestamps instead of wrapping.
fn to_sql_ts(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl SettlementLedger for SqliteLedger {
    fn try_claim(
        &self,
        payer: Address,
        nonce: B256,
        meta: ClaimMeta,
    ) -> Result<ClaimOutcome, LedgerError> {
        let conn = self.conn();
        let (payer_key, nonce_key) = key(payer, nonce);
        let record = SettlementRecord::claimed(payer, nonce, meta, unix_now());

        // PRIMARY KEY (payer, nonce) makes this atomic across processes
        // sharing the database file.
        let inserted = conn.execute(
            "INSERT INTO settlements
                (payer, nonce, recipient, valid_before, state, token_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, ?6)
             ON CONFLICT(payer, nonce) DO NOTHING",
            rusqlite::params![
                payer_key,
                nonce_key,
                format!("{:#x}", meta.recipient),
                to_sql_ts(meta.valid_before),
                record.state.as_str(),
                record.created_at,
            ],
        )?;

        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed(record));
        }

        select_one(&conn, &payer_key, &nonce_key)?
            .map(ClaimOutcome::AlreadyClaimed)
            .ok_or_else(|| LedgerError::Unavailable("claim conflict but no row found".into()))
    }

    fn advance(
        &self,
        payer: Address,
        nonce: B256,
        next: SettlementState,
        advance: Advance,
    ) -> Result<SettlementRecord, LedgerError> {
        let mut conn = self.conn();
        let (payer_key, nonce_key) = key(payer, nonce);

        // IMMEDIATE takes the write lock up front, so the read below cannot
        // go stale before the update.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_one(&tx, &payer_key, &nonce_key)?.ok_or(LedgerError::NotFound)?;
        let updated = current.transition(next, &advance, unix_now())?;

        let changed = tx.execute(
            "UPDATE settlements
             SET state = ?1, payment_tx_hash = ?2, mint_tx_hash = ?3, token_ids = ?4,
                 last_error = ?5, updated_at = ?6
             WHERE payer = ?7 AND nonce = ?8 AND state = ?9",
            rusqlite::params![
                updated.state.as_str(),
                updated.payment_tx_hash.map(|h| format!("{h:#x}")),
                updated.mint_tx_hash.map(|h| format!("{h:#x}")),
                updated.token_ids.join(","),
                updated.last_error,
                updated.updated_at,
                payer_key,
                nonce_key,
                current.state.as_str(),
            ],
        )?;
        if changed != 1 {
            return Err(LedgerError::IllegalTransition {
                from: current.state,
                to: next,
            });
        }
        tx.commit()?;

        tracing::debug!(
            payer = %payer,
            nonce = %format!("{:.8}", nonce_key),
            from = %current.state,
            to = %updated.state,
            "settlement advanced"
        );
        Ok(updated)
    }

    fn get(&self, payer: Address, nonce: B256) -> Result<SettlementRecord, LedgerError> {
        let conn = self.conn();
        let (payer_key, nonce_key) = key(payer, nonce);
        select_one(&conn, &payer_key, &nonce_key)?.ok_or(LedgerError::NotFound)
    }

    fn list_stale(
        &self,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM settlements
             WHERE state IN (?1, ?2, ?3, ?4) AND updated_at <= ?5
             ORDER BY updated_at ASC
             LIMIT ?6"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                SettlementState::Claimed.as_str(),
                SettlementState::PaymentSubmitted.as_str(),
                SettlementState::PaymentConfirmed.as_str(),
                SettlementState::MintSubmitted.as_str(),
                older_than,
                sql_limit(limit),
            ],
            RawRecord::from_row,
        )?;

        let records = rows
            .map(|raw| SettlementRecord::try_from(raw?))
            .collect::<Result<Vec<_>, LedgerError>>()?;
        Ok(records)
    }

    fn list_by_state(
        &self,
        state: SettlementState,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM settlements
             WHERE state = ?1
             ORDER BY updated_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![state.as_str(), sql_limit(limit)],
            RawRecord::from_row,
        )?;

        let records = rows
            .map(|raw| SettlementRecord::try_from(raw?))
            .collect::<Result<Vec<_>, LedgerError>>()?;
        Ok(records)
    }

    fn purge_settled_before(&self, cutoff: i64) -> Result<usize, LedgerError> {
        let conn = self.conn();

        // A backward clock jump would make every row look like it lives in
        // the future; skip rather than guess.
        let max_updated: i64 = conn.query_row(
            "SELECT COALESCE(MAX(updated_at), 0) FROM settlements",
            [],
            |row| row.get(0),
        )?;
        if max_updated > unix_now() {
            tracing::warn!(
                max_updated = max_updated,
                "clock appears to have jumped backward, skipping settlement purge"
            );
            return Ok(0);
        }

        let purged = conn.execute(
            "DELETE FROM settlements
             WHERE state IN (?1, ?2, ?3) AND updated_at < ?4 AND valid_before < ?4",
            rusqlite::params![
                SettlementState::MintConfirmed.as_str(),
                SettlementState::PaymentFailed.as_str(),
                SettlementState::Rejected.as_str(),
                cutoff,
            ],
        )?;
        if purged > 0 {
            tracing::info!(purged = purged, "purged settled records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ClaimMeta {
        ClaimMeta {
            recipient: Address::repeat_byte(0xaa),
            valid_before: 1_000,
        }
    }

    fn hash(b: u8) -> TxHash {
        TxHash::repeat_byte(b)
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in SettlementState::ALL {
            assert_eq!(state.as_str().parse::<SettlementState>().unwrap(), state);
        }
        assert!("SETTLED".parse::<SettlementState>().is_err());
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&SettlementState::MintFailedAfterPayment).unwrap();
        assert_eq!(json, "\"MINT_FAILED_AFTER_PAYMENT\"");
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in SettlementState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in SettlementState::ALL {
                assert!(!from.can_advance_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_no_edge_leaves_payment_settled_states_backwards() {
        for from in SettlementState::ALL.into_iter().filter(|s| s.payment_settled()) {
            for to in SettlementState::ALL {
                if from.can_advance_to(to) {
                    assert!(to.payment_settled(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_transition_attaches_hash_once() {
        let rec = SettlementRecord::claimed(Address::ZERO, B256::ZERO, meta(), 10);
        let rec = rec
            .transition(SettlementState::PaymentSubmitted, &Advance::none(), 11)
            .unwrap();
        let rec = rec
            .transition(SettlementState::PaymentSubmitted, &Advance::payment_hash(hash(1)), 12)
            .unwrap();
        assert_eq!(rec.payment_tx_hash, Some(hash(1)));

        // Second attach, and a bare self-edge, are both refused.
        assert!(rec
            .transition(SettlementState::PaymentSubmitted, &Advance::payment_hash(hash(2)), 13)
            .is_err());
        assert!(rec
            .transition(SettlementState::PaymentSubmitted, &Advance::none(), 13)
            .is_err());
    }

    #[test]
    fn test_mint_retry_clears_previous_mint_hash() {
        let mut rec = SettlementRecord::claimed(Address::ZERO, B256::ZERO, meta(), 10);
        rec.state = SettlementState::MintFailedAfterPayment;
        rec.payment_tx_hash = Some(hash(1));
        rec.mint_tx_hash = Some(hash(2));
        rec.last_error = Some("reverted".into());

        let retried = rec
            .transition(SettlementState::MintSubmitted, &Advance::none(), 20)
            .unwrap();
        assert_eq!(retried.mint_tx_hash, None);
        assert_eq!(retried.last_error, None);
        assert_eq!(retried.payment_tx_hash, Some(hash(1)));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let payer = Address::repeat_byte(0x01);
        let nonce = B256::repeat_byte(0x02);

        let first = ledger.try_claim(payer, nonce, meta()).unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        match ledger.try_claim(payer, nonce, meta()).unwrap() {
            ClaimOutcome::AlreadyClaimed(rec) => assert_eq!(rec.state, SettlementState::Claimed),
            other => panic!("expected AlreadyClaimed, got {other:?}"),
        }
    }

    #[test]
    fn test_same_nonce_different_payers_are_independent() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let nonce = B256::repeat_byte(0x02);
        assert!(matches!(
            ledger.try_claim(Address::repeat_byte(1), nonce, meta()).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            ledger.try_claim(Address::repeat_byte(2), nonce, meta()).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn test_advance_walks_happy_path_and_persists_fields() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let (payer, nonce) = (Address::repeat_byte(0x01), B256::repeat_byte(0x02));
        ledger.try_claim(payer, nonce, meta()).unwrap();

        ledger
            .advance(payer, nonce, SettlementState::PaymentSubmitted, Advance::none())
            .unwrap();
        ledger
            .advance(payer, nonce, SettlementState::PaymentSubmitted, Advance::payment_hash(hash(1)))
            .unwrap();
        ledger
            .advance(payer, nonce, SettlementState::PaymentConfirmed, Advance::none())
            .unwrap();
        ledger
            .advance(payer, nonce, SettlementState::MintSubmitted, Advance::mint_hash(hash(2)))
            .unwrap();
        ledger
            .advance(
                payer,
                nonce,
                SettlementState::MintConfirmed,
                Advance::minted(vec!["7".into(), "8".into()]),
            )
            .unwrap();

        let rec = ledger.get(payer, nonce).unwrap();
        assert_eq!(rec.state, SettlementState::MintConfirmed);
        assert_eq!(rec.payment_tx_hash, Some(hash(1)));
        assert_eq!(rec.mint_tx_hash, Some(hash(2)));
        assert_eq!(rec.token_ids, vec!["7".to_string(), "8".to_string()]);
        assert_eq!(rec.recipient, Address::repeat_byte(0xaa));
    }

    #[test]
    fn test_advance_rejects_illegal_edge() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let (payer, nonce) = (Address::repeat_byte(0x01), B256::repeat_byte(0x02));
        ledger.try_claim(payer, nonce, meta()).unwrap();

        let err = ledger
            .advance(payer, nonce, SettlementState::MintSubmitted, Advance::none())
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::IllegalTransition {
                from: SettlementState::Claimed,
                to: SettlementState::MintSubmitted,
            }
        );
        assert_eq!(ledger.get(payer, nonce).unwrap().state, SettlementState::Claimed);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(
            ledger.get(Address::ZERO, B256::ZERO).unwrap_err(),
            LedgerError::NotFound
        );
    }

    #[test]
    fn test_list_stale_skips_terminal_records() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let open = (Address::repeat_byte(1), B256::repeat_byte(1));
        let done = (Address::repeat_byte(2), B256::repeat_byte(2));
        ledger.try_claim(open.0, open.1, meta()).unwrap();
        ledger.try_claim(done.0, done.1, meta()).unwrap();
        ledger
            .advance(done.0, done.1, SettlementState::Rejected, Advance::none())
            .unwrap();

        let stale = ledger.list_stale(unix_now(), 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].payer, open.0);

        assert!(ledger.list_stale(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_failed_mints_are_listed_by_state_not_as_stale() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let (payer, nonce) = (Address::repeat_byte(1), B256::repeat_byte(1));
        ledger.try_claim(payer, nonce, meta()).unwrap();
        for (next, extra) in [
            (SettlementState::PaymentSubmitted, Advance::payment_hash(hash(1))),
            (SettlementState::PaymentConfirmed, Advance::none()),
            (SettlementState::MintSubmitted, Advance::mint_hash(hash(2))),
            (SettlementState::MintFailedAfterPayment, Advance::error("reverted")),
        ] {
            ledger.advance(payer, nonce, next, extra).unwrap();
        }

        assert!(ledger.list_stale(unix_now(), 10).unwrap().is_empty());
        let failed = ledger
            .list_by_state(SettlementState::MintFailedAfterPayment, 10)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("reverted"));
    }

    #[test]
    fn test_purge_keeps_unexpired_and_open_records() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let expired = (Address::repeat_byte(1), B256::repeat_byte(1));
        let live = (Address::repeat_byte(2), B256::repeat_byte(2));
        let open = (Address::repeat_byte(3), B256::repeat_byte(3));

        ledger.try_claim(expired.0, expired.1, meta()).unwrap();
        ledger
            .try_claim(
                live.0,
                live.1,
                ClaimMeta {
                    valid_before: u64::MAX,
                    ..meta()
                },
            )
            .unwrap();
        ledger.try_claim(open.0, open.1, meta()).unwrap();
        for (p, n) in [expired, live] {
            ledger.advance(p, n, SettlementState::Rejected, Advance::none()).unwrap();
        }

        let purged = ledger.purge_settled_before(unix_now() + 1).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(ledger.get(expired.0, expired.1).unwrap_err(), LedgerError::NotFound);
        assert!(ledger.get(live.0, live.1).is_ok());
        assert!(ledger.get(open.0, open.1).is_ok());
    }
}
