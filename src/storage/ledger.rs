// SledLedgerStore - durable authoritative ledger on sled
//
// One tree per record kind. A commit runs as a single sled transaction over
// all of them, so the precondition checks and the writes are atomic:
// concurrent commits that touch the same keys are serialized by sled and
// the loser re-runs against the winner's state.

use crate::clock::{Clock, SystemClock};
use crate::gateway::FundingRef;
use crate::ledger::{
    find_conflict, next_ledger_ts, CommitConflict, CommitOutcome, DivisionRecord, LedgerDelta,
    LedgerWrite, MintRecordOutcome, StoreError, TokenLedgerStore, TokenRecord,
    TransactionExpectation, TransactionRecord,
};
use crate::token::{DivisionRequestId, OfflineToken, TokenId, TokenStatus};
use crate::transaction::{Transaction, TransactionId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
};
use sled::Transactional;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Tree names
mod trees {
    pub const TOKENS: &str = "ledger:tokens";
    pub const TRANSACTIONS: &str = "ledger:transactions";
    pub const DIVISIONS: &str = "ledger:divisions";
    pub const MINTS: &str = "ledger:mints";
    pub const META: &str = "ledger:meta";
}

const LAST_TS_KEY: &[u8] = b"last_ledger_ts";

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn backend(err: sled::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn flatten_tx<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(backend(err)),
    }
}

/// Transactional view of the ledger trees
struct TxTrees<'a> {
    tokens: &'a TransactionalTree,
    transactions: &'a TransactionalTree,
    divisions: &'a TransactionalTree,
    meta: &'a TransactionalTree,
}

impl TxTrees<'_> {
    fn token(&self, id: &TokenId) -> TxResult<Option<TokenRecord>> {
        match self.tokens.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes).map_err(abort)?)),
            None => Ok(None),
        }
    }

    fn transaction(&self, id: &TransactionId) -> TxResult<Option<TransactionRecord>> {
        match self.transactions.get(id.as_uuid().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes).map_err(abort)?)),
            None => Ok(None),
        }
    }

    fn conflict(&self, write: &LedgerWrite) -> TxResult<Option<CommitConflict>> {
        find_conflict(
            write,
            |id| Ok(self.token(id)?.map(|r| r.status())),
            |id| Ok(self.transaction(id)?.map(|r| r.transaction.status())),
            |id| Ok(self.divisions.get(id.as_uuid().as_bytes())?.is_some()),
        )
    }

    fn next_ts(&self, now_millis: u64) -> TxResult<u64> {
        let last = match self.meta.get(LAST_TS_KEY)? {
            Some(bytes) => decode::<u64>(&bytes).map_err(abort)?,
            None => 0,
        };
        let ts = next_ledger_ts(last, now_millis);
        self.meta.insert(LAST_TS_KEY, encode(&ts).map_err(abort)?)?;
        Ok(ts)
    }

    fn put_token(&self, record: &TokenRecord) -> TxResult<()> {
        self.tokens
            .insert(record.id().as_bytes().as_slice(), encode(record).map_err(abort)?)?;
        Ok(())
    }

    fn apply(&self, write: &LedgerWrite, ledger_ts: u64) -> TxResult<()> {
        for change in &write.status_changes {
            if let Some(mut record) = self.token(&change.token_id)? {
                record.token.set_status(change.new);
                record.cause = Some(change.cause);
                record.ledger_ts = ledger_ts;
                self.put_token(&record)?;
            }
        }
        for record in &write.new_tokens {
            let mut record = record.clone();
            record.ledger_ts = ledger_ts;
            self.put_token(&record)?;
        }
        for division in &write.divisions {
            let mut division = division.clone();
            division.ledger_ts = ledger_ts;
            self.divisions.insert(
                division.request_id.as_uuid().as_bytes().as_slice(),
                encode(&division).map_err(abort)?,
            )?;
        }
        if let Some(tx_write) = &write.transaction {
            let record = TransactionRecord {
                transaction: tx_write.transaction.clone(),
                ledger_ts,
            };
            self.transactions.insert(
                record.transaction.id().as_uuid().as_bytes().as_slice(),
                encode(&record).map_err(abort)?,
            )?;
        }
        Ok(())
    }
}

/// Authoritative ledger persisted in a sled database
pub struct SledLedgerStore {
    db: sled::Db,
    tokens: sled::Tree,
    transactions: sled::Tree,
    divisions: sled::Tree,
    mints: sled::Tree,
    meta: sled::Tree,
    clock: Arc<dyn Clock>,
}

impl SledLedgerStore {
    /// Open or create a ledger at the given path
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(backend)?;
        Self::from_db(db, clock)
    }

    /// A throwaway ledger that lives only as long as the process
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(backend)?;
        Self::from_db(db, Arc::new(SystemClock))
    }

    fn from_db(db: sled::Db, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Ok(Self {
            tokens: db.open_tree(trees::TOKENS).map_err(backend)?,
            transactions: db.open_tree(trees::TRANSACTIONS).map_err(backend)?,
            divisions: db.open_tree(trees::DIVISIONS).map_err(backend)?,
            mints: db.open_tree(trees::MINTS).map_err(backend)?,
            meta: db.open_tree(trees::META).map_err(backend)?,
            db,
            clock,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)?;
        Ok(())
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn read_token(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError> {
        match self.tokens.get(id.as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry.map_err(backend)?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    fn last_ts(&self) -> Result<u64, StoreError> {
        match self.meta.get(LAST_TS_KEY).map_err(backend)? {
            Some(bytes) => decode(&bytes),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl TokenLedgerStore for SledLedgerStore {
    async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError> {
        self.read_token(id)
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        match self.transactions.get(id.as_uuid().as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_division(&self, id: &DivisionRequestId) -> Result<Option<DivisionRecord>, StoreError> {
        match self.divisions.get(id.as_uuid().as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_mint(&self, funding: &FundingRef) -> Result<Option<TokenRecord>, StoreError> {
        match self.mints.get(funding.tx_hash().as_str().as_bytes()).map_err(backend)? {
            Some(bytes) => {
                let token_id: TokenId = decode(&bytes)?;
                self.read_token(&token_id)
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, StoreError> {
        write.check_transitions()?;
        let now = self.clock.now_millis();

        let result = (&self.tokens, &self.transactions, &self.divisions, &self.meta).transaction(
            |(tokens, transactions, divisions, meta)| {
                let trees = TxTrees {
                    tokens,
                    transactions,
                    divisions,
                    meta,
                };
                if let Some(conflict) = trees.conflict(&write)? {
                    return Ok(CommitOutcome::Conflict(conflict));
                }
                let ledger_ts = trees.next_ts(now)?;
                trees.apply(&write, ledger_ts)?;
                Ok(CommitOutcome::Applied { ledger_ts })
            },
        );
        let outcome = flatten_tx(result)?;
        debug!(applied = outcome.is_applied(), "sled ledger commit");
        Ok(outcome)
    }

    async fn record_mint(
        &self,
        funding: &FundingRef,
        token: OfflineToken,
        purchase: Transaction,
    ) -> Result<MintRecordOutcome, StoreError> {
        let now = self.clock.now_millis();
        let funding_key = funding.tx_hash().as_str().as_bytes().to_vec();
        let write = LedgerWrite::new()
            .insert_token(TokenRecord::new(token, None))
            .put_transaction(purchase, TransactionExpectation::Absent);

        let result = (
            &self.tokens,
            &self.transactions,
            &self.divisions,
            &self.mints,
            &self.meta,
        )
            .transaction(|(tokens, transactions, divisions, mints, meta)| {
                let trees = TxTrees {
                    tokens,
                    transactions,
                    divisions,
                    meta,
                };
                if let Some(bytes) = mints.get(funding_key.as_slice())? {
                    let token_id: TokenId = decode(&bytes).map_err(abort)?;
                    if let Some(existing) = trees.token(&token_id)? {
                        return Ok(MintRecordOutcome::Existing(existing));
                    }
                }
                if let Some(conflict) = trees.conflict(&write)? {
                    return Err(abort(StoreError::Backend(format!(
                        "mint write conflicted: {:?}",
                        conflict
                    ))));
                }
                let ledger_ts = trees.next_ts(now)?;
                trees.apply(&write, ledger_ts)?;
                if let Some(record) = write.new_tokens.first() {
                    mints.insert(funding_key.as_slice(), encode(record.id()).map_err(abort)?)?;
                }
                Ok(MintRecordOutcome::Inserted { ledger_ts })
            });
        flatten_tx(result)
    }

    async fn changes_since(&self, since: u64) -> Result<LedgerDelta, StoreError> {
        let mut tokens: Vec<TokenRecord> = Self::scan::<TokenRecord>(&self.tokens)?
            .into_iter()
            .filter(|r| r.ledger_ts > since)
            .collect();
        tokens.sort_by_key(|r| r.ledger_ts);
        let mut transactions: Vec<TransactionRecord> = Self::scan::<TransactionRecord>(&self.transactions)?
            .into_iter()
            .filter(|r| r.ledger_ts > since)
            .collect();
        transactions.sort_by_key(|r| r.ledger_ts);
        let mut divisions: Vec<DivisionRecord> = Self::scan::<DivisionRecord>(&self.divisions)?
            .into_iter()
            .filter(|r| r.ledger_ts > since)
            .collect();
        divisions.sort_by_key(|r| r.ledger_ts);

        Ok(LedgerDelta {
            tokens,
            transactions,
            divisions,
            last_ledger_ts: self.last_ts()?.max(since),
        })
    }

    async fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(Self::scan::<TokenRecord>(&self.tokens)?
            .into_iter()
            .filter(|r| r.status() == status)
            .collect())
    }
}
