// In-memory ledger store. Serves as the backend's test ledger and as the
// device-side cache a wallet validates and divides against while offline.

use crate::clock::{Clock, SystemClock};
use crate::gateway::FundingRef;
use crate::ledger::store::{find_conflict, next_ledger_ts};
use crate::ledger::{
    CommitOutcome, DivisionRecord, LedgerDelta, LedgerWrite, MintRecordOutcome, StoreError,
    TokenLedgerStore, TokenRecord, TransactionExpectation, TransactionRecord,
};
use crate::token::{DivisionRequestId, OfflineToken, TokenId, TokenStatus};
use crate::transaction::{Transaction, TransactionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    tokens: HashMap<TokenId, TokenRecord>,
    transactions: HashMap<TransactionId, TransactionRecord>,
    divisions: HashMap<DivisionRequestId, DivisionRecord>,
    mints: HashMap<FundingRef, TokenId>,
    last_ts: u64,
}

impl Tables {
    fn conflict(&self, write: &LedgerWrite) -> Option<crate::ledger::CommitConflict> {
        let result: Result<_, std::convert::Infallible> = find_conflict(
            write,
            |id| Ok(self.tokens.get(id).map(|r| r.status())),
            |id| Ok(self.transactions.get(id).map(|r| r.transaction.status())),
            |id| Ok(self.divisions.contains_key(id)),
        );
        match result {
            Ok(conflict) => conflict,
            Err(never) => match never {},
        }
    }

    fn apply(&mut self, write: LedgerWrite, ledger_ts: u64) {
        for change in write.status_changes {
            if let Some(record) = self.tokens.get_mut(&change.token_id) {
                record.token.set_status(change.new);
                record.cause = Some(change.cause);
                record.ledger_ts = ledger_ts;
            }
        }
        for mut record in write.new_tokens {
            record.ledger_ts = ledger_ts;
            self.tokens.insert(*record.id(), record);
        }
        for mut division in write.divisions {
            division.ledger_ts = ledger_ts;
            self.divisions.insert(division.request_id, division);
        }
        if let Some(tx_write) = write.transaction {
            let id = *tx_write.transaction.id();
            self.transactions.insert(
                id,
                TransactionRecord {
                    transaction: tx_write.transaction,
                    ledger_ts,
                },
            );
        }
        self.last_ts = ledger_ts;
    }
}

/// Ledger held in process memory behind a tokio `RwLock`. Every commit takes
/// the one write lock; `SledLedgerStore` is the concurrent authority.
pub struct MemoryLedgerStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
}

impl MemoryLedgerStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    // ========================================================================
    // CACHE MAINTENANCE
    // ========================================================================

    /// Replace a token record with an authoritative copy, bypassing CAS.
    /// Only for mirroring another ledger; never for local state changes.
    pub async fn overwrite_token(&self, record: TokenRecord) {
        self.tables.write().await.tokens.insert(*record.id(), record);
    }

    pub async fn overwrite_transaction(&self, record: TransactionRecord) {
        let mut tables = self.tables.write().await;
        tables.transactions.insert(*record.transaction.id(), record);
    }

    pub async fn overwrite_division(&self, record: DivisionRecord) {
        self.tables.write().await.divisions.insert(record.request_id, record);
    }

    pub async fn remove_token(&self, id: &TokenId) -> Option<TokenRecord> {
        self.tables.write().await.tokens.remove(id)
    }

    pub async fn remove_transaction(&self, id: &TransactionId) -> Option<TransactionRecord> {
        self.tables.write().await.transactions.remove(id)
    }

    pub async fn remove_division(&self, id: &DivisionRequestId) -> Option<DivisionRecord> {
        self.tables.write().await.divisions.remove(id)
    }

    pub async fn all_tokens(&self) -> Vec<TokenRecord> {
        self.tables.read().await.tokens.values().cloned().collect()
    }

    pub async fn all_transactions(&self) -> Vec<TransactionRecord> {
        self.tables.read().await.transactions.values().cloned().collect()
    }

    pub async fn all_divisions(&self) -> Vec<DivisionRecord> {
        self.tables.read().await.divisions.values().cloned().collect()
    }

    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
    }

    pub async fn token_count(&self) -> usize {
        self.tables.read().await.tokens.len()
    }
}

#[async_trait]
impl TokenLedgerStore for MemoryLedgerStore {
    async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.tables.read().await.tokens.get(id).cloned())
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self.tables.read().await.transactions.get(id).cloned())
    }

    async fn get_division(&self, id: &DivisionRequestId) -> Result<Option<DivisionRecord>, StoreError> {
        Ok(self.tables.read().await.divisions.get(id).cloned())
    }

    async fn get_mint(&self, funding: &FundingRef) -> Result<Option<TokenRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .mints
            .get(funding)
            .and_then(|id| tables.tokens.get(id))
            .cloned())
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, StoreError> {
        write.check_transitions()?;
        let mut tables = self.tables.write().await;
        if let Some(conflict) = tables.conflict(&write) {
            return Ok(CommitOutcome::Conflict(conflict));
        }
        let ledger_ts = next_ledger_ts(tables.last_ts, self.clock.now_millis());
        tables.apply(write, ledger_ts);
        Ok(CommitOutcome::Applied { ledger_ts })
    }

    async fn record_mint(
        &self,
        funding: &FundingRef,
        token: OfflineToken,
        purchase: Transaction,
    ) -> Result<MintRecordOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.mints.get(funding).and_then(|id| tables.tokens.get(id)) {
            return Ok(MintRecordOutcome::Existing(existing.clone()));
        }

        let token_id = *token.id();
        let write = LedgerWrite::new()
            .insert_token(TokenRecord::new(token, None))
            .put_transaction(purchase, TransactionExpectation::Absent);
        if let Some(conflict) = tables.conflict(&write) {
            return Err(StoreError::Backend(format!("mint write conflicted: {:?}", conflict)));
        }
        let ledger_ts = next_ledger_ts(tables.last_ts, self.clock.now_millis());
        tables.apply(write, ledger_ts);
        tables.mints.insert(funding.clone(), token_id);
        Ok(MintRecordOutcome::Inserted { ledger_ts })
    }

    async fn changes_since(&self, since: u64) -> Result<LedgerDelta, StoreError> {
        let tables = self.tables.read().await;
        let mut tokens: Vec<TokenRecord> = tables
            .tokens
            .values()
            .filter(|r| r.ledger_ts > since)
            .cloned()
            .collect();
        tokens.sort_by_key(|r| r.ledger_ts);
        let mut transactions: Vec<TransactionRecord> = tables
            .transactions
            .values()
            .filter(|r| r.ledger_ts > since)
            .cloned()
            .collect();
        transactions.sort_by_key(|r| r.ledger_ts);
        let mut divisions: Vec<DivisionRecord> = tables
            .divisions
            .values()
            .filter(|r| r.ledger_ts > since)
            .cloned()
            .collect();
        divisions.sort_by_key(|r| r.ledger_ts);

        Ok(LedgerDelta {
            tokens,
            transactions,
            divisions,
            last_ledger_ts: tables.last_ts.max(since),
        })
    }

    async fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .tokens
            .values()
            .filter(|r| r.status() == status)
            .cloned()
            .collect())
    }
}
