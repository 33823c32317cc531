// Timeout decorator - bounds every store call so a stalled backend surfaces
// as a retryable `StoreError::Timeout` instead of hanging a settlement

use crate::gateway::FundingRef;
use crate::ledger::{
    CommitOutcome, DivisionRecord, LedgerDelta, LedgerWrite, MintRecordOutcome, StoreError,
    TokenLedgerStore, TokenRecord, TransactionRecord,
};
use crate::token::{DivisionRequestId, OfflineToken, TokenId, TokenStatus};
use crate::transaction::{Transaction, TransactionId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct TimeoutStore {
    inner: Arc<dyn TokenLedgerStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn TokenLedgerStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl TokenLedgerStore for TimeoutStore {
    async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError> {
        self.bounded("get", self.inner.get(id)).await
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        self.bounded("get_transaction", self.inner.get_transaction(id)).await
    }

    async fn get_division(&self, id: &DivisionRequestId) -> Result<Option<DivisionRecord>, StoreError> {
        self.bounded("get_division", self.inner.get_division(id)).await
    }

    async fn get_mint(&self, funding: &FundingRef) -> Result<Option<TokenRecord>, StoreError> {
        self.bounded("get_mint", self.inner.get_mint(funding)).await
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, StoreError> {
        self.bounded("commit", self.inner.commit(write)).await
    }

    async fn record_mint(
        &self,
        funding: &FundingRef,
        token: OfflineToken,
        purchase: Transaction,
    ) -> Result<MintRecordOutcome, StoreError> {
        self.bounded("record_mint", self.inner.record_mint(funding, token, purchase))
            .await
    }

    async fn changes_since(&self, since: u64) -> Result<LedgerDelta, StoreError> {
        self.bounded("changes_since", self.inner.changes_since(since)).await
    }

    async fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<TokenRecord>, StoreError> {
        self.bounded("tokens_with_status", self.inner.tokens_with_status(status))
            .await
    }
}
