// Timeout Store Tests

use async_trait::async_trait;
use offlinepay::gateway::FundingRef;
use offlinepay::identity::Keypair;
use offlinepay::ledger::{
    CommitOutcome, DivisionRecord, LedgerDelta, LedgerWrite, MemoryLedgerStore, MintRecordOutcome,
    StoreError, TimeoutStore, TokenLedgerStore, TokenRecord, TransactionRecord,
};
use offlinepay::token::{DivisionRequestId, OfflineToken, TokenId, TokenStatus};
use offlinepay::transaction::{Transaction, TransactionId};
use offlinepay::EngineError;
use std::sync::Arc;
use std::time::Duration;

use super::common::Harness;

/// A backend whose token reads stall
struct StallingStore {
    inner: MemoryLedgerStore,
    stall: Duration,
}

#[async_trait]
impl TokenLedgerStore for StallingStore {
    async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.get(id).await
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError> {
        self.inner.get_transaction(id).await
    }

    async fn get_division(&self, id: &DivisionRequestId) -> Result<Option<DivisionRecord>, StoreError> {
        self.inner.get_division(id).await
    }

    async fn get_mint(&self, funding: &FundingRef) -> Result<Option<TokenRecord>, StoreError> {
        self.inner.get_mint(funding).await
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, StoreError> {
        self.inner.commit(write).await
    }

    async fn record_mint(
        &self,
        funding: &FundingRef,
        token: OfflineToken,
        purchase: Transaction,
    ) -> Result<MintRecordOutcome, StoreError> {
        self.inner.record_mint(funding, token, purchase).await
    }

    async fn changes_since(&self, since: u64) -> Result<LedgerDelta, StoreError> {
        self.inner.changes_since(since).await
    }

    async fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<TokenRecord>, StoreError> {
        self.inner.tokens_with_status(status).await
    }
}

async fn stalled(stall_ms: u64, timeout_ms: u64) -> (TimeoutStore, OfflineToken) {
    let harness = Harness::new();
    let token = harness.mint(&Keypair::generate(), 10).await;
    let inner = MemoryLedgerStore::new(harness.clock.clone());
    inner
        .commit(LedgerWrite::new().insert_token(TokenRecord::new(token.clone(), None)))
        .await
        .expect("insert");
    let backend = StallingStore {
        inner,
        stall: Duration::from_millis(stall_ms),
    };
    (
        TimeoutStore::new(Arc::new(backend), Duration::from_millis(timeout_ms)),
        token,
    )
}

/// Test: a stalled read surfaces as a retryable timeout
#[tokio::test]
async fn test_stalled_read_times_out() {
    let (store, token) = stalled(500, 20).await;

    let err = store.get(token.id()).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Timeout {
            operation: "get",
            timeout_ms: 20
        }
    ));
    let engine: EngineError = err.into();
    assert!(engine.is_retryable());
}

/// Test: calls that finish in time pass straight through
#[tokio::test]
async fn test_fast_calls_pass_through() {
    let (store, token) = stalled(0, 1_000).await;

    let record = store.get(token.id()).await.expect("get").expect("record");
    assert_eq!(record.id(), token.id());
    let delta = store.changes_since(0).await.expect("delta");
    assert_eq!(delta.tokens.len(), 1);
}
