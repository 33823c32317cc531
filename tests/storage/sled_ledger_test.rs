// Sled Ledger Store Tests
// Tests for the durable ledger backend

use offlinepay::gateway::{ChainTxHash, FundingRef};
use offlinepay::identity::Keypair;
use offlinepay::ledger::{
    CommitConflict, CommitOutcome, LedgerWrite, MintRecordOutcome, StatusCause, StoreError,
    TokenLedgerStore, TokenRecord,
};
use offlinepay::storage::SledLedgerStore;
use offlinepay::token::{OfflineToken, TokenStatus};
use offlinepay::transaction::TransactionId;
use offlinepay::OfflineTokenService;
use std::sync::Arc;
use tempfile::TempDir;

use super::common::{amount, commitment, reopen, test_config, Harness};

async fn minted_token() -> (Harness, OfflineToken) {
    let harness = Harness::new();
    let token = harness.mint(&Keypair::generate(), 20).await;
    (harness, token)
}

fn insert(token: &OfflineToken) -> LedgerWrite {
    LedgerWrite::new().insert_token(TokenRecord::new(token.clone(), None))
}

// ============================================================================
// STORE CREATION
// ============================================================================

#[tokio::test]
async fn test_open_new_ledger_is_empty() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (harness, _) = minted_token().await;
    let store = SledLedgerStore::open(temp_dir.path(), harness.clock.clone()).expect("open");

    assert_eq!(store.token_count(), 0);
    let delta = store.changes_since(0).await.expect("delta");
    assert!(delta.is_empty());
    assert_eq!(delta.last_ledger_ts, 0);
}

/// Test: records and the ledger clock survive a reopen
#[tokio::test]
async fn test_reopen_keeps_records_and_timestamps() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (harness, token) = minted_token().await;

    let store = SledLedgerStore::open(temp_dir.path(), harness.clock.clone()).expect("open");
    let first_ts = match store.commit(insert(&token)).await.expect("commit") {
        CommitOutcome::Applied { ledger_ts } => ledger_ts,
        other => panic!("expected applied, got {:?}", other),
    };
    store.flush().expect("flush");
    drop(store);

    let store = reopen(|| SledLedgerStore::open(temp_dir.path(), harness.clock.clone()));
    let record = store.get(token.id()).await.expect("get").expect("record");
    assert_eq!(record.token, token);
    assert_eq!(record.ledger_ts, first_ts);

    // The clock is stuck, the ledger still moves forward
    let outcome = store
        .commit(LedgerWrite::new().change_status(
            *token.id(),
            TokenStatus::Active,
            TokenStatus::Spent,
            StatusCause::Transaction(TransactionId::generate()),
        ))
        .await
        .expect("commit");
    assert!(matches!(outcome, CommitOutcome::Applied { ledger_ts } if ledger_ts > first_ts));
}

// ============================================================================
// COMPARE AND SET
// ============================================================================

#[tokio::test]
async fn test_sled_compare_and_set() {
    let (_harness, token) = minted_token().await;
    let store = SledLedgerStore::temporary().expect("temporary");
    store.commit(insert(&token)).await.expect("insert");

    let cause = StatusCause::Transaction(TransactionId::generate());
    assert!(store
        .compare_and_set_status(token.id(), TokenStatus::Active, TokenStatus::Spent, cause)
        .await
        .expect("cas"));
    assert!(!store
        .compare_and_set_status(token.id(), TokenStatus::Active, TokenStatus::Spent, cause)
        .await
        .expect("cas"));

    let record = store.get(token.id()).await.expect("get").expect("record");
    assert_eq!(record.status(), TokenStatus::Spent);
    assert_eq!(record.cause, Some(cause));
}

#[tokio::test]
async fn test_sled_refuses_resurrection() {
    let (_harness, token) = minted_token().await;
    let store = SledLedgerStore::temporary().expect("temporary");
    store.commit(insert(&token)).await.expect("insert");
    store
        .compare_and_set_status(token.id(), TokenStatus::Active, TokenStatus::Expired, StatusCause::Expiry)
        .await
        .expect("cas");

    let err = store
        .compare_and_set_status(token.id(), TokenStatus::Expired, TokenStatus::Active, StatusCause::Expiry)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
}

#[tokio::test]
async fn test_sled_duplicate_token_conflicts() {
    let (_harness, token) = minted_token().await;
    let store = SledLedgerStore::temporary().expect("temporary");
    store.commit(insert(&token)).await.expect("insert");

    let outcome = store.commit(insert(&token)).await.expect("commit");
    assert_eq!(
        outcome,
        CommitOutcome::Conflict(CommitConflict::TokenExists(*token.id()))
    );
    assert_eq!(store.token_count(), 1);
}

/// Test: concurrent writers through sled transactions; one wins
#[tokio::test]
async fn test_sled_concurrent_cas_single_winner() {
    let (_harness, token) = minted_token().await;
    let store = Arc::new(SledLedgerStore::temporary().expect("temporary"));
    store.commit(insert(&token)).await.expect("insert");

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        let id = *token.id();
        handles.push(tokio::spawn(async move {
            store
                .compare_and_set_status(
                    &id,
                    TokenStatus::Active,
                    TokenStatus::Spent,
                    StatusCause::Transaction(TransactionId::generate()),
                )
                .await
                .expect("cas")
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

// ============================================================================
// MINT RECORDS & QUERIES
// ============================================================================

#[tokio::test]
async fn test_record_mint_is_idempotent_per_funding() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (harness, token) = minted_token().await;
    let store = SledLedgerStore::open(temp_dir.path().join("ledger"), harness.clock.clone()).expect("open");
    let purchase = harness
        .store
        .all_transactions()
        .await
        .pop()
        .expect("purchase")
        .transaction;
    let funding = FundingRef::new(ChainTxHash::new("funding-1"));

    let first = store
        .record_mint(&funding, token.clone(), purchase.clone())
        .await
        .expect("record");
    assert!(matches!(first, MintRecordOutcome::Inserted { .. }));

    let second = store
        .record_mint(&funding, token.clone(), purchase)
        .await
        .expect("record again");
    match second {
        MintRecordOutcome::Existing(record) => assert_eq!(record.id(), token.id()),
        other => panic!("expected existing mint, got {:?}", other),
    }
    assert!(store.get_mint(&funding).await.expect("get mint").is_some());
}

#[tokio::test]
async fn test_sled_changes_since_and_status_queries() {
    let (harness, token) = minted_token().await;
    let other = harness.mint(&Keypair::generate(), 5).await;
    let store = SledLedgerStore::temporary().expect("temporary");
    store.commit(insert(&token)).await.expect("insert");
    let cursor = store.changes_since(0).await.expect("delta").last_ledger_ts;
    store.commit(insert(&other)).await.expect("insert");

    let delta = store.changes_since(cursor).await.expect("delta");
    assert_eq!(delta.tokens.len(), 1);
    assert_eq!(delta.tokens[0].id(), other.id());

    let active = store.tokens_with_status(TokenStatus::Active).await.expect("query");
    assert_eq!(active.len(), 2);
}

// ============================================================================
// SERVICE ON SLED
// ============================================================================

/// Test: the service runs unchanged over the durable backend
#[tokio::test]
async fn test_service_mints_into_sled() {
    let harness = Harness::new();
    let store = Arc::new(SledLedgerStore::temporary().expect("temporary"));
    let service = OfflineTokenService::new(
        store.clone(),
        harness.oracle.clone(),
        Default::default(),
        Keypair::generate(),
        harness.clock.clone(),
        test_config(),
    )
    .expect("service");

    let owner = Keypair::generate();
    let funding = harness.confirmed_funding("sled-funding");
    let token = service
        .mint(commitment(&owner), amount(12), &funding)
        .await
        .expect("mint")
        .into_token();

    assert_eq!(store.token_count(), 1);
    let report = service
        .validate_token(&token, Some(&commitment(&owner)))
        .await
        .expect("validate");
    assert!(report.valid);

    let again = service
        .mint(commitment(&owner), amount(12), &funding)
        .await
        .expect("mint again")
        .into_token();
    assert_eq!(again.id(), token.id());
    assert_eq!(store.token_count(), 1);
}
