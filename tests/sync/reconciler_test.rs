// Reconciler Tests
// Batch settlement, deterministic double-spend resolution and expiry

use offlinepay::clock::Clock;
use offlinepay::identity::Keypair;
use offlinepay::ledger::{StatusCause, TokenLedgerStore};
use offlinepay::sync::ClaimOutcome;
use offlinepay::token::{OfflineToken, TokenStatus};
use offlinepay::transaction::{ClientClaim, TransactionBuilder, TransactionId, TransactionStatus};
use uuid::Uuid;

use super::common::{address, Harness};

fn claim_with_id(
    harness: &Harness,
    id: u128,
    payer: &Keypair,
    token: &OfflineToken,
) -> ClientClaim {
    let payee = Keypair::generate();
    let mut transaction = TransactionBuilder::offline_transfer()
        .id(TransactionId::from_uuid(Uuid::from_u128(id)))
        .sender(payer)
        .receiver(address(&payee))
        .amount(token.amount())
        .tokens([*token.id()])
        .created_at(harness.clock.now_millis())
        .build()
        .expect("build");
    transaction.countersign(&payee);
    ClientClaim {
        transaction,
        tokens: vec![token.clone()],
        divisions: Vec::new(),
    }
}

// ============================================================================
// BATCH ORDERING
// ============================================================================

/// Test: within one batch the lowest transaction id wins, whatever order
/// the device listed its claims in
#[tokio::test]
async fn test_batch_winner_is_lowest_transaction_id() {
    for reversed in [false, true] {
        let harness = Harness::new();
        let alice = Keypair::generate();
        let token = harness.mint(&alice, 100).await;
        let low = claim_with_id(&harness, 1, &alice, &token);
        let high = claim_with_id(&harness, 2, &alice, &token);

        let claims = if reversed {
            vec![high.clone(), low.clone()]
        } else {
            vec![low.clone(), high.clone()]
        };
        let response = harness
            .service
            .sync_offline_transactions(claims, 0)
            .await
            .expect("sync");

        assert!(response
            .outcome_for(low.transaction_id())
            .expect("low outcome")
            .is_accepted());
        match response.outcome_for(high.transaction_id()).expect("high outcome") {
            ClaimOutcome::DoubleSpendDetected(conflict) => {
                assert_eq!(conflict.winner, StatusCause::Transaction(*low.transaction_id()));
            }
            other => panic!("expected double spend, got {:?}", other),
        }
        assert!(response.resync_required);
    }
}

/// Test: one double spend does not stop the rest of the batch
#[tokio::test]
async fn test_batch_continues_past_conflict() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let contested = harness.mint(&alice, 10).await;
    let clean = harness.mint(&alice, 20).await;

    let claims = vec![
        claim_with_id(&harness, 1, &alice, &contested),
        claim_with_id(&harness, 2, &alice, &contested),
        claim_with_id(&harness, 3, &alice, &clean),
    ];
    let response = harness
        .service
        .sync_offline_transactions(claims, 0)
        .await
        .expect("sync");

    assert_eq!(response.accepted().count(), 2);
    assert_eq!(response.conflicts.len(), 1);
    let record = harness.store.get(clean.id()).await.expect("get").expect("token");
    assert_eq!(record.status(), TokenStatus::Spent);
}

/// Test: resubmitting a batch changes nothing and reports it settled
#[tokio::test]
async fn test_batch_replay_is_idempotent() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let token = harness.mint(&alice, 10).await;
    let claim = claim_with_id(&harness, 9, &alice, &token);

    let first = harness
        .service
        .sync_offline_transactions(vec![claim.clone()], 0)
        .await
        .expect("sync");
    let second = harness
        .service
        .sync_offline_transactions(vec![claim.clone()], first.last_sync_timestamp)
        .await
        .expect("sync again");

    assert!(matches!(
        second.outcome_for(claim.transaction_id()),
        Some(ClaimOutcome::AlreadySettled { .. })
    ));
    assert!(second.tokens.is_empty());
    assert!(second.transactions.is_empty());
    assert_eq!(second.last_sync_timestamp, first.last_sync_timestamp);
}

/// Test: the response carries every change after the cursor
#[tokio::test]
async fn test_response_carries_delta() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let token = harness.mint(&alice, 10).await;
    let cursor = harness
        .service
        .sync_offline_transactions(Vec::new(), 0)
        .await
        .expect("initial sync")
        .last_sync_timestamp;

    harness.clock.advance_secs(1);
    let claim = claim_with_id(&harness, 4, &alice, &token);
    let response = harness
        .service
        .sync_offline_transactions(vec![claim.clone()], cursor)
        .await
        .expect("sync");

    assert_eq!(response.tokens.len(), 1);
    assert_eq!(response.tokens[0].status(), TokenStatus::Spent);
    assert_eq!(response.transactions.len(), 1);
    assert_eq!(
        response.transactions[0].transaction.status(),
        TransactionStatus::Completed
    );
    assert!(response.last_sync_timestamp > cursor);
}

// ============================================================================
// EXPIRY
// ============================================================================

/// Test: sweeping expires only tokens past their expiry on the ledger clock
#[tokio::test]
async fn test_sweep_expires_old_tokens() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let old = harness.mint(&alice, 10).await;

    harness.clock.advance_secs(harness.config.token_ttl_secs / 2);
    let young = harness.mint(&alice, 10).await;

    assert!(harness.service.sweep_expired().await.expect("sweep").is_empty());

    harness.clock.advance_secs(harness.config.token_ttl_secs / 2 + 1);
    let swept = harness.service.sweep_expired().await.expect("sweep");
    assert_eq!(swept, vec![*old.id()]);

    let record = harness.store.get(old.id()).await.expect("get").expect("old");
    assert_eq!(record.status(), TokenStatus::Expired);
    assert_eq!(record.cause, Some(StatusCause::Expiry));
    let record = harness.store.get(young.id()).await.expect("get").expect("young");
    assert_eq!(record.status(), TokenStatus::Active);

    // A second sweep finds nothing new
    assert!(harness.service.sweep_expired().await.expect("sweep").is_empty());
}

/// Test: a claim spending an expired token is refused, not a double spend
#[tokio::test]
async fn test_claim_on_expired_token_is_rejected() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let token = harness.mint(&alice, 10).await;
    harness.clock.advance_secs(harness.config.token_ttl_secs + 1);
    harness.service.sweep_expired().await.expect("sweep");

    let claim = claim_with_id(&harness, 5, &alice, &token);
    let response = harness
        .service
        .sync_offline_transactions(vec![claim.clone()], 0)
        .await
        .expect("sync");

    assert!(matches!(
        response.outcome_for(claim.transaction_id()),
        Some(ClaimOutcome::Rejected { .. })
    ));
    assert!(!response.resync_required);
}
