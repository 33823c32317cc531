// Offline Settlement Tests

use offlinepay::clock::Clock;
use offlinepay::identity::Keypair;
use offlinepay::ledger::{StatusCause, TokenLedgerStore};
use offlinepay::token::{build_children, Amount, DivisionRequestId, OfflineToken, TokenStatus};
use offlinepay::transaction::{
    ClientClaim, DivisionClaim, FailureReason, SettlementOutcome, TransactionBuilder,
    TransactionProcessor, TransactionStatus,
};

use super::common::{address, amount, Harness};

/// Claim spending `tokens` whole from `payer` to `payee`, countersigned
/// unless `countersign` is false
fn claim(
    harness: &Harness,
    payer: &Keypair,
    payee: &Keypair,
    tokens: Vec<OfflineToken>,
    divisions: Vec<DivisionClaim>,
    countersign: bool,
) -> ClientClaim {
    let total = tokens
        .iter()
        .try_fold(Amount::ZERO, |acc, t| acc.checked_add(t.amount()))
        .expect("sum");
    let mut transaction = TransactionBuilder::offline_transfer()
        .sender(payer)
        .receiver(address(payee))
        .amount(total)
        .tokens(tokens.iter().map(|t| *t.id()))
        .created_at(harness.clock.now_millis())
        .build()
        .expect("build");
    if countersign {
        transaction.countersign(payee);
    }
    ClientClaim {
        transaction,
        tokens,
        divisions,
    }
}

// ============================================================================
// ACCEPTANCE
// ============================================================================

/// Test: a countersigned claim completes and spends the token
#[tokio::test]
async fn test_claim_settles_and_spends_token() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let claim = claim(&harness, &alice, &bob, vec![token.clone()], vec![], true);
    let outcome = harness
        .service
        .processor()
        .complete_offline(&claim)
        .await
        .expect("settle");

    assert!(matches!(outcome, SettlementOutcome::Completed { .. }));
    assert_eq!(outcome.transaction().status(), TransactionStatus::Completed);

    let record = harness.store.get(token.id()).await.expect("get").expect("token");
    assert_eq!(record.status(), TokenStatus::Spent);
    assert_eq!(record.cause, Some(StatusCause::Transaction(*claim.transaction_id())));
}

/// Test: replaying a settled claim writes nothing and reports the first result
#[tokio::test]
async fn test_replay_is_already_settled() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;
    let claim = claim(&harness, &alice, &bob, vec![token], vec![], true);
    let processor = harness.service.processor();

    processor.complete_offline(&claim).await.expect("first");
    let before = harness.store.all_transactions().await.len();
    let replay = processor.complete_offline(&claim).await.expect("replay");

    assert!(matches!(replay, SettlementOutcome::AlreadySettled(_)));
    assert!(replay.is_accepted());
    assert_eq!(harness.store.all_transactions().await.len(), before);
}

/// Test: a payment child produced offline is registered together with its
/// division and the change stays active
#[tokio::test]
async fn test_offline_division_is_registered() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let division = build_children(
        &alice,
        &token,
        amount(30),
        DivisionRequestId::generate(),
        harness.clock.now_millis(),
    )
    .expect("divide offline");
    let payment = division.payment.clone();
    let change = division.change.clone().expect("change");

    let claim = claim(
        &harness,
        &alice,
        &bob,
        vec![payment.clone()],
        vec![DivisionClaim::from(division.clone())],
        true,
    );
    let outcome = harness
        .service
        .processor()
        .complete_offline(&claim)
        .await
        .expect("settle");
    assert!(outcome.is_accepted());

    let parent = harness.store.get(token.id()).await.expect("get").expect("parent");
    assert_eq!(parent.status(), TokenStatus::Divided);
    assert_eq!(parent.cause, Some(StatusCause::Division(division.request_id)));

    let paid = harness.store.get(payment.id()).await.expect("get").expect("payment");
    assert_eq!(paid.status(), TokenStatus::Spent);

    let kept = harness.store.get(change.id()).await.expect("get").expect("change");
    assert_eq!(kept.status(), TokenStatus::Active);
    assert_eq!(kept.token.amount(), amount(70));
    assert!(harness
        .store
        .get_division(&division.request_id)
        .await
        .expect("get division")
        .is_some());
}

// ============================================================================
// REJECTION
// ============================================================================

/// Test: a claim without the receiver's signature is refused and leaves
/// no record under its id
#[tokio::test]
async fn test_missing_receiver_signature_is_rejected() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let claim = claim(&harness, &alice, &bob, vec![token.clone()], vec![], false);
    let outcome = harness
        .service
        .processor()
        .complete_offline(&claim)
        .await
        .expect("settle");

    match outcome {
        SettlementOutcome::Rejected { reason, transaction } => {
            assert_eq!(reason, FailureReason::MissingSignature);
            assert_eq!(transaction.status(), TransactionStatus::Failed);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    let record = harness.store.get(token.id()).await.expect("get").expect("token");
    assert_eq!(record.status(), TokenStatus::Active);
    assert!(harness
        .store
        .get_transaction(claim.transaction_id())
        .await
        .expect("get transaction")
        .is_none());
}

/// Test: a copy countersigned by the wrong key cannot block the genuine claim
#[tokio::test]
async fn test_forged_countersignature_does_not_poison_id() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mallory = Keypair::generate();
    let token = harness.mint(&alice, 40).await;
    let processor = harness.service.processor();

    let genuine = claim(&harness, &alice, &bob, vec![token.clone()], vec![], true);
    let mut forged = genuine.clone();
    forged.transaction.countersign(&mallory);

    let refused = processor.complete_offline(&forged).await.expect("settle forged");
    assert!(matches!(
        refused,
        SettlementOutcome::Rejected {
            reason: FailureReason::SignatureMismatch,
            ..
        }
    ));

    let outcome = processor.complete_offline(&genuine).await.expect("settle genuine");
    assert!(matches!(outcome, SettlementOutcome::Completed { .. }));
    let record = harness.store.get(token.id()).await.expect("get").expect("token");
    assert_eq!(record.status(), TokenStatus::Spent);
}

/// Test: a different transaction presented under a settled id is refused
/// and the recorded one stands
#[tokio::test]
async fn test_reused_transaction_id_is_refused() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mallory = Keypair::generate();
    let first = harness.mint(&alice, 40).await;
    let other = harness.mint(&mallory, 40).await;
    let processor = harness.service.processor();

    let settled = claim(&harness, &alice, &bob, vec![first], vec![], true);
    processor.complete_offline(&settled).await.expect("settle");

    let mut transaction = TransactionBuilder::offline_transfer()
        .id(*settled.transaction_id())
        .sender(&mallory)
        .receiver(address(&bob))
        .amount(other.amount())
        .tokens([*other.id()])
        .created_at(harness.clock.now_millis())
        .build()
        .expect("build");
    transaction.countersign(&bob);
    let reuse = ClientClaim {
        transaction,
        tokens: vec![other.clone()],
        divisions: vec![],
    };

    let outcome = processor.complete_offline(&reuse).await.expect("settle reuse");
    assert!(matches!(outcome, SettlementOutcome::Rejected { .. }));
    let recorded = harness
        .store
        .get_transaction(settled.transaction_id())
        .await
        .expect("get transaction")
        .expect("recorded");
    assert_eq!(recorded.transaction.status(), TransactionStatus::Completed);
    assert_eq!(recorded.transaction.sender(), settled.transaction.sender());
    let untouched = harness.store.get(other.id()).await.expect("get").expect("token");
    assert_eq!(untouched.status(), TokenStatus::Active);
}

/// Test: spending someone else's token is an ownership failure
#[tokio::test]
async fn test_spending_foreign_token_is_rejected() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let mallory = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let claim = claim(&harness, &mallory, &bob, vec![token.clone()], vec![], true);
    let outcome = harness
        .service
        .processor()
        .complete_offline(&claim)
        .await
        .expect("settle");

    assert!(matches!(
        outcome,
        SettlementOutcome::Rejected {
            reason: FailureReason::OwnershipMismatch { .. },
            ..
        }
    ));
}

/// Test: a token the ledger never saw, with no division producing it
#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;
    let orphan = build_children(
        &alice,
        &token,
        amount(10),
        DivisionRequestId::generate(),
        harness.clock.now_millis(),
    )
    .expect("divide")
    .payment;

    let claim = claim(&harness, &alice, &bob, vec![orphan.clone()], vec![], true);
    let outcome = harness
        .service
        .processor()
        .complete_offline(&claim)
        .await
        .expect("settle");

    match outcome {
        SettlementOutcome::Rejected { reason, .. } => {
            assert_eq!(reason, FailureReason::UnknownToken { token_id: *orphan.id() });
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

// ============================================================================
// DOUBLE SPEND
// ============================================================================

/// Test: two claims on one token; the first settled wins, the second names it
#[tokio::test]
async fn test_double_spend_names_the_winner() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let carol = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let to_bob = claim(&harness, &alice, &bob, vec![token.clone()], vec![], true);
    let to_carol = claim(&harness, &alice, &carol, vec![token.clone()], vec![], true);
    let processor = harness.service.processor();

    let first = processor.complete_offline(&to_bob).await.expect("first");
    let second = processor.complete_offline(&to_carol).await.expect("second");

    assert!(first.is_accepted());
    match second {
        SettlementOutcome::DoubleSpend { transaction, conflict } => {
            assert_eq!(transaction.status(), TransactionStatus::Failed);
            assert_eq!(conflict.token_id, *token.id());
            assert_eq!(conflict.rejected_transaction, *to_carol.transaction_id());
            assert_eq!(conflict.winner, StatusCause::Transaction(*to_bob.transaction_id()));
            assert_eq!(
                transaction.failure(),
                Some(&FailureReason::DoubleSpend {
                    token_id: *token.id(),
                    winner: StatusCause::Transaction(*to_bob.transaction_id()),
                })
            );
        }
        other => panic!("expected double spend, got {:?}", other),
    }

    let record = harness.store.get(token.id()).await.expect("get").expect("token");
    assert_eq!(record.cause, Some(StatusCause::Transaction(*to_bob.transaction_id())));
}

/// Test: concurrent claims on one token settle exactly one
#[tokio::test]
async fn test_concurrent_claims_accept_exactly_one() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let token = harness.mint(&alice, 100).await;

    let claims: Vec<ClientClaim> = (0..4)
        .map(|_| claim(&harness, &alice, &Keypair::generate(), vec![token.clone()], vec![], true))
        .collect();
    let processor = harness.service.processor();
    let outcomes = settle_all(processor, &claims).await;

    let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
    assert_eq!(accepted, 1);
    let double_spends = outcomes
        .iter()
        .filter(|o| matches!(o, SettlementOutcome::DoubleSpend { .. }))
        .count();
    assert_eq!(double_spends, 3);
}

async fn settle_all(
    processor: &TransactionProcessor,
    claims: &[ClientClaim],
) -> Vec<SettlementOutcome> {
    let (a, b, c, d) = tokio::join!(
        processor.complete_offline(&claims[0]),
        processor.complete_offline(&claims[1]),
        processor.complete_offline(&claims[2]),
        processor.complete_offline(&claims[3]),
    );
    vec![
        a.expect("settle"),
        b.expect("settle"),
        c.expect("settle"),
        d.expect("settle"),
    ]
}

/// Test: dividing a token the ledger already saw spent is a double spend
#[tokio::test]
async fn test_division_of_spent_parent_is_double_spend() {
    let harness = Harness::new();
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let token = harness.mint(&alice, 100).await;
    let processor = harness.service.processor();

    let whole = claim(&harness, &alice, &bob, vec![token.clone()], vec![], true);
    processor.complete_offline(&whole).await.expect("spend whole");

    let division = build_children(
        &alice,
        &token,
        amount(40),
        DivisionRequestId::generate(),
        harness.clock.now_millis(),
    )
    .expect("divide offline");
    let split = claim(
        &harness,
        &alice,
        &bob,
        vec![division.payment.clone()],
        vec![DivisionClaim::from(division)],
        true,
    );
    let outcome = processor.complete_offline(&split).await.expect("settle split");

    match outcome {
        SettlementOutcome::DoubleSpend { conflict, .. } => {
            assert_eq!(conflict.token_id, *token.id());
            assert_eq!(conflict.winner, StatusCause::Transaction(*whole.transaction_id()));
        }
        other => panic!("expected double spend, got {:?}", other),
    }
}
