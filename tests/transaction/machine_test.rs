// Transaction State Machine Tests

use offlinepay::identity::Keypair;
use offlinepay::token::{Amount, TokenId};
use offlinepay::transaction::{
    FailureReason, Transaction, TransactionBuildError, TransactionBuilder, TransactionEvent,
    TransactionKind, TransactionStatus, Transition, TransitionError,
};

use super::common::address;

fn offline(sender: &Keypair, receiver: &Keypair) -> Transaction {
    TransactionBuilder::offline_transfer()
        .sender(sender)
        .receiver(address(receiver))
        .amount(Amount::from_minor(2_500))
        .tokens([TokenId::generate()])
        .created_at(10)
        .build()
        .expect("build offline transfer")
}

// ============================================================================
// BUILDER
// ============================================================================

/// Test: a built transaction is pending and carries only the sender signature
#[test]
fn test_built_transaction_is_signed_by_sender() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let tx = offline(&alice, &bob);

    assert_eq!(tx.status(), TransactionStatus::Pending);
    assert_eq!(tx.created_at(), 10);
    assert!(tx.verify_sender_signature().expect("address decodes"));
    assert!(tx.receiver_signature().is_none());
    assert!(!tx.has_both_signatures());
}

/// Test: missing fields, zero amounts and self payment are refused
#[test]
fn test_builder_rejects_incomplete_transfers() {
    let alice = Keypair::generate();

    let no_receiver = TransactionBuilder::offline_transfer()
        .sender(&alice)
        .amount(Amount::from_minor(1))
        .build();
    assert!(matches!(no_receiver, Err(TransactionBuildError::MissingReceiver)));

    let zero = TransactionBuilder::offline_transfer()
        .sender(&alice)
        .receiver(address(&Keypair::generate()))
        .amount(Amount::ZERO)
        .build();
    assert!(matches!(zero, Err(TransactionBuildError::ZeroAmount)));

    let to_self = TransactionBuilder::offline_transfer()
        .sender(&alice)
        .receiver(address(&alice))
        .amount(Amount::from_minor(1))
        .build();
    assert!(matches!(to_self, Err(TransactionBuildError::SelfPayment)));
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Test: the receiver's countersignature completes an offline transfer
#[test]
fn test_countersigned_transfer_completes() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mut tx = offline(&alice, &bob);
    tx.countersign(&bob);

    let transition = tx.apply(TransactionEvent::TokensSpent { at: 20 }).expect("apply");
    assert_eq!(transition, Transition::Moved(TransactionStatus::Completed));
    assert_eq!(tx.completed_at(), Some(20));
}

/// Test: a signature by anyone other than the receiver does not complete it
#[test]
fn test_wrong_countersigner_is_a_mismatch() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mut tx = offline(&alice, &bob);
    tx.countersign(&Keypair::generate());

    assert_eq!(
        tx.apply(TransactionEvent::TokensSpent { at: 20 }),
        Err(TransitionError::SignatureMismatch)
    );
    assert_eq!(tx.status(), TransactionStatus::Pending);
}

/// Test: a completed transaction ignores every later event
#[test]
fn test_completed_transaction_ignores_cancel() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mut tx = offline(&alice, &bob);
    tx.countersign(&bob);
    tx.apply(TransactionEvent::TokensSpent { at: 20 }).expect("complete");

    let after = tx.apply(TransactionEvent::Cancelled { at: 30 }).expect("apply");
    assert_eq!(after, Transition::Unchanged(TransactionStatus::Completed));
    assert!(!after.is_moved());

    let after = tx
        .apply(TransactionEvent::Failed {
            reason: FailureReason::MissingSignature,
            at: 31,
        })
        .expect("apply");
    assert_eq!(after.status(), TransactionStatus::Completed);
    assert!(tx.failure().is_none());
    assert_eq!(tx.completed_at(), Some(20));
}

/// Test: failed attempts count up to the budget, then fail the transaction
#[test]
fn test_attempt_budget() {
    let alice = Keypair::generate();
    let mut tx = TransactionBuilder::new(TransactionKind::OnlineTransfer)
        .sender(&alice)
        .receiver(address(&Keypair::generate()))
        .amount(Amount::from_minor(100))
        .build()
        .expect("build");

    for _ in 0..2 {
        let t = tx
            .apply(TransactionEvent::AttemptFailed { max_attempts: 3, at: 1 })
            .expect("apply");
        assert_eq!(t, Transition::Unchanged(TransactionStatus::Pending));
    }
    let t = tx
        .apply(TransactionEvent::AttemptFailed { max_attempts: 3, at: 2 })
        .expect("apply");
    assert_eq!(t, Transition::Moved(TransactionStatus::Failed));
    assert_eq!(tx.failure(), Some(&FailureReason::RetryBudgetExhausted { attempts: 3 }));
}

/// Test: chain confirmations do not apply to offline transfers
#[test]
fn test_confirmations_on_offline_transfer_are_refused() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mut tx = offline(&alice, &bob);
    let result = tx.apply(TransactionEvent::ConfirmationsObserved {
        confirmations: 6,
        required: 6,
        at: 1,
    });
    assert!(matches!(result, Err(TransitionError::WrongKind { .. })));
}
