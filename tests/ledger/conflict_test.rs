// Conflict Detection Tests
// Payee-side bookkeeping of which transaction each token was offered in

use offlinepay::identity::Keypair;
use offlinepay::ledger::{ConflictDetector, ConflictError, SpendingClaim};
use offlinepay::token::TokenId;
use offlinepay::transaction::TransactionId;

use super::common::commitment;

fn claim(token: TokenId, tx: TransactionId, at: u64) -> SpendingClaim {
    SpendingClaim::new(token, tx, commitment(&Keypair::generate()), at)
}

// ============================================================================
// SPENDING CLAIM BASICS
// ============================================================================

#[test]
fn test_spending_claim_accessors() {
    let token = TokenId::generate();
    let tx = TransactionId::generate();
    let spender = Keypair::generate();
    let claim = SpendingClaim::new(token, tx, commitment(&spender), 42);

    assert_eq!(claim.token_id(), &token);
    assert_eq!(claim.transaction_id(), &tx);
    assert_eq!(claim.spender(), &commitment(&spender));
    assert_eq!(claim.observed_at(), 42);
}

// ============================================================================
// DETECTION
// ============================================================================

/// Test: one token offered in two transactions is flagged, first kept
#[test]
fn test_second_offer_is_flagged() {
    let mut detector = ConflictDetector::new();
    let token = TokenId::generate();
    let first = TransactionId::generate();
    let second = TransactionId::generate();

    detector.register_claim(claim(token, first, 1)).expect("first claim");
    let err = detector.register_claim(claim(token, second, 2)).unwrap_err();

    assert!(matches!(
        err,
        ConflictError::DoubleSpend { first_transaction, second_transaction, .. }
            if first_transaction == first && second_transaction == second
    ));
    assert_eq!(detector.conflict_count(), 1);
    assert_eq!(detector.claim_for(&token).expect("kept").transaction_id(), &first);
}

/// Test: check never records anything
#[test]
fn test_check_is_read_only() {
    let mut detector = ConflictDetector::new();
    let token = TokenId::generate();
    detector
        .register_claim(claim(token, TransactionId::generate(), 1))
        .expect("register");

    assert!(detector.check(&claim(token, TransactionId::generate(), 2)).is_err());
    assert!(detector.check(&claim(TokenId::generate(), TransactionId::generate(), 2)).is_ok());
    assert_eq!(detector.claim_count(), 1);
    assert_eq!(detector.conflict_count(), 0);
}

/// Test: distinct tokens in one transaction never conflict
#[test]
fn test_many_tokens_one_transaction() {
    let mut detector = ConflictDetector::new();
    let tx = TransactionId::generate();
    for i in 0..5 {
        detector.register_claim(claim(TokenId::generate(), tx, i)).expect("register");
    }
    assert_eq!(detector.claim_count(), 5);
}

/// Test: forgetting a settled token frees it for a new claim
#[test]
fn test_forget_and_clear() {
    let mut detector = ConflictDetector::new();
    let token = TokenId::generate();
    let first = TransactionId::generate();
    detector.register_claim(claim(token, first, 1)).expect("register");

    let forgotten = detector.forget(&token).expect("was tracked");
    assert_eq!(forgotten.transaction_id(), &first);
    detector
        .register_claim(claim(token, TransactionId::generate(), 2))
        .expect("fresh claim");

    detector.clear();
    assert_eq!(detector.claim_count(), 0);
}

// ============================================================================
// SERIALIZATION
// ============================================================================

#[test]
fn test_detector_survives_serialization() {
    let mut detector = ConflictDetector::new();
    let token = TokenId::generate();
    let tx = TransactionId::generate();
    detector.register_claim(claim(token, tx, 7)).expect("register");

    let restored = ConflictDetector::from_bytes(&detector.to_bytes()).expect("decode");
    assert_eq!(restored.claim_count(), 1);
    assert!(restored.check(&claim(token, TransactionId::generate(), 8)).is_err());
}

#[test]
fn test_garbage_bytes_are_refused() {
    let result = ConflictDetector::from_bytes(&[0xff, 0xfe, 0xfd]);
    assert!(matches!(result, Err(ConflictError::DeserializationFailed)));
}
