// Wallet Holder Tests
// Custody, balances and the offline offer handshake

use offlinepay::identity::Keypair;
use offlinepay::ledger::{ConflictError, TokenLedgerStore};
use offlinepay::token::TokenStatus;
use offlinepay::transaction::TransactionStatus;
use offlinepay::wallet::{Wallet, WalletError};

use super::common::{address, amount, Harness};

// ============================================================================
// CUSTODY
// ============================================================================

/// Test: a new wallet holds nothing
#[tokio::test]
async fn test_empty_wallet() {
    let harness = Harness::new();
    let wallet = harness.wallet(Keypair::generate());

    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(0));
    assert!(wallet.tokens().await.expect("tokens").is_empty());
    assert_eq!(wallet.pending_claims().count(), 0);
    assert!(!wallet.needs_full_resync());
}

/// Test: receiving a minted token adds to the balance; receiving it twice
/// changes nothing
#[tokio::test]
async fn test_receive_is_idempotent() {
    let harness = Harness::new();
    let keypair = Keypair::generate();
    let token = harness.mint(&keypair, 40).await;
    let mut wallet = harness.wallet(keypair);

    wallet.receive_token(token.clone()).await.expect("first receive");
    wallet.receive_token(token).await.expect("second receive");

    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(40));
    assert_eq!(wallet.stats().await.expect("stats").cached_tokens, 1);
}

/// Test: tokens owned by someone else are refused
#[tokio::test]
async fn test_receive_foreign_token() {
    let harness = Harness::new();
    let token = harness.mint(&Keypair::generate(), 10).await;
    let mut wallet = harness.wallet(Keypair::generate());

    let err = wallet.receive_token(token.clone()).await.expect_err("not ours");
    assert!(matches!(err, WalletError::NotOwner(id) if id == *token.id()));
}

/// Test: a token from an issuer the wallet does not trust fails validation
#[tokio::test]
async fn test_receive_untrusted_issuer() {
    let ours = Harness::new();
    let theirs = Harness::new();
    let keypair = Keypair::generate();
    let token = theirs.mint(&keypair, 10).await;
    let mut wallet = ours.wallet(keypair);

    let err = wallet.receive_token(token).await.expect_err("unknown issuer");
    assert!(matches!(err, WalletError::InvalidToken { .. }));
    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(0));
}

/// Test: dividing offline keeps the balance and records lineage for the
/// next sync
#[tokio::test]
async fn test_divide_offline() {
    let harness = Harness::new();
    let mut wallet = harness.funded_wallet(100).await;
    let token_id = *wallet.tokens().await.expect("tokens")[0].id();

    let result = wallet.divide_token(&token_id, amount(25)).await.expect("divide");

    assert_eq!(result.payment.amount(), amount(25));
    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(100));
    assert_eq!(wallet.tokens().await.expect("tokens").len(), 2);
    assert_eq!(wallet.stats().await.expect("stats").unsynced_divisions, 2);
    let parent = wallet.cache().get(&token_id).await.expect("get").expect("parent");
    assert_eq!(parent.status(), TokenStatus::Divided);
}

// ============================================================================
// OFFERS
// ============================================================================

/// Test: an exact payment spends whole tokens without dividing
#[tokio::test]
async fn test_exact_payment_spends_whole_token() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(30).await;
    let mut bob = harness.wallet(Keypair::generate());

    let offer = alice.prepare_payment(&bob.address(), amount(30)).await.expect("prepare");
    assert!(offer.divisions.is_empty());
    assert_eq!(offer.tokens.len(), 1);

    let acceptance = bob.accept_payment(&offer).await.expect("accept");
    let completed = alice.finalize_payment(&acceptance).await.expect("finalize");

    assert_eq!(completed.status(), TransactionStatus::Completed);
    assert_eq!(alice.offline_balance().await.expect("balance"), amount(0));
    let spent = alice.cache().get(offer.tokens[0].id()).await.expect("get").expect("token");
    assert_eq!(spent.status(), TokenStatus::Spent);
    assert_eq!(alice.pending_claims().count(), 1);
    assert_eq!(bob.history().await.len(), 1);
}

/// Test: paying less than a token divides it and carries the division in
/// the offer
#[tokio::test]
async fn test_partial_payment_divides() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(100).await;
    let bob = harness.wallet(Keypair::generate());

    let offer = alice.prepare_payment(&bob.address(), amount(35)).await.expect("prepare");

    assert_eq!(offer.amount(), amount(35));
    assert_eq!(offer.tokens[0].amount(), amount(35));
    assert_eq!(offer.divisions.len(), 1);
    assert_eq!(alice.open_offers().count(), 1);
    // The payment child is reserved; only the change is spendable
    let spendable = alice.spendable_tokens().await.expect("spendable");
    assert_eq!(spendable.len(), 1);
    assert_eq!(spendable[0].amount(), amount(65));
}

/// Test: a payment larger than any one key's tokens is refused
#[tokio::test]
async fn test_insufficient_balance() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let bob = address(&Keypair::generate());

    let err = alice.prepare_payment(&bob, amount(11)).await.expect_err("too much");
    match err {
        WalletError::InsufficientBalance { available, required } => {
            assert_eq!(available, amount(10));
            assert_eq!(required, amount(11));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Test: zero-amount payments are refused
#[tokio::test]
async fn test_zero_amount() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let bob = address(&Keypair::generate());

    let err = alice.prepare_payment(&bob, amount(0)).await.expect_err("zero");
    assert!(matches!(err, WalletError::ZeroAmount));
}

/// Test: cancelling an offer releases its tokens
#[tokio::test]
async fn test_cancel_payment() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let bob = address(&Keypair::generate());

    let offer = alice.prepare_payment(&bob, amount(10)).await.expect("prepare");
    assert!(alice.spendable_tokens().await.expect("spendable").is_empty());

    alice.cancel_payment(offer.transaction_id()).expect("cancel");
    assert_eq!(alice.spendable_tokens().await.expect("spendable").len(), 1);
    assert!(matches!(
        alice.cancel_payment(offer.transaction_id()),
        Err(WalletError::UnknownOffer(_))
    ));
}

/// Test: an offer addressed elsewhere is refused by the payee
#[tokio::test]
async fn test_accept_wrong_recipient() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());
    let carol = address(&Keypair::generate());

    let offer = alice.prepare_payment(&carol, amount(10)).await.expect("prepare");
    let err = bob.accept_payment(&offer).await.expect_err("not for bob");
    assert!(matches!(err, WalletError::RecipientMismatch));
}

/// Test: an offer whose token list was tampered with is refused
#[tokio::test]
async fn test_accept_tampered_offer() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());

    let mut offer = alice.prepare_payment(&bob.address(), amount(10)).await.expect("prepare");
    offer.tokens.clear();

    let err = bob.accept_payment(&offer).await.expect_err("tampered");
    assert!(matches!(err, WalletError::OfferMismatch(_)));
}

/// Test: accepting the same offer twice returns the same countersignature
#[tokio::test]
async fn test_accept_is_idempotent() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());

    let offer = alice.prepare_payment(&bob.address(), amount(10)).await.expect("prepare");
    let first = bob.accept_payment(&offer).await.expect("accept");
    let second = bob.accept_payment(&offer).await.expect("accept again");

    assert_eq!(first, second);
    assert_eq!(bob.pending_claims().count(), 1);
}

/// Test: finalizing twice returns the completed transaction
#[tokio::test]
async fn test_finalize_is_idempotent() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());

    let offer = alice.prepare_payment(&bob.address(), amount(10)).await.expect("prepare");
    let acceptance = bob.accept_payment(&offer).await.expect("accept");
    let first = alice.finalize_payment(&acceptance).await.expect("finalize");
    let second = alice.finalize_payment(&acceptance).await.expect("finalize again");

    assert_eq!(first.id(), second.id());
    assert_eq!(alice.pending_claims().count(), 1);
}

/// Test: the payee notices a token offered a second time before any sync
#[tokio::test]
async fn test_payee_detects_second_offer() {
    let harness = Harness::new();
    let shared = Keypair::generate();
    let token = harness.mint(&shared, 20).await;
    let mut device_one = harness.wallet(shared.clone());
    let mut device_two = harness.wallet(shared);
    device_one.receive_token(token.clone()).await.expect("receive");
    device_two.receive_token(token.clone()).await.expect("receive");
    let mut bob = harness.wallet(Keypair::generate());

    let first = device_one.prepare_payment(&bob.address(), amount(20)).await.expect("prepare");
    bob.accept_payment(&first).await.expect("first accepted");

    let second = device_two.prepare_payment(&bob.address(), amount(20)).await.expect("prepare");
    let err = bob.accept_payment(&second).await.expect_err("second refused");
    match err {
        WalletError::DoubleSpend(ConflictError::DoubleSpend {
            token_id,
            first_transaction,
            second_transaction,
        }) => {
            assert_eq!(token_id, *token.id());
            assert_eq!(first_transaction, *first.transaction_id());
            assert_eq!(second_transaction, *second.transaction_id());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bob.detector().claim_count(), 1);
}

/// Test: an accepted claim is forgotten by the detector once settled
#[tokio::test]
async fn test_sync_clears_detector() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());
    let offer = alice.prepare_payment(&bob.address(), amount(10)).await.expect("prepare");
    bob.accept_payment(&offer).await.expect("accept");
    assert_eq!(bob.detector().claim_count(), 1);

    harness.sync_client().sync_wallet(&mut bob).await.expect("sync");

    assert_eq!(bob.detector().claim_count(), 0);
    assert_eq!(bob.pending_claims().count(), 0);
    assert!(bob.last_sync_timestamp() > 0);
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Test: a restored wallet keeps its tokens, claims and open offers
#[tokio::test]
async fn test_snapshot_restore() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(100).await;
    let mut bob = harness.wallet(Keypair::generate());

    let paid = alice.prepare_payment(&bob.address(), amount(40)).await.expect("prepare");
    let acceptance = bob.accept_payment(&paid).await.expect("accept");
    alice.finalize_payment(&acceptance).await.expect("finalize");
    let open = alice.prepare_payment(&bob.address(), amount(10)).await.expect("prepare");

    let snapshot = alice.snapshot().await;
    let restored = Wallet::restore(
        alice.keyring().clone(),
        snapshot,
        harness.service.validator().clone(),
        harness.clock.clone(),
        harness.config.clone(),
    )
    .await;

    assert_eq!(restored.address(), alice.address());
    assert_eq!(
        restored.offline_balance().await.expect("balance"),
        alice.offline_balance().await.expect("balance")
    );
    assert_eq!(restored.pending_claims().count(), 1);
    assert_eq!(
        restored.open_offers().next().map(|o| *o.transaction_id()),
        Some(*open.transaction_id())
    );
    assert_eq!(restored.stats().await.expect("stats"), alice.stats().await.expect("stats"));
}
