// Peer Exchange Tests
// Offer, acceptance and rejection carried over an in-memory link

use offlinepay::identity::Keypair;
use offlinepay::transaction::TransactionStatus;
use offlinepay::transport::{MemoryPeerLink, PeerEnvelope, PeerTransport, TransportConfig};
use offlinepay::wallet::WalletError;

use super::common::{address, amount, Harness};

fn link_pair() -> (MemoryPeerLink, MemoryPeerLink) {
    MemoryPeerLink::pair(TransportConfig::default().with_message_timeout_ms(500)).expect("link pair")
}

/// Test: a payment completes on both devices over the link
#[tokio::test]
async fn test_pay_over_link() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(100).await;
    let mut bob = harness.wallet(Keypair::generate());
    let (alice_link, bob_link) = link_pair();
    let bob_address = bob.address();

    let (paid, accepted) = tokio::join!(
        alice.pay_peer(&alice_link, &bob_address, amount(30)),
        bob.accept_peer(&bob_link),
    );
    let paid = paid.expect("paid");
    let accepted = accepted.expect("accepted");

    assert_eq!(&accepted.transaction_id, paid.id());
    assert_eq!(paid.status(), TransactionStatus::Completed);
    assert_eq!(alice.offline_balance().await.expect("balance"), amount(70));
    assert_eq!(alice.open_offers().count(), 0);
    assert_eq!(bob.pending_claims().count(), 1);
}

/// Test: a refused offer is cancelled and its tokens freed
#[tokio::test]
async fn test_refused_offer() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let mut bob = harness.wallet(Keypair::generate());
    let (alice_link, bob_link) = link_pair();
    // Addressed to someone bob does not hold keys for
    let carol = address(&Keypair::generate());

    let (paid, accepted) = tokio::join!(
        alice.pay_peer(&alice_link, &carol, amount(10)),
        bob.accept_peer(&bob_link),
    );

    assert!(matches!(accepted, Err(WalletError::RecipientMismatch)));
    assert!(matches!(paid, Err(WalletError::Refused { .. })));
    assert_eq!(alice.open_offers().count(), 0);
    assert_eq!(alice.spendable_tokens().await.expect("spendable").len(), 1);
    assert_eq!(bob.pending_claims().count(), 0);
}

/// Test: an offer that cannot be delivered is withdrawn
#[tokio::test]
async fn test_undelivered_offer() {
    let harness = Harness::new();
    let mut alice = harness.funded_wallet(10).await;
    let (alice_link, _bob_link) = link_pair();
    let bob = address(&Keypair::generate());

    let err = alice
        .pay_peer(&alice_link, &bob, amount(10))
        .await
        .expect_err("nobody listening");

    assert!(matches!(err, WalletError::Transport(ref e) if e.is_timeout()));
    assert_eq!(alice.open_offers().count(), 0);
    assert_eq!(alice.spendable_tokens().await.expect("spendable").len(), 1);
}

/// Test: waiting for an offer but receiving something else fails cleanly
#[tokio::test]
async fn test_unexpected_envelope() {
    let harness = Harness::new();
    let mut bob = harness.wallet(Keypair::generate());
    let (alice_link, bob_link) = link_pair();

    let bundle = PeerEnvelope::TokenBundle(Vec::new());
    let (sent, accepted) = tokio::join!(
        alice_link.send_envelope(&bundle),
        bob.accept_peer(&bob_link),
    );

    sent.expect("delivered");
    assert!(matches!(accepted, Err(WalletError::UnexpectedEnvelope("token_bundle"))));
}

/// Test: freshly minted tokens arrive as a bundle
#[tokio::test]
async fn test_receive_bundle() {
    let harness = Harness::new();
    let owner = Keypair::generate();
    let tokens = vec![harness.mint(&owner, 5).await, harness.mint(&owner, 7).await];
    let mut wallet = harness.wallet(owner);
    let (issuer_link, wallet_link) = link_pair();

    let bundle = PeerEnvelope::TokenBundle(tokens);
    let (sent, received) = tokio::join!(
        issuer_link.send_envelope(&bundle),
        wallet.receive_bundle(&wallet_link),
    );

    sent.expect("delivered");
    assert_eq!(received.expect("received"), 2);
    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(12));
}
