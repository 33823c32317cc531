// Device Store Tests
// Keys and wallet state persisted on a holder device

use offlinepay::identity::Keypair;
use offlinepay::storage::{DeviceStore, DeviceStoreError};
use offlinepay::wallet::{Wallet, WalletSnapshot};
use tempfile::TempDir;

use super::common::{address, amount, reopen, Harness};

// ============================================================================
// KEYS
// ============================================================================

#[test]
fn test_open_new_store_is_empty() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = DeviceStore::open(temp_dir.path()).expect("open");

    assert!(store.is_empty());
    assert!(store.keypair_labels().expect("labels").is_empty());
    assert!(store.current_label().expect("label").is_none());
    assert!(store.load_keypair("k0").expect("load").is_none());
}

#[test]
fn test_keypair_roundtrip_across_reopen() {
    let temp_dir = TempDir::new().expect("temp dir");
    let keypair = Keypair::generate();
    {
        let store = DeviceStore::open(temp_dir.path()).expect("open");
        store.save_keypair("k0", &keypair).expect("save");
        store.set_current_label("k0").expect("label");
        store.flush().expect("flush");
    }

    let store = reopen(|| DeviceStore::open(temp_dir.path()));
    let loaded = store.load_keypair("k0").expect("load").expect("stored");
    assert_eq!(loaded.public_key(), keypair.public_key());
    assert_eq!(store.current_label().expect("label").as_deref(), Some("k0"));
    let stats = store.stats().expect("stats");
    assert_eq!(stats.keys, 1);
    assert!(!stats.has_snapshot);
}

#[test]
fn test_saving_a_label_again_replaces_the_key() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = DeviceStore::open(temp_dir.path()).expect("open");
    let first = Keypair::generate();
    let second = Keypair::generate();

    store.save_keypair("k0", &first).expect("save");
    store.save_keypair("k0", &second).expect("save again");

    let loaded = store.load_keypair("k0").expect("load").expect("stored");
    assert_eq!(loaded.public_key(), second.public_key());
    assert_eq!(store.keypair_labels().expect("labels"), vec!["k0"]);
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

#[test]
fn test_empty_snapshot_roundtrip() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = DeviceStore::open(temp_dir.path()).expect("open");
    let snapshot = WalletSnapshot {
        last_sync_timestamp: 99,
        needs_resync: true,
        ..Default::default()
    };

    store.save_snapshot(&snapshot).expect("save");
    let loaded = store.load_snapshot().expect("load").expect("stored");
    assert_eq!(loaded.last_sync_timestamp, 99);
    assert!(loaded.needs_resync);
    assert!(loaded.tokens.is_empty());
}

/// Test: a wallet with tokens, a rotated key and a pending claim comes back
/// exactly as it was saved
#[tokio::test]
async fn test_wallet_save_and_open() {
    let temp_dir = TempDir::new().expect("temp dir");
    let harness = Harness::new();
    let mut wallet = harness.funded_wallet(50).await;
    wallet.rotate_key();
    let payee = Keypair::generate();
    let mut payee_wallet = harness.wallet(payee.clone());

    let offer = wallet
        .prepare_payment(&address(&payee), amount(20))
        .await
        .expect("offer");
    let acceptance = payee_wallet.accept_payment(&offer).await.expect("accept");
    wallet.finalize_payment(&acceptance).await.expect("finalize");

    let balance = wallet.offline_balance().await.expect("balance");
    let original_address = wallet.address();
    {
        let store = DeviceStore::open(temp_dir.path()).expect("open");
        wallet.save(&store).await.expect("save");
    }

    let store = reopen(|| DeviceStore::open(temp_dir.path()));
    assert_eq!(store.keypair_labels().expect("labels").len(), 2);
    let reopened = Wallet::open(
        &store,
        harness.service.validator().clone(),
        harness.clock.clone(),
        harness.config.clone(),
    )
    .await
    .expect("open wallet");

    assert_eq!(reopened.address(), original_address);
    assert_eq!(reopened.keyring().len(), 2);
    assert_eq!(reopened.offline_balance().await.expect("balance"), balance);
    assert_eq!(reopened.pending_claims().count(), 1);
}

/// Test: a store with no keys opens a brand new wallet
#[tokio::test]
async fn test_open_without_keys_creates_wallet() {
    let temp_dir = TempDir::new().expect("temp dir");
    let harness = Harness::new();
    let store = DeviceStore::open(temp_dir.path()).expect("open");

    let wallet = Wallet::open(
        &store,
        harness.service.validator().clone(),
        harness.clock.clone(),
        harness.config.clone(),
    )
    .await
    .expect("open wallet");
    assert_eq!(wallet.keyring().len(), 1);
    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(0));
}

#[test]
fn test_corrupt_snapshot_is_reported() {
    let temp_dir = TempDir::new().expect("temp dir");
    {
        let db = sled::open(temp_dir.path()).expect("raw open");
        let wallet_tree = db.open_tree("device:wallet").expect("tree");
        wallet_tree.insert(b"snapshot", &[0xffu8, 0xff, 0xff][..]).expect("insert");
        db.flush().expect("flush");
    }
    let store = DeviceStore::open(temp_dir.path()).expect("open");
    assert!(matches!(
        store.load_snapshot(),
        Err(DeviceStoreError::DeserializationFailed(_))
    ));
}
