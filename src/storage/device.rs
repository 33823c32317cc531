// DeviceStore - one holder device's keyring and wallet snapshot in sled
//
//   device:keyring   label -> 32 secret key bytes
//   device:wallet    "current" -> current key label
//                    "snapshot" -> postcard WalletSnapshot
//
// `save_wallet` writes both trees in one sled transaction, so a crash never
// leaves a snapshot that refers to keys the store does not hold.

use crate::identity::Keypair;
use crate::wallet::{Keyring, WalletSnapshot};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use thiserror::Error;

mod trees {
    pub const KEYRING: &str = "device:keyring";
    pub const WALLET: &str = "device:wallet";
}

mod keys {
    pub const CURRENT_LABEL: &[u8] = b"current";
    pub const SNAPSHOT: &[u8] = b"snapshot";
}

#[derive(Error, Debug)]
pub enum DeviceStoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Stored {0} could not be decoded")]
    DeserializationFailed(&'static str),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for DeviceStoreError {
    fn from(err: sled::Error) -> Self {
        DeviceStoreError::DatabaseError(err.to_string())
    }
}

impl From<TransactionError<()>> for DeviceStoreError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(inner) => inner.into(),
            TransactionError::Abort(()) => DeviceStoreError::DatabaseError("transaction aborted".into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: usize,
    pub has_snapshot: bool,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

pub struct DeviceStore {
    db: sled::Db,
    keyring: sled::Tree,
    wallet: sled::Tree,
}

impl DeviceStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceStoreError> {
        let db = sled::open(path).map_err(|e| DeviceStoreError::OpenFailed(e.to_string()))?;
        let keyring = db.open_tree(trees::KEYRING)?;
        let wallet = db.open_tree(trees::WALLET)?;
        Ok(Self { db, keyring, wallet })
    }

    pub fn is_empty(&self) -> bool {
        self.keyring.is_empty() && self.wallet.is_empty()
    }

    pub fn flush(&self) -> Result<(), DeviceStoreError> {
        self.db
            .flush()
            .map_err(|e| DeviceStoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats, DeviceStoreError> {
        Ok(StorageStats {
            keys: self.keyring.len(),
            has_snapshot: self.wallet.contains_key(keys::SNAPSHOT)?,
            disk_size_bytes: self.db.size_on_disk()?,
        })
    }

    // ========================================================================
    // KEYRING
    // ========================================================================

    /// Store a keypair under `label`, replacing any key already there
    pub fn save_keypair(&self, label: &str, keypair: &Keypair) -> Result<(), DeviceStoreError> {
        self.keyring.insert(label.as_bytes(), &keypair.to_bytes()[..])?;
        Ok(())
    }

    pub fn load_keypair(&self, label: &str) -> Result<Option<Keypair>, DeviceStoreError> {
        self.keyring
            .get(label.as_bytes())?
            .map(|bytes| Keypair::from_bytes(&bytes).map_err(|_| DeviceStoreError::DeserializationFailed("keypair")))
            .transpose()
    }

    /// Every stored label in byte order
    pub fn keypair_labels(&self) -> Result<Vec<String>, DeviceStoreError> {
        self.keyring
            .iter()
            .keys()
            .map(|key| {
                key.map(|k| String::from_utf8_lossy(&k).into_owned())
                    .map_err(DeviceStoreError::from)
            })
            .collect()
    }

    pub fn set_current_label(&self, label: &str) -> Result<(), DeviceStoreError> {
        self.wallet.insert(keys::CURRENT_LABEL, label.as_bytes())?;
        Ok(())
    }

    pub fn current_label(&self) -> Result<Option<String>, DeviceStoreError> {
        Ok(self
            .wallet
            .get(keys::CURRENT_LABEL)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // ========================================================================
    // WALLET
    // ========================================================================

    pub fn save_snapshot(&self, snapshot: &WalletSnapshot) -> Result<(), DeviceStoreError> {
        self.wallet.insert(keys::SNAPSHOT, snapshot.to_bytes())?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<WalletSnapshot>, DeviceStoreError> {
        self.wallet
            .get(keys::SNAPSHOT)?
            .map(|bytes| {
                WalletSnapshot::from_bytes(&bytes).map_err(|_| DeviceStoreError::DeserializationFailed("wallet snapshot"))
            })
            .transpose()
    }

    /// Keys, current label and snapshot in one atomic write
    pub fn save_wallet(&self, keyring: &Keyring, snapshot: &WalletSnapshot) -> Result<(), DeviceStoreError> {
        let snapshot_bytes = snapshot.to_bytes();
        (&self.keyring, &self.wallet).transaction(|(stored_keys, wallet)| {
            for (label, keypair) in keyring.entries() {
                stored_keys.insert(label.as_bytes(), &keypair.to_bytes()[..])?;
            }
            wallet.insert(keys::CURRENT_LABEL, keyring.current_label().as_bytes())?;
            wallet.insert(keys::SNAPSHOT, snapshot_bytes.as_slice())?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;
        Ok(())
    }
}
