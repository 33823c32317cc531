// Issuer key registry - resolves issuer key ids to verifying keys
//
// Replaces a single mutable "current issuer key": every token names the key
// that signed it, so rotation never invalidates tokens already in circulation.

use crate::identity::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown issuer key: {0}")]
    UnknownKey(IssuerKeyId),

    #[error("Issuer key {0} is retired and cannot sign new tokens")]
    Retired(IssuerKeyId),

    #[error("No current issuer key configured")]
    NoCurrentKey,
}

/// Short identifier for an issuer key: first 8 bytes of SHA-256(key)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssuerKeyId(String);

impl IssuerKeyId {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        Self(format!("ik-{}", hex::encode(&digest[..8])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssuerKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuerKeyEntry {
    public_key: PublicKey,
    registered_at: u64,
    retired_at: Option<u64>,
}

impl IssuerKeyEntry {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn registered_at(&self) -> u64 {
        self.registered_at
    }

    pub fn retired_at(&self) -> Option<u64> {
        self.retired_at
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// Cached set of issuer verifying keys, shared by issuers and validators
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyRegistry {
    keys: BTreeMap<IssuerKeyId, IssuerKeyEntry>,
    current: Option<IssuerKeyId>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key; the first registered key becomes current
    pub fn register(&mut self, public_key: PublicKey, now: u64) -> IssuerKeyId {
        let id = IssuerKeyId::from_public_key(&public_key);
        self.keys.entry(id.clone()).or_insert(IssuerKeyEntry {
            public_key,
            registered_at: now,
            retired_at: None,
        });
        if self.current.is_none() {
            self.current = Some(id.clone());
        }
        id
    }

    /// Make a registered, non-retired key the signing key for new tokens
    pub fn rotate_to(&mut self, id: &IssuerKeyId) -> Result<(), RegistryError> {
        let entry = self
            .keys
            .get(id)
            .ok_or_else(|| RegistryError::UnknownKey(id.clone()))?;
        if entry.is_retired() {
            return Err(RegistryError::Retired(id.clone()));
        }
        self.current = Some(id.clone());
        Ok(())
    }

    /// Stop signing with a key. It keeps verifying historical tokens.
    pub fn retire(&mut self, id: &IssuerKeyId, now: u64) -> Result<(), RegistryError> {
        let entry = self
            .keys
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownKey(id.clone()))?;
        entry.retired_at.get_or_insert(now);
        if self.current.as_ref() == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    pub fn current(&self) -> Result<&IssuerKeyId, RegistryError> {
        self.current.as_ref().ok_or(RegistryError::NoCurrentKey)
    }

    /// Resolve a verifying key, including retired ones
    pub fn lookup(&self, id: &IssuerKeyId) -> Option<&PublicKey> {
        self.keys.get(id).map(|e| e.public_key())
    }

    pub fn entry(&self, id: &IssuerKeyId) -> Option<&IssuerKeyEntry> {
        self.keys.get(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Registry handle shared between the issuer and every validator.
/// Rotation through one handle is visible to all clones.
#[derive(Clone, Debug, Default)]
pub struct SharedKeyRegistry {
    inner: Arc<RwLock<KeyRegistry>>,
}

impl SharedKeyRegistry {
    pub fn new(registry: KeyRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    // A panicking writer cannot leave the map half-updated, so a poisoned
    // lock still holds a consistent registry.
    pub fn read(&self) -> RwLockReadGuard<'_, KeyRegistry> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, KeyRegistry> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Owned copy, e.g. for caching on a device
    pub fn snapshot(&self) -> KeyRegistry {
        self.read().clone()
    }

    pub fn lookup(&self, id: &IssuerKeyId) -> Option<PublicKey> {
        self.read().lookup(id).cloned()
    }
}
