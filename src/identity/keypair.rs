// Keys - Ed25519 signing keys held by issuers and wallet holders

use crate::identity::{encoding, OwnerCommitment, Signature, WalletAddress};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum KeypairError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid key bytes: {0}")]
    InvalidBytes(String),

    #[error("Invalid key hex: {0}")]
    InvalidHex(String),
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeypairError> {
    bytes.try_into().map_err(|_| KeypairError::InvalidLength {
        expected: N,
        got: bytes.len(),
    })
}

// ============================================================================
// PUBLIC KEY
// ============================================================================

/// Verifying half of a holder or issuer key
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Rejects byte strings that are not a valid curve point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        let key = VerifyingKey::from_bytes(&fixed::<PUBLIC_KEY_LENGTH>(bytes)?)
            .map_err(|e| KeypairError::InvalidBytes(e.to_string()))?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, KeypairError> {
        let bytes = hex::decode(s).map_err(|e| KeypairError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Strict Ed25519 verification; malleable signatures are refused
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let signature = ed25519_dalek::Signature::from_bytes(signature.to_array());
        self.0.verify_strict(message, &signature).is_ok()
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..16])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encoding::serialize(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = encoding::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECRET KEY
// ============================================================================

/// Signing half of a key. Never printed.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        Ok(Self(SigningKey::from_bytes(&fixed::<SECRET_KEY_LENGTH>(bytes)?)))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

// ============================================================================
// KEYPAIR
// ============================================================================

/// A holder's or issuer's signing identity
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey(SigningKey::generate(&mut OsRng)))
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        let public = PublicKey(secret.0.verifying_key());
        Self { secret, public }
    }

    /// Restore from the 32 secret key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeypairError> {
        SecretKey::from_bytes(bytes).map(Self::from_secret_key)
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    pub fn secret_key(&self) -> SecretKey {
        self.secret.clone()
    }

    /// Commitment that tokens owned by this key carry
    pub fn owner_commitment(&self) -> OwnerCommitment {
        OwnerCommitment::from_public_key(&self.public)
    }

    pub fn address(&self) -> WalletAddress {
        WalletAddress::from_public_key(&self.public)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_array(self.secret.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public)
            .finish_non_exhaustive()
    }
}
