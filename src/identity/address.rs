use crate::identity::{KeypairError, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ADDRESS_PREFIX: &str = "ot:";

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] KeypairError),

    #[error("Invalid owner commitment: {0}")]
    InvalidCommitment(String),
}

/// Wallet address in the format `ot:<base58_public_key>`
///
/// The address names one holder key; the key can be recovered from it, so
/// signatures on transactions can be checked without a directory lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress {
    key_part: String,
}

impl WalletAddress {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let key_part = bs58::encode(public_key.as_bytes()).into_string();
        Self { key_part }
    }

    /// Parse an address from its string form
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let key_part = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| AddressError::InvalidFormat(format!("missing '{}' prefix", ADDRESS_PREFIX)))?;

        if key_part.is_empty() {
            return Err(AddressError::InvalidFormat("key part cannot be empty".into()));
        }

        let bytes = bs58::decode(key_part)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        PublicKey::from_bytes(&bytes)?;

        Ok(Self {
            key_part: key_part.to_string(),
        })
    }

    /// Recover the holder public key behind this address
    pub fn public_key(&self) -> Result<PublicKey, AddressError> {
        let bytes = bs58::decode(&self.key_part)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        Ok(PublicKey::from_bytes(&bytes)?)
    }

    /// Owner commitment of the key this address names
    pub fn commitment(&self) -> Result<OwnerCommitment, AddressError> {
        Ok(OwnerCommitment::from_public_key(&self.public_key()?))
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", ADDRESS_PREFIX, self.key_part)
    }
}

impl FromStr for WalletAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.to_string()
    }
}

/// Commitment to a token owner: SHA-256 over a domain tag and the owner key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerCommitment([u8; 32]);

impl OwnerCommitment {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"owner:");
        hasher.update(public_key.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(s).map_err(|e| AddressError::InvalidCommitment(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidCommitment("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for OwnerCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for OwnerCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerCommitment({})", hex::encode(&self.0[..8]))
    }
}
