use crate::identity::{IssuerKeyId, OwnerCommitment, PublicKey, Signature};
use crate::token::canonical::{proof_signing_bytes, token_signing_bytes};
use crate::token::Amount;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenIdError {
    #[error("Invalid token id: {0}")]
    Invalid(String),
}

/// Unique identifier for an offline token (32 bytes, hex on the wire)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId([u8; 32]);

/// Role of a division output, mixed into its derived id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildRole {
    Payment,
    Change,
}

impl TokenId {
    /// Random id for a freshly minted root token
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Deterministic id of a division output.
    /// Payment and change children of the same request never collide.
    pub fn for_child(parent: &TokenId, request: &DivisionRequestId, role: ChildRole) -> Self {
        let mut hasher = Sha256::new();
        match role {
            ChildRole::Payment => hasher.update(b"token:payment:"),
            ChildRole::Change => hasher.update(b"token:change:"),
        }
        hasher.update(parent.as_bytes());
        hasher.update(request.as_uuid().as_bytes());
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

    pub fn from_hex(s: &str) -> Result<Self, TokenIdError> {
        let bytes = hex::decode(s).map_err(|e| TokenIdError::Invalid(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TokenIdError::Invalid("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", hex::encode(&self.0[..6]))
    }
}

impl TryFrom<String> for TokenId {
    type Error = TokenIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<TokenId> for String {
    fn from(value: TokenId) -> Self {
        value.to_hex()
    }
}

/// Idempotency key of one division request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DivisionRequestId(Uuid);

impl DivisionRequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DivisionRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Divided,
    Spent,
    Redeemed,
    Expired,
}

impl TokenStatus {
    /// Every status other than active is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenStatus::Active)
    }

    /// Monotone transition rule: only active tokens move, and never back
    pub fn can_transition_to(&self, next: TokenStatus) -> bool {
        matches!(self, TokenStatus::Active) && next != TokenStatus::Active
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Divided => "divided",
            TokenStatus::Spent => "spent",
            TokenStatus::Redeemed => "redeemed",
            TokenStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The issuer-signed fields of the root token a child descends from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAttestation {
    pub token_id: TokenId,
    pub amount: Amount,
    pub issuer_key_id: IssuerKeyId,
    pub expires_at: u64,
    pub owner_commitment: OwnerCommitment,
    pub signature: Signature,
}

impl RootAttestation {
    pub fn signing_bytes(&self) -> Vec<u8> {
        token_signing_bytes(
            &self.token_id,
            self.amount,
            &self.issuer_key_id,
            self.expires_at,
            &self.owner_commitment,
        )
    }
}

/// One link of a division chain, signed by whoever held the parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionProof {
    pub parent_id: TokenId,
    pub child_id: TokenId,
    pub amount: Amount,
    pub owner_commitment: OwnerCommitment,
    pub holder_key: PublicKey,
    pub created_at: u64,
    pub signature: Signature,
}

impl DivisionProof {
    pub fn signing_bytes(&self) -> Vec<u8> {
        proof_signing_bytes(
            &self.parent_id,
            &self.child_id,
            self.amount,
            &self.owner_commitment,
            &self.holder_key,
            self.created_at,
        )
    }
}

/// A signed, fixed-amount value unit usable without network access
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineToken {
    id: TokenId,
    amount: Amount,
    issuer_key_id: IssuerKeyId,
    signature: Signature,
    issued_at: u64,
    expires_at: u64,
    owner_commitment: OwnerCommitment,
    status: TokenStatus,
    parent_token_id: Option<TokenId>,
    division_proofs: Vec<DivisionProof>,
    root: Option<RootAttestation>,
}

/// Unsigned fields shared by roots and children
pub(crate) struct TokenDraft {
    pub id: TokenId,
    pub amount: Amount,
    pub issuer_key_id: IssuerKeyId,
    pub issued_at: u64,
    pub expires_at: u64,
    pub owner_commitment: OwnerCommitment,
}

impl TokenDraft {
    pub fn signing_bytes(&self) -> Vec<u8> {
        token_signing_bytes(
            &self.id,
            self.amount,
            &self.issuer_key_id,
            self.expires_at,
            &self.owner_commitment,
        )
    }

    pub fn into_root(self, signature: Signature) -> OfflineToken {
        OfflineToken {
            id: self.id,
            amount: self.amount,
            issuer_key_id: self.issuer_key_id,
            signature,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            owner_commitment: self.owner_commitment,
            status: TokenStatus::Active,
            parent_token_id: None,
            division_proofs: Vec::new(),
            root: None,
        }
    }

    pub fn into_child(
        self,
        signature: Signature,
        parent_id: TokenId,
        division_proofs: Vec<DivisionProof>,
        root: RootAttestation,
    ) -> OfflineToken {
        OfflineToken {
            id: self.id,
            amount: self.amount,
            issuer_key_id: self.issuer_key_id,
            signature,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            owner_commitment: self.owner_commitment,
            status: TokenStatus::Active,
            parent_token_id: Some(parent_id),
            division_proofs,
            root: Some(root),
        }
    }
}

impl OfflineToken {
    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn issuer_key_id(&self) -> &IssuerKeyId {
        &self.issuer_key_id
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn owner_commitment(&self) -> &OwnerCommitment {
        &self.owner_commitment
    }

    pub fn status(&self) -> TokenStatus {
        self.status
    }

    pub fn parent_token_id(&self) -> Option<&TokenId> {
        self.parent_token_id.as_ref()
    }

    pub fn division_proofs(&self) -> &[DivisionProof] {
        &self.division_proofs
    }

    pub fn root(&self) -> Option<&RootAttestation> {
        self.root.as_ref()
    }

    /// True for issuer-minted tokens (no division history)
    pub fn is_root(&self) -> bool {
        self.parent_token_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }

    /// Key that signed this token: the issuer for roots, the last holder for children
    pub fn holder_key(&self) -> Option<&PublicKey> {
        self.division_proofs.last().map(|p| &p.holder_key)
    }

    /// Canonical bytes covered by `signature`
    pub fn signing_bytes(&self) -> Vec<u8> {
        token_signing_bytes(
            &self.id,
            self.amount,
            &self.issuer_key_id,
            self.expires_at,
            &self.owner_commitment,
        )
    }

    /// Attestation for the root of this token's lineage
    pub fn root_attestation(&self) -> RootAttestation {
        match &self.root {
            Some(root) => root.clone(),
            None => RootAttestation {
                token_id: self.id,
                amount: self.amount,
                issuer_key_id: self.issuer_key_id.clone(),
                expires_at: self.expires_at,
                owner_commitment: self.owner_commitment,
                signature: self.signature.clone(),
            },
        }
    }

    pub(crate) fn set_status(&mut self, status: TokenStatus) {
        self.status = status;
    }

    pub(crate) fn with_status(mut self, status: TokenStatus) -> Self {
        self.status = status;
        self
    }
}
