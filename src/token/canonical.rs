// Canonical signing encodings
//
// Every signed structure is flattened to a map of string fields and written
// as JSON with sorted keys. Field order in the source struct never matters
// and amounts appear in their fixed-point string form, so any platform that
// rebuilds the same field set produces identical bytes.

use crate::identity::{IssuerKeyId, OwnerCommitment, PublicKey};
use crate::token::{Amount, TokenId};
use std::collections::BTreeMap;

const TOKEN_DOMAIN: &str = "offline-token/v1";
const PROOF_DOMAIN: &str = "division-proof/v1";
const TRANSACTION_DOMAIN: &str = "transaction/v1";

/// Sorted field set that serializes deterministically
#[derive(Debug, Default)]
pub struct CanonicalFields {
    fields: BTreeMap<&'static str, String>,
}

impl CanonicalFields {
    pub fn new(domain: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("domain", domain.to_string());
        Self { fields }
    }

    pub fn field(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.insert(key, value.to_string());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

/// Bytes covered by a token signature: id, amount, issuer, expiry, owner
pub fn token_signing_bytes(
    id: &TokenId,
    amount: Amount,
    issuer_key_id: &IssuerKeyId,
    expires_at: u64,
    owner: &OwnerCommitment,
) -> Vec<u8> {
    CanonicalFields::new(TOKEN_DOMAIN)
        .field("id", id)
        .field("amount", amount)
        .field("issuer", issuer_key_id)
        .field("expires_at", expires_at)
        .field("owner", owner.to_hex())
        .to_bytes()
}

/// Bytes covered by a division proof signature
pub fn proof_signing_bytes(
    parent_id: &TokenId,
    child_id: &TokenId,
    amount: Amount,
    owner: &OwnerCommitment,
    holder_key: &PublicKey,
    created_at: u64,
) -> Vec<u8> {
    CanonicalFields::new(PROOF_DOMAIN)
        .field("parent", parent_id)
        .field("child", child_id)
        .field("amount", amount)
        .field("owner", owner.to_hex())
        .field("holder", holder_key.to_hex())
        .field("created_at", created_at)
        .to_bytes()
}

/// Start a transaction field set; the transaction module fills in the rest
pub fn transaction_fields() -> CanonicalFields {
    CanonicalFields::new(TRANSACTION_DOMAIN)
}
