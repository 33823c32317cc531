// Conflict detection - double-spend bookkeeping shared by the reconciler's
// reports and the payee-side detector that runs while offline

use crate::identity::OwnerCommitment;
use crate::ledger::StatusCause;
use crate::token::TokenId;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A token the ledger had already consumed when a later claim arrived
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSpendConflict {
    pub token_id: TokenId,
    /// The claim that lost
    pub rejected_transaction: TransactionId,
    /// What the ledger recorded first
    pub winner: StatusCause,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Double spend detected: token {token_id} already offered in {first_transaction}")]
    DoubleSpend {
        token_id: TokenId,
        first_transaction: TransactionId,
        second_transaction: TransactionId,
    },

    #[error("Deserialization failed")]
    DeserializationFailed,
}

/// A device's observation that a token was offered in a transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingClaim {
    token_id: TokenId,
    transaction_id: TransactionId,
    spender: OwnerCommitment,
    observed_at: u64,
}

impl SpendingClaim {
    pub fn new(
        token_id: TokenId,
        transaction_id: TransactionId,
        spender: OwnerCommitment,
        observed_at: u64,
    ) -> Self {
        Self {
            token_id,
            transaction_id,
            spender,
            observed_at,
        }
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn spender(&self) -> &OwnerCommitment {
        &self.spender
    }

    pub fn observed_at(&self) -> u64 {
        self.observed_at
    }
}

/// Tracks which transaction each seen token was offered in. Advisory only:
/// it lets a payee refuse a token it already accepted, but the reconciler
/// remains the sole authority.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConflictDetector {
    claims: HashMap<TokenId, SpendingClaim>,
    conflict_count: usize,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    pub fn conflict_count(&self) -> usize {
        self.conflict_count
    }

    /// Check a claim without recording it
    pub fn check(&self, claim: &SpendingClaim) -> Result<(), ConflictError> {
        match self.claims.get(claim.token_id()) {
            Some(existing) if existing.transaction_id != claim.transaction_id => {
                Err(ConflictError::DoubleSpend {
                    token_id: claim.token_id,
                    first_transaction: existing.transaction_id,
                    second_transaction: claim.transaction_id,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record a claim. Re-registering the same transaction is a no-op; a
    /// different transaction for a seen token is a double spend and the
    /// first claim is kept.
    pub fn register_claim(&mut self, claim: SpendingClaim) -> Result<(), ConflictError> {
        if let Err(err) = self.check(&claim) {
            self.conflict_count += 1;
            return Err(err);
        }
        self.claims.entry(claim.token_id).or_insert(claim);
        Ok(())
    }

    pub fn claim_for(&self, token_id: &TokenId) -> Option<&SpendingClaim> {
        self.claims.get(token_id)
    }

    /// Forget claims for tokens the ledger has settled
    pub fn forget(&mut self, token_id: &TokenId) -> Option<SpendingClaim> {
        self.claims.remove(token_id)
    }

    pub fn clear(&mut self) {
        self.claims.clear();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConflictError> {
        postcard::from_bytes(bytes).map_err(|_| ConflictError::DeserializationFailed)
    }
}
