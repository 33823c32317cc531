// Protocol - message types for device <-> ledger synchronization
//
// A device pushes its offline claims together with the ledger timestamp it
// last saw; the ledger answers with a per-claim outcome and the full
// authoritative delta since that timestamp, which the device overwrites its
// cache with instead of merging.

use crate::identity::OwnerCommitment;
use crate::ledger::{DivisionRecord, DoubleSpendConflict, LedgerDelta, TokenRecord, TransactionRecord};
use crate::transaction::{ClientClaim, FailureReason, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

// ============================================================================
// SYNC REQUEST
// ============================================================================

/// Offline claims plus the cursor of the last delta the device applied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Owner commitments the device holds keys for; empty means no filter
    owners: Vec<OwnerCommitment>,
    /// Ledger timestamp of the last applied delta, 0 for a full resync
    since: u64,
    claims: Vec<ClientClaim>,
}

impl SyncRequest {
    pub fn new(since: u64) -> Self {
        Self {
            owners: Vec::new(),
            since,
            claims: Vec::new(),
        }
    }

    /// A request that replays nothing and asks for the whole history
    pub fn full_resync(owners: Vec<OwnerCommitment>) -> Self {
        Self {
            owners,
            since: 0,
            claims: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: OwnerCommitment) -> Self {
        if !self.owners.contains(&owner) {
            self.owners.push(owner);
        }
        self
    }

    pub fn with_claim(mut self, claim: ClientClaim) -> Self {
        self.claims.push(claim);
        self
    }

    pub fn with_claims<I: IntoIterator<Item = ClientClaim>>(mut self, claims: I) -> Self {
        self.claims.extend(claims);
        self
    }

    pub fn owners(&self) -> &[OwnerCommitment] {
        &self.owners
    }

    pub fn since(&self) -> u64 {
        self.since
    }

    pub fn claims(&self) -> &[ClientClaim] {
        &self.claims
    }

    pub fn into_claims(self) -> Vec<ClientClaim> {
        self.claims
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}

// ============================================================================
// CLAIM OUTCOME
// ============================================================================

/// What the ledger decided for one claim
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    Accepted { transaction_id: TransactionId, ledger_ts: u64 },
    /// Settled by an earlier submission of the same id
    AlreadySettled { transaction_id: TransactionId },
    Rejected {
        transaction_id: TransactionId,
        reason: FailureReason,
    },
    DoubleSpendDetected(DoubleSpendConflict),
}

impl ClaimOutcome {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            ClaimOutcome::Accepted { transaction_id, .. }
            | ClaimOutcome::AlreadySettled { transaction_id }
            | ClaimOutcome::Rejected { transaction_id, .. } => transaction_id,
            ClaimOutcome::DoubleSpendDetected(conflict) => &conflict.rejected_transaction,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            ClaimOutcome::Accepted { .. } | ClaimOutcome::AlreadySettled { .. }
        )
    }

    pub fn conflict(&self) -> Option<&DoubleSpendConflict> {
        match self {
            ClaimOutcome::DoubleSpendDetected(conflict) => Some(conflict),
            _ => None,
        }
    }
}

// ============================================================================
// SYNC RESPONSE
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub outcomes: Vec<ClaimOutcome>,
    pub conflicts: Vec<DoubleSpendConflict>,
    pub tokens: Vec<TokenRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub divisions: Vec<DivisionRecord>,
    /// Cursor for the next request
    pub last_sync_timestamp: u64,
    /// A claim lost a double-spend; the device must drop provisional state
    /// and fetch the full history
    pub resync_required: bool,
}

impl SyncResponse {
    /// Build a response from reconcile output, keeping only records that
    /// concern `owners` (all records when `owners` is empty)
    pub fn from_delta(
        outcomes: Vec<ClaimOutcome>,
        delta: LedgerDelta,
        owners: &[OwnerCommitment],
    ) -> Self {
        let conflicts: Vec<DoubleSpendConflict> =
            outcomes.iter().filter_map(|o| o.conflict().cloned()).collect();
        let resync_required = !conflicts.is_empty();
        let last_sync_timestamp = delta.last_ledger_ts;

        if owners.is_empty() {
            return Self {
                outcomes,
                conflicts,
                tokens: delta.tokens,
                transactions: delta.transactions,
                divisions: delta.divisions,
                last_sync_timestamp,
                resync_required,
            };
        }

        let owners: HashSet<&OwnerCommitment> = owners.iter().collect();
        let tokens: Vec<TokenRecord> = delta
            .tokens
            .into_iter()
            .filter(|r| owners.contains(r.token.owner_commitment()))
            .collect();
        let token_ids: HashSet<_> = tokens.iter().map(|r| *r.id()).collect();
        let transactions = delta
            .transactions
            .into_iter()
            .filter(|r| {
                let tx = &r.transaction;
                let party = |addr: &crate::identity::WalletAddress| {
                    addr.commitment().map(|c| owners.contains(&c)).unwrap_or(false)
                };
                party(tx.sender()) || party(tx.receiver()) || tx.token_ids().iter().any(|id| token_ids.contains(id))
            })
            .collect();
        let divisions = delta
            .divisions
            .into_iter()
            .filter(|d| token_ids.contains(&d.parent_id) || token_ids.contains(&d.payment_id))
            .collect();

        Self {
            outcomes,
            conflicts,
            tokens,
            transactions,
            divisions,
            last_sync_timestamp,
            resync_required,
        }
    }

    pub fn accepted(&self) -> impl Iterator<Item = &TransactionId> {
        self.outcomes
            .iter()
            .filter(|o| o.is_accepted())
            .map(|o| o.transaction_id())
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ClaimOutcome> {
        self.outcomes.iter().filter(|o| !o.is_accepted())
    }

    pub fn outcome_for(&self, id: &TransactionId) -> Option<&ClaimOutcome> {
        self.outcomes.iter().find(|o| o.transaction_id() == id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}
