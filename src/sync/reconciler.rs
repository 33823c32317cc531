// Reconciler - the sole settlement authority for offline claims
//
// Claims in one batch are applied one at a time in transaction id order, so
// the outcome of a batch does not depend on the order the device listed
// them in. Across batches the store's commit order decides.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::ledger::{DoubleSpendConflict, LedgerDelta, StatusCause, StoreError, TokenLedgerStore};
use crate::sync::{ClaimOutcome, SyncRequest, SyncResponse};
use crate::token::{TokenId, TokenStatus, Validator};
use crate::transaction::{
    ClientClaim, FailureReason, Settlement, SettlementError, SettlementOutcome, TransactionId,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one reconcile batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub outcomes: Vec<ClaimOutcome>,
    pub delta: LedgerDelta,
    pub last_sync_timestamp: u64,
}

impl ReconcileResult {
    pub fn accepted(&self) -> Vec<TransactionId> {
        self.outcomes
            .iter()
            .filter(|o| o.is_accepted())
            .map(|o| *o.transaction_id())
            .collect()
    }

    pub fn rejected(&self) -> Vec<&ClaimOutcome> {
        self.outcomes.iter().filter(|o| !o.is_accepted()).collect()
    }

    pub fn conflicts(&self) -> Vec<&DoubleSpendConflict> {
        self.outcomes.iter().filter_map(|o| o.conflict()).collect()
    }
}

pub struct Reconciler {
    settlement: Settlement,
    store: Arc<dyn TokenLedgerStore>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TokenLedgerStore>,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let settlement = Settlement::new(store.clone(), validator, clock.clone(), config);
        Self {
            settlement,
            store,
            clock,
        }
    }

    /// Settle each claim and return the authoritative delta since `since`.
    /// A store failure aborts the batch; claims already committed stay
    /// committed and replay as `AlreadySettled`.
    pub async fn reconcile(
        &self,
        mut claims: Vec<ClientClaim>,
        since: u64,
    ) -> Result<ReconcileResult, ReconcileError> {
        claims.sort_by_key(|c| *c.transaction_id());

        let mut outcomes = Vec::with_capacity(claims.len());
        for claim in &claims {
            let outcome = self.reconcile_claim(claim).await?;
            outcomes.push(outcome);
        }

        let delta = self.store.changes_since(since).await?;
        let last_sync_timestamp = delta.last_ledger_ts;
        info!(
            claims = claims.len(),
            accepted = outcomes.iter().filter(|o| o.is_accepted()).count(),
            since,
            last_sync_timestamp,
            "reconciled batch"
        );
        Ok(ReconcileResult {
            outcomes,
            delta,
            last_sync_timestamp,
        })
    }

    async fn reconcile_claim(&self, claim: &ClientClaim) -> Result<ClaimOutcome, ReconcileError> {
        let transaction_id = *claim.transaction_id();
        let outcome = match self.settlement.settle(claim).await {
            Ok(SettlementOutcome::Completed { ledger_ts, .. }) => ClaimOutcome::Accepted {
                transaction_id,
                ledger_ts,
            },
            Ok(SettlementOutcome::AlreadySettled(_)) => ClaimOutcome::AlreadySettled { transaction_id },
            Ok(SettlementOutcome::Rejected { reason, .. }) => ClaimOutcome::Rejected {
                transaction_id,
                reason,
            },
            Ok(SettlementOutcome::DoubleSpend { conflict, .. }) => {
                warn!(
                    tx_id = %transaction_id,
                    token_id = %conflict.token_id,
                    winner = %conflict.winner,
                    "double spend detected"
                );
                ClaimOutcome::DoubleSpendDetected(conflict)
            }
            Err(SettlementError::RetriesExhausted { attempts, .. }) => ClaimOutcome::Rejected {
                transaction_id,
                reason: FailureReason::RetryBudgetExhausted { attempts },
            },
            Err(SettlementError::Store(err)) => return Err(err.into()),
        };
        debug!(tx_id = %transaction_id, accepted = outcome.is_accepted(), "claim reconciled");
        Ok(outcome)
    }

    /// Reconcile a wire request and shape the response for its owners
    pub async fn handle(&self, request: SyncRequest) -> Result<SyncResponse, ReconcileError> {
        let owners = request.owners().to_vec();
        let since = request.since();
        let result = self.reconcile(request.into_claims(), since).await?;
        Ok(SyncResponse::from_delta(result.outcomes, result.delta, &owners))
    }

    /// Move every active token past its expiry to expired, judged by the
    /// ledger's clock. Tokens that changed meanwhile are left alone.
    pub async fn sweep_expired(&self) -> Result<Vec<TokenId>, ReconcileError> {
        let now = self.clock.now_millis();
        let mut expired = Vec::new();
        for record in self.store.tokens_with_status(TokenStatus::Active).await? {
            if !record.token.is_expired_at(now) {
                continue;
            }
            let swept = self
                .store
                .compare_and_set_status(
                    record.id(),
                    TokenStatus::Active,
                    TokenStatus::Expired,
                    StatusCause::Expiry,
                )
                .await?;
            if swept {
                expired.push(*record.id());
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), now, "expired tokens swept");
        }
        Ok(expired)
    }
}
