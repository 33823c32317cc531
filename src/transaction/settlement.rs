// Settlement - applies one offline transfer claim to the authoritative
// ledger. Used by the transaction processor and the reconciler.
//
// A claim carries the signed transaction, the token bodies it spends and
// any divisions the payer made offline to produce them. Settlement turns
// that into a single `LedgerWrite`: parents active -> divided, children
// inserted, spent tokens active -> spent, transaction -> completed. The
// store's compare-and-set decides races; a lost race re-reads and replans.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::identity::OwnerCommitment;
use crate::ledger::{
    CommitOutcome, DivisionRecord, DoubleSpendConflict, LedgerWrite, StatusCause, StoreError,
    TokenLedgerStore, TokenRecord, TransactionExpectation,
};
use crate::token::{
    Amount, ChildRole, DivisionRequestId, DivisionResult, OfflineToken, TokenId, TokenStatus,
    ValidationReason, Validator,
};
use crate::transaction::{
    FailureReason, Transaction, TransactionEvent, TransactionId, TransactionKind, TransactionStatus,
    TransitionError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Deepest chain of offline divisions one claim may introduce
const MAX_DIVISION_DEPTH: usize = 64;

/// A division made offline, presented so the ledger can register it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionClaim {
    pub request_id: DivisionRequestId,
    pub parent_id: TokenId,
    pub payment: OfflineToken,
    pub change: Option<OfflineToken>,
}

impl DivisionClaim {
    fn produces(&self, id: &TokenId) -> bool {
        self.payment.id() == id || self.change.as_ref().map(|c| c.id()) == Some(id)
    }

    pub fn children(&self) -> impl Iterator<Item = &OfflineToken> {
        std::iter::once(&self.payment).chain(self.change.iter())
    }
}

impl From<DivisionResult> for DivisionClaim {
    fn from(result: DivisionResult) -> Self {
        Self {
            request_id: result.request_id,
            parent_id: result.parent_id,
            payment: result.payment,
            change: result.change,
        }
    }
}

/// An offline-created transfer submitted for settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientClaim {
    pub transaction: Transaction,
    pub tokens: Vec<OfflineToken>,
    pub divisions: Vec<DivisionClaim>,
}

impl ClientClaim {
    pub fn transaction_id(&self) -> &TransactionId {
        self.transaction.id()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementOutcome {
    Completed { transaction: Transaction, ledger_ts: u64 },
    /// The transaction id was already completed; nothing was written
    AlreadySettled(Transaction),
    Rejected { transaction: Transaction, reason: FailureReason },
    DoubleSpend {
        transaction: Transaction,
        conflict: DoubleSpendConflict,
    },
}

impl SettlementOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SettlementOutcome::Completed { transaction, .. }
            | SettlementOutcome::AlreadySettled(transaction)
            | SettlementOutcome::Rejected { transaction, .. }
            | SettlementOutcome::DoubleSpend { transaction, .. } => transaction,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            SettlementOutcome::Completed { .. } | SettlementOutcome::AlreadySettled(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transaction {transaction_id} lost {attempts} compare-and-set races")]
    RetriesExhausted {
        transaction_id: TransactionId,
        attempts: u32,
    },
}

/// Why planning stopped short of a write
enum Stop {
    Fail(FailureReason),
    DoubleSpend { token_id: TokenId, winner: StatusCause },
    Store(StoreError),
}

impl From<StoreError> for Stop {
    fn from(err: StoreError) -> Self {
        Stop::Store(err)
    }
}

fn fail(reason: FailureReason) -> Stop {
    Stop::Fail(reason)
}

fn invalid_division(token_id: &TokenId, detail: &str) -> Stop {
    fail(FailureReason::InvalidDivision {
        token_id: *token_id,
        detail: detail.to_string(),
    })
}

/// Working state of one planning pass
struct Plan<'c> {
    sender: OwnerCommitment,
    now: u64,
    write: LedgerWrite,
    /// Tokens this claim introduces, keyed by id, with their final status
    created: BTreeMap<TokenId, TokenRecord>,
    /// Existing ledger tokens this claim moves out of active
    consumed: HashSet<TokenId>,
    producers: HashMap<TokenId, &'c DivisionClaim>,
}

#[derive(Clone)]
pub struct Settlement {
    store: Arc<dyn TokenLedgerStore>,
    validator: Validator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Settlement {
    pub fn new(
        store: Arc<dyn TokenLedgerStore>,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            validator,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenLedgerStore> {
        &self.store
    }

    /// Settle one claim. Safe to repeat: the transaction id is the
    /// idempotency key and a settled id returns its recorded outcome.
    pub async fn settle(&self, claim: &ClientClaim) -> Result<SettlementOutcome, SettlementError> {
        let tx_id = *claim.transaction_id();
        let max_attempts = self.config.cas_retry_limit.max(1);

        for attempt in 1..=max_attempts {
            if let Some(outcome) = self.settle_once(claim).await? {
                return Ok(outcome);
            }
            warn!(tx_id = %tx_id, attempt, "settlement lost a compare-and-set race, replanning");
        }

        Err(SettlementError::RetriesExhausted {
            transaction_id: tx_id,
            attempts: max_attempts,
        })
    }

    async fn settle_once(&self, claim: &ClientClaim) -> Result<Option<SettlementOutcome>, StoreError> {
        let tx_id = *claim.transaction_id();
        let now = self.clock.now_millis();

        // Nothing is written under an id until both parties are proven
        if let Err(reason) = authenticate(&claim.transaction) {
            warn!(tx_id = %tx_id, reason = %reason, "refused unauthenticated claim");
            return Ok(Some(unrecorded_rejection(&claim.transaction, reason, now)));
        }

        let expectation = match self.store.get_transaction(&tx_id).await? {
            Some(record) if record.transaction.signing_bytes() != claim.transaction.signing_bytes() => {
                warn!(tx_id = %tx_id, "claim reuses the id of a different transaction");
                let reason = FailureReason::Malformed("transaction id already used".to_string());
                return Ok(Some(unrecorded_rejection(&claim.transaction, reason, now)));
            }
            Some(record) => match record.transaction.status() {
                TransactionStatus::Pending => TransactionExpectation::InStatus(TransactionStatus::Pending),
                _ => {
                    debug!(tx_id = %tx_id, status = %record.transaction.status(), "claim already settled");
                    return Ok(Some(recorded_outcome(record.transaction)));
                }
            },
            None => TransactionExpectation::Absent,
        };

        let mut proposal = claim.transaction.as_proposal();

        let write = match self.plan(claim, &proposal, now).await {
            Ok(write) => write,
            Err(Stop::Store(err)) => return Err(err),
            Err(Stop::Fail(reason)) => {
                return self.record_failure(proposal, reason, None, expectation, now).await;
            }
            Err(Stop::DoubleSpend { token_id, winner }) => {
                let conflict = DoubleSpendConflict {
                    token_id,
                    rejected_transaction: tx_id,
                    winner,
                };
                let reason = FailureReason::DoubleSpend { token_id, winner };
                return self
                    .record_failure(proposal, reason, Some(conflict), expectation, now)
                    .await;
            }
        };

        if let Err(err) = proposal.apply(TransactionEvent::TokensSpent { at: now }) {
            let reason = match err {
                TransitionError::MissingSignature => FailureReason::MissingSignature,
                TransitionError::SignatureMismatch => FailureReason::SignatureMismatch,
                TransitionError::WrongKind { .. } => {
                    FailureReason::Malformed("not an offline transfer".to_string())
                }
            };
            return self.record_failure(proposal, reason, None, expectation, now).await;
        }

        let write = write.put_transaction(proposal.clone(), expectation);
        match self.store.commit(write).await? {
            CommitOutcome::Applied { ledger_ts } => {
                info!(
                    tx_id = %tx_id,
                    amount = %proposal.amount(),
                    tokens = proposal.token_ids().len(),
                    ledger_ts,
                    "settled offline transfer"
                );
                Ok(Some(SettlementOutcome::Completed {
                    transaction: proposal,
                    ledger_ts,
                }))
            }
            CommitOutcome::Conflict(conflict) => {
                debug!(tx_id = %tx_id, ?conflict, "settlement commit conflicted");
                Ok(None)
            }
        }
    }

    async fn record_failure(
        &self,
        mut proposal: Transaction,
        reason: FailureReason,
        conflict: Option<DoubleSpendConflict>,
        expectation: TransactionExpectation,
        now: u64,
    ) -> Result<Option<SettlementOutcome>, StoreError> {
        if let Err(err) = proposal.apply(TransactionEvent::Failed {
            reason: reason.clone(),
            at: now,
        }) {
            warn!(tx_id = %proposal.id(), error = %err, "could not mark transfer failed");
            return Ok(Some(SettlementOutcome::Rejected {
                transaction: proposal,
                reason,
            }));
        }
        let write = LedgerWrite::new().put_transaction(proposal.clone(), expectation);
        match self.store.commit(write).await? {
            CommitOutcome::Applied { .. } => {
                warn!(tx_id = %proposal.id(), reason = %reason, "rejected offline transfer");
                Ok(Some(match conflict {
                    Some(conflict) => SettlementOutcome::DoubleSpend {
                        transaction: proposal,
                        conflict,
                    },
                    None => SettlementOutcome::Rejected {
                        transaction: proposal,
                        reason,
                    },
                }))
            }
            CommitOutcome::Conflict(_) => Ok(None),
        }
    }

    // ========================================================================
    // PLANNING
    // ========================================================================

    async fn plan<'c>(
        &self,
        claim: &'c ClientClaim,
        proposal: &Transaction,
        now: u64,
    ) -> Result<LedgerWrite, Stop> {
        if proposal.token_ids().is_empty() {
            return Err(fail(FailureReason::Malformed("no tokens referenced".to_string())));
        }
        let unique: HashSet<&TokenId> = proposal.token_ids().iter().collect();
        if unique.len() != proposal.token_ids().len() {
            return Err(fail(FailureReason::Malformed("token referenced twice".to_string())));
        }
        if proposal.sender() == proposal.receiver() {
            return Err(fail(FailureReason::Malformed("sender is receiver".to_string())));
        }
        let sender = proposal
            .sender()
            .commitment()
            .map_err(|e| fail(FailureReason::Malformed(e.to_string())))?;

        let mut plan = Plan {
            sender,
            now,
            write: LedgerWrite::new(),
            created: BTreeMap::new(),
            consumed: HashSet::new(),
            producers: HashMap::new(),
        };
        for division in &claim.divisions {
            for child in division.children() {
                plan.producers.insert(*child.id(), division);
            }
        }

        let spend_cause = StatusCause::Transaction(*proposal.id());
        let mut total = Amount::ZERO;
        for token_id in proposal.token_ids() {
            let body = match self.store.get(token_id).await? {
                Some(record) => {
                    if record.status() != TokenStatus::Active {
                        return Err(self.consumed_stop(&record, now));
                    }
                    plan.write = std::mem::take(&mut plan.write).change_status(
                        *token_id,
                        TokenStatus::Active,
                        TokenStatus::Spent,
                        spend_cause,
                    );
                    plan.consumed.insert(*token_id);
                    record.token
                }
                None => {
                    self.introduce(&mut plan, token_id).await?;
                    let record = plan
                        .created
                        .get_mut(token_id)
                        .ok_or_else(|| fail(FailureReason::UnknownToken { token_id: *token_id }))?;
                    if record.status() != TokenStatus::Active {
                        return Err(invalid_division(token_id, "token is both divided and spent"));
                    }
                    record.token.set_status(TokenStatus::Spent);
                    record.cause = Some(spend_cause);
                    record.token.clone().with_status(TokenStatus::Active)
                }
            };

            let report = self
                .validator
                .validate_with_status(&body, TokenStatus::Active, Some(&plan.sender), now);
            if !report.valid {
                if !report.checks.ownership_valid && report.reasons.len() == 1 {
                    return Err(fail(FailureReason::OwnershipMismatch { token_id: *token_id }));
                }
                return Err(fail(FailureReason::TokenInvalid {
                    token_id: *token_id,
                    reasons: report.reasons,
                }));
            }

            total = total
                .checked_add(body.amount())
                .map_err(|e| fail(FailureReason::Malformed(e.to_string())))?;
        }

        if total != proposal.amount() {
            return Err(fail(FailureReason::AmountMismatch {
                expected: proposal.amount(),
                actual: total,
            }));
        }

        let mut write = plan.write;
        for (_, record) in plan.created {
            write = write.insert_token(record);
        }
        Ok(write)
    }

    /// Make `token_id` known to the plan by registering the chain of offline
    /// divisions that produced it, topmost first
    async fn introduce(&self, plan: &mut Plan<'_>, token_id: &TokenId) -> Result<(), Stop> {
        if plan.created.contains_key(token_id) {
            return Ok(());
        }

        let mut chain: Vec<&DivisionClaim> = Vec::new();
        let mut current = *token_id;
        loop {
            let division = *plan
                .producers
                .get(&current)
                .ok_or(fail(FailureReason::UnknownToken { token_id: current }))?;
            chain.push(division);
            if chain.len() > MAX_DIVISION_DEPTH {
                return Err(invalid_division(token_id, "division chain too deep"));
            }
            let parent = division.parent_id;
            if plan.created.contains_key(&parent) || self.store.get(&parent).await?.is_some() {
                break;
            }
            current = parent;
        }

        for division in chain.into_iter().rev() {
            self.register_division(plan, division).await?;
        }
        Ok(())
    }

    async fn register_division(&self, plan: &mut Plan<'_>, division: &DivisionClaim) -> Result<(), Stop> {
        let parent_id = division.parent_id;
        let cause = StatusCause::Division(division.request_id);

        if self.store.get_division(&division.request_id).await?.is_some() {
            return Err(invalid_division(&parent_id, "division request id already used"));
        }

        let parent = if let Some(record) = plan.created.get_mut(&parent_id) {
            if record.status() != TokenStatus::Active {
                return Err(invalid_division(&parent_id, "parent divided twice in one claim"));
            }
            record.token.set_status(TokenStatus::Divided);
            record.cause = Some(cause);
            record.token.clone()
        } else {
            let record = self
                .store
                .get(&parent_id)
                .await?
                .ok_or(fail(FailureReason::UnknownToken { token_id: parent_id }))?;
            if record.status() != TokenStatus::Active {
                return Err(self.consumed_stop(&record, plan.now));
            }
            if !plan.consumed.insert(parent_id) {
                return Err(invalid_division(&parent_id, "parent both spent and divided"));
            }
            plan.write = std::mem::take(&mut plan.write).change_status(
                parent_id,
                TokenStatus::Active,
                TokenStatus::Divided,
                cause,
            );
            record.token
        };

        self.check_division(division, &parent)?;

        plan.write = std::mem::take(&mut plan.write).insert_division(DivisionRecord {
            request_id: division.request_id,
            parent_id,
            payment_id: *division.payment.id(),
            change_id: division.change.as_ref().map(|c| *c.id()),
            ledger_ts: 0,
        });
        for child in division.children() {
            let body = child.clone().with_status(TokenStatus::Active);
            plan.created.insert(*child.id(), TokenRecord::new(body, None));
        }
        Ok(())
    }

    /// A division must conserve value, derive its child ids from the
    /// request, stay in whole minimum units and carry valid proofs
    fn check_division(&self, division: &DivisionClaim, parent: &OfflineToken) -> Result<(), Stop> {
        let parent_id = parent.id();
        let expected_payment = TokenId::for_child(parent_id, &division.request_id, ChildRole::Payment);
        if division.payment.id() != &expected_payment {
            return Err(invalid_division(parent_id, "payment child id not derived from request"));
        }
        if let Some(change) = &division.change {
            let expected_change = TokenId::for_child(parent_id, &division.request_id, ChildRole::Change);
            if change.id() != &expected_change {
                return Err(invalid_division(parent_id, "change child id not derived from request"));
            }
        }

        let amounts: Vec<Amount> = division.children().map(|c| c.amount()).collect();
        let sum = Amount::sum(amounts.iter())
            .map_err(|e| invalid_division(parent_id, &e.to_string()))?;
        if sum != parent.amount() {
            return Err(invalid_division(parent_id, "children do not sum to the parent amount"));
        }
        if division.change.is_none() != (division.payment.amount() == parent.amount()) {
            return Err(invalid_division(parent_id, "change child presence does not match amounts"));
        }
        let unit = self.config.min_division_unit;
        if amounts.iter().any(|a| a.is_zero() || !a.is_multiple_of(unit)) {
            return Err(invalid_division(parent_id, "child amount not a multiple of the minimum unit"));
        }

        for child in division.children() {
            if child.parent_token_id() != Some(parent_id) || child.owner_commitment() != parent.owner_commitment() {
                return Err(invalid_division(child.id(), "child does not descend from its parent"));
            }
            if let Err(reason) = self.validator.verify_lineage(child) {
                return Err(fail(FailureReason::TokenInvalid {
                    token_id: *child.id(),
                    reasons: vec![reason],
                }));
            }
        }
        Ok(())
    }

    fn consumed_stop(&self, record: &TokenRecord, now: u64) -> Stop {
        match (record.status(), record.cause) {
            (TokenStatus::Expired, _) => fail(FailureReason::TokenInvalid {
                token_id: *record.id(),
                reasons: vec![ValidationReason::Expired {
                    expires_at: record.token.expires_at(),
                    now,
                }],
            }),
            (_, Some(winner)) => Stop::DoubleSpend {
                token_id: *record.id(),
                winner,
            },
            (status, None) => fail(FailureReason::TokenInvalid {
                token_id: *record.id(),
                reasons: vec![ValidationReason::NotActive(status)],
            }),
        }
    }
}

/// Both signatures present and valid over the canonical transfer bytes
fn authenticate(transaction: &Transaction) -> Result<(), FailureReason> {
    if transaction.kind() != TransactionKind::OfflineTransfer {
        return Err(FailureReason::Malformed("not an offline transfer".to_string()));
    }
    if !transaction.has_both_signatures() {
        return Err(FailureReason::MissingSignature);
    }
    let sender_ok = transaction.verify_sender_signature().unwrap_or(false);
    let receiver_ok = transaction.verify_receiver_signature().unwrap_or(false);
    if !sender_ok || !receiver_ok {
        return Err(FailureReason::SignatureMismatch);
    }
    Ok(())
}

/// Rejection reported to the caller only; the ledger keeps no record of it
fn unrecorded_rejection(transaction: &Transaction, reason: FailureReason, now: u64) -> SettlementOutcome {
    let mut failed = transaction.as_proposal();
    failed.mark_failed(reason.clone(), now);
    SettlementOutcome::Rejected {
        transaction: failed,
        reason,
    }
}

/// Outcome for a transaction the ledger already holds in a terminal state
fn recorded_outcome(transaction: Transaction) -> SettlementOutcome {
    match (transaction.status(), transaction.failure().cloned()) {
        (TransactionStatus::Completed, _) => SettlementOutcome::AlreadySettled(transaction),
        (_, Some(FailureReason::DoubleSpend { token_id, winner })) => {
            let conflict = DoubleSpendConflict {
                token_id,
                rejected_transaction: *transaction.id(),
                winner,
            };
            SettlementOutcome::DoubleSpend {
                transaction,
                conflict,
            }
        }
        (_, Some(reason)) => SettlementOutcome::Rejected {
            transaction,
            reason,
        },
        (status, None) => SettlementOutcome::Rejected {
            transaction,
            reason: FailureReason::Malformed(format!("transaction is {}", status)),
        },
    }
}
