// Divider - splits a token into a payment child and a change child
//
// Runs against whatever ledger view the caller holds: the authoritative
// store online, or a wallet's cache offline. Either way the parent moves
// active -> divided in the same atomic commit that inserts the children.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::identity::{Keypair, OwnerCommitment, Signer};
use crate::ledger::{
    CommitConflict, CommitOutcome, DivisionRecord, LedgerWrite, StatusCause, StoreError,
    TokenLedgerStore, TokenRecord,
};
use crate::token::canonical::proof_signing_bytes;
use crate::token::{
    Amount, AmountError, ChildRole, DivisionProof, DivisionRequestId, OfflineToken, TokenDraft,
    TokenId, TokenStatus, ValidationReport, Validator,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DivisionError {
    #[error("Token failed validation: {0}")]
    InvalidToken(ValidationReport),

    #[error("Requested {requested} but token holds {available}")]
    InvalidAmount { requested: Amount, available: Amount },

    #[error("Amount {amount} is not a multiple of the minimum unit {unit}")]
    AmountNotDivisible { amount: Amount, unit: Amount },

    #[error("Token {0} is unknown to this ledger")]
    UnknownToken(TokenId),

    #[error("Token {token_id} is already {status}")]
    Conflict {
        token_id: TokenId,
        status: TokenStatus,
        cause: Option<StatusCause>,
    },

    #[error("Division request {0} was already used for a different token")]
    RequestMismatch(DivisionRequestId),

    #[error("Division lost {attempts} compare-and-set races")]
    RetriesExhausted { attempts: u32 },

    #[error("Arithmetic error: {0}")]
    Arithmetic(#[from] AmountError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Children produced by one division request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DivisionResult {
    pub request_id: DivisionRequestId,
    pub parent_id: TokenId,
    pub payment: OfflineToken,
    /// Absent when the requested amount equals the parent amount
    pub change: Option<OfflineToken>,
}

impl DivisionResult {
    pub fn is_exact(&self) -> bool {
        self.change.is_none()
    }

    pub fn children(&self) -> impl Iterator<Item = &OfflineToken> {
        std::iter::once(&self.payment).chain(self.change.iter())
    }
}

/// Build the signed children of `parent` for one request. Pure: no ledger
/// access and no amount policy beyond exact subtraction.
pub fn build_children(
    holder: &Keypair,
    parent: &OfflineToken,
    requested: Amount,
    request_id: DivisionRequestId,
    now_millis: u64,
) -> Result<DivisionResult, AmountError> {
    let change_amount = parent.amount().checked_sub(requested)?;
    let payment = build_child(holder, parent, requested, request_id, ChildRole::Payment, now_millis);
    let change = (!change_amount.is_zero()).then(|| {
        build_child(holder, parent, change_amount, request_id, ChildRole::Change, now_millis)
    });
    Ok(DivisionResult {
        request_id,
        parent_id: *parent.id(),
        payment,
        change,
    })
}

fn build_child(
    holder: &Keypair,
    parent: &OfflineToken,
    amount: Amount,
    request_id: DivisionRequestId,
    role: ChildRole,
    now_millis: u64,
) -> OfflineToken {
    let owner = OwnerCommitment::from_public_key(&holder.public_key());
    let child_id = TokenId::for_child(parent.id(), &request_id, role);

    let proof_bytes = proof_signing_bytes(
        parent.id(),
        &child_id,
        amount,
        &owner,
        &holder.public_key(),
        now_millis,
    );
    let proof = DivisionProof {
        parent_id: *parent.id(),
        child_id,
        amount,
        owner_commitment: owner,
        holder_key: holder.public_key(),
        created_at: now_millis,
        signature: Signer::sign(holder, &proof_bytes),
    };

    let mut proofs = parent.division_proofs().to_vec();
    proofs.push(proof);

    let draft = TokenDraft {
        id: child_id,
        amount,
        issuer_key_id: parent.issuer_key_id().clone(),
        issued_at: now_millis,
        expires_at: parent.expires_at(),
        owner_commitment: owner,
    };
    let signature = Signer::sign(holder, &draft.signing_bytes());
    draft.into_child(signature, *parent.id(), proofs, parent.root_attestation())
}

pub struct Divider {
    validator: Validator,
    store: Arc<dyn TokenLedgerStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Divider {
    pub fn new(
        validator: Validator,
        store: Arc<dyn TokenLedgerStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            validator,
            store,
            clock,
            config,
        }
    }

    /// Check the amount policy: positive, within the token, and every child
    /// an exact multiple of the minimum unit
    pub fn check_amounts(&self, available: Amount, requested: Amount) -> Result<(), DivisionError> {
        if requested.is_zero() || requested > available {
            return Err(DivisionError::InvalidAmount {
                requested,
                available,
            });
        }
        let unit = self.config.min_division_unit;
        let change = available.checked_sub(requested)?;
        for amount in [requested, change] {
            if !amount.is_zero() && !amount.is_multiple_of(unit) {
                return Err(DivisionError::AmountNotDivisible { amount, unit });
            }
        }
        Ok(())
    }

    /// Divide `token` held by `holder`. Repeating a request id returns the
    /// children it produced the first time.
    pub async fn divide(
        &self,
        holder: &Keypair,
        token: &OfflineToken,
        requested: Amount,
        request_id: DivisionRequestId,
    ) -> Result<DivisionResult, DivisionError> {
        if let Some(done) = self.completed(token.id(), &request_id).await? {
            return Ok(done);
        }

        let holder_commitment = OwnerCommitment::from_public_key(&holder.public_key());
        let max_attempts = self.config.cas_retry_limit.max(1);

        for attempt in 1..=max_attempts {
            let now = self.clock.now_millis();
            let report = self
                .validator
                .validate_in_store(self.store.as_ref(), token, Some(&holder_commitment), now)
                .await?;
            if !report.checks.not_spent {
                return Err(self.conflict_for(token.id()).await?);
            }
            if !report.valid {
                return Err(DivisionError::InvalidToken(report));
            }
            self.check_amounts(token.amount(), requested)?;

            let result = build_children(holder, token, requested, request_id, now)?;
            let mut write = LedgerWrite::new()
                .change_status(
                    *token.id(),
                    TokenStatus::Active,
                    TokenStatus::Divided,
                    StatusCause::Division(request_id),
                )
                .insert_division(DivisionRecord {
                    request_id,
                    parent_id: *token.id(),
                    payment_id: *result.payment.id(),
                    change_id: result.change.as_ref().map(|c| *c.id()),
                    ledger_ts: 0,
                });
            for child in result.children() {
                write = write.insert_token(TokenRecord::new(child.clone(), None));
            }

            match self.store.commit(write).await? {
                CommitOutcome::Applied { ledger_ts } => {
                    info!(
                        token_id = %token.id(),
                        request_id = %request_id,
                        payment = %result.payment.amount(),
                        change = ?result.change.as_ref().map(|c| c.amount()),
                        ledger_ts,
                        "divided token"
                    );
                    return Ok(result);
                }
                CommitOutcome::Conflict(CommitConflict::TokenStatus { actual: None, .. }) => {
                    return Err(DivisionError::UnknownToken(*token.id()));
                }
                CommitOutcome::Conflict(conflict) => {
                    warn!(token_id = %token.id(), request_id = %request_id, attempt, ?conflict, "division lost race");
                    if let Some(done) = self.completed(token.id(), &request_id).await? {
                        return Ok(done);
                    }
                }
            }
        }

        Err(DivisionError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    /// The stored result of `request_id`, if that request already committed
    async fn completed(
        &self,
        parent_id: &TokenId,
        request_id: &DivisionRequestId,
    ) -> Result<Option<DivisionResult>, DivisionError> {
        let Some(record) = self.store.get_division(request_id).await? else {
            return Ok(None);
        };
        if &record.parent_id != parent_id {
            return Err(DivisionError::RequestMismatch(*request_id));
        }
        debug!(request_id = %request_id, "division request already applied");

        let payment = self.load(&record.payment_id).await?;
        let change = match &record.change_id {
            Some(id) => Some(self.load(id).await?),
            None => None,
        };
        Ok(Some(DivisionResult {
            request_id: *request_id,
            parent_id: record.parent_id,
            payment,
            change,
        }))
    }

    async fn load(&self, id: &TokenId) -> Result<OfflineToken, DivisionError> {
        self.store
            .get(id)
            .await?
            .map(|r| r.token)
            .ok_or_else(|| StoreError::Backend(format!("division child {} missing", id)).into())
    }

    async fn conflict_for(&self, id: &TokenId) -> Result<DivisionError, DivisionError> {
        match self.store.get(id).await? {
            Some(record) => Ok(DivisionError::Conflict {
                token_id: *id,
                status: record.status(),
                cause: record.cause,
            }),
            None => Ok(DivisionError::UnknownToken(*id)),
        }
    }
}
