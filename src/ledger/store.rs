// Token ledger store - the durable record every settlement decision is made
// against. The only mutation primitive is `commit`, an atomic multi-entity
// compare-and-set: every expectation holds and every write lands, or nothing
// changes.

use crate::gateway::FundingRef;
use crate::retry::Retryable;
use crate::token::{DivisionRequestId, OfflineToken, TokenId, TokenStatus};
use crate::transaction::{Transaction, TransactionId, TransactionStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Illegal status transition for token {token_id}: {from} -> {to}")]
    IllegalTransition {
        token_id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    },
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Backend(_))
    }
}

/// What moved a token out of `active`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCause {
    Transaction(TransactionId),
    Division(DivisionRequestId),
    Expiry,
}

impl fmt::Display for StatusCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCause::Transaction(id) => write!(f, "transaction {}", id),
            StatusCause::Division(id) => write!(f, "division {}", id),
            StatusCause::Expiry => write!(f, "expiry"),
        }
    }
}

/// A token as the ledger knows it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token body; its status field is the ledger status
    pub token: OfflineToken,
    pub cause: Option<StatusCause>,
    /// Ledger timestamp of the last write to this record
    pub ledger_ts: u64,
}

impl TokenRecord {
    pub fn new(token: OfflineToken, cause: Option<StatusCause>) -> Self {
        Self {
            token,
            cause,
            ledger_ts: 0,
        }
    }

    pub fn id(&self) -> &TokenId {
        self.token.id()
    }

    pub fn status(&self) -> TokenStatus {
        self.token.status()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub ledger_ts: u64,
}

/// Parent/children link written once per division request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionRecord {
    pub request_id: DivisionRequestId,
    pub parent_id: TokenId,
    pub payment_id: TokenId,
    pub change_id: Option<TokenId>,
    pub ledger_ts: u64,
}

/// Expected-then-new status for one existing token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub token_id: TokenId,
    pub expected: TokenStatus,
    pub new: TokenStatus,
    pub cause: StatusCause,
}

/// Precondition on the transaction record touched by a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionExpectation {
    Absent,
    InStatus(TransactionStatus),
    AbsentOrPending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionWrite {
    pub transaction: Transaction,
    pub expectation: TransactionExpectation,
}

/// Everything one atomic commit reads-checks-writes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerWrite {
    pub status_changes: Vec<StatusChange>,
    /// Inserted only if no token with the same id exists
    pub new_tokens: Vec<TokenRecord>,
    /// Inserted only if the request id is unused
    pub divisions: Vec<DivisionRecord>,
    pub transaction: Option<TransactionWrite>,
}

impl LedgerWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_status(
        mut self,
        token_id: TokenId,
        expected: TokenStatus,
        new: TokenStatus,
        cause: StatusCause,
    ) -> Self {
        self.status_changes.push(StatusChange {
            token_id,
            expected,
            new,
            cause,
        });
        self
    }

    pub fn insert_token(mut self, record: TokenRecord) -> Self {
        self.new_tokens.push(record);
        self
    }

    pub fn insert_division(mut self, record: DivisionRecord) -> Self {
        self.divisions.push(record);
        self
    }

    pub fn put_transaction(mut self, transaction: Transaction, expectation: TransactionExpectation) -> Self {
        self.transaction = Some(TransactionWrite {
            transaction,
            expectation,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status_changes.is_empty()
            && self.new_tokens.is_empty()
            && self.divisions.is_empty()
            && self.transaction.is_none()
    }

    /// Reject writes that would move a token backwards before touching the store
    pub fn check_transitions(&self) -> Result<(), StoreError> {
        for change in &self.status_changes {
            if !change.expected.can_transition_to(change.new) {
                return Err(StoreError::IllegalTransition {
                    token_id: change.token_id,
                    from: change.expected,
                    to: change.new,
                });
            }
        }
        Ok(())
    }
}

/// Which precondition of a commit did not hold
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitConflict {
    TokenStatus {
        token_id: TokenId,
        expected: TokenStatus,
        actual: Option<TokenStatus>,
    },
    TokenExists(TokenId),
    DivisionExists(DivisionRequestId),
    Transaction {
        transaction_id: TransactionId,
        actual: Option<TransactionStatus>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { ledger_ts: u64 },
    Conflict(CommitConflict),
}

impl CommitOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommitOutcome::Applied { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MintRecordOutcome {
    Inserted { ledger_ts: u64 },
    /// A token was already minted for this funding reference
    Existing(TokenRecord),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { ledger_ts: u64 },
    Existing(TransactionRecord),
}

/// Every record written after a ledger timestamp
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDelta {
    pub tokens: Vec<TokenRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub divisions: Vec<DivisionRecord>,
    /// Highest ledger timestamp the store has issued
    pub last_ledger_ts: u64,
}

impl LedgerDelta {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.transactions.is_empty() && self.divisions.is_empty()
    }
}

/// First unmet precondition of `write`, read through the given lookups.
/// Shared by every backend so they agree on what a conflict is.
pub(crate) fn find_conflict<E>(
    write: &LedgerWrite,
    mut token_status: impl FnMut(&TokenId) -> Result<Option<TokenStatus>, E>,
    mut transaction_status: impl FnMut(&TransactionId) -> Result<Option<TransactionStatus>, E>,
    mut division_exists: impl FnMut(&DivisionRequestId) -> Result<bool, E>,
) -> Result<Option<CommitConflict>, E> {
    for change in &write.status_changes {
        let actual = token_status(&change.token_id)?;
        if actual != Some(change.expected) {
            return Ok(Some(CommitConflict::TokenStatus {
                token_id: change.token_id,
                expected: change.expected,
                actual,
            }));
        }
    }

    for record in &write.new_tokens {
        if token_status(record.id())?.is_some() {
            return Ok(Some(CommitConflict::TokenExists(*record.id())));
        }
    }

    for division in &write.divisions {
        if division_exists(&division.request_id)? {
            return Ok(Some(CommitConflict::DivisionExists(division.request_id)));
        }
    }

    if let Some(tx_write) = &write.transaction {
        let id = *tx_write.transaction.id();
        let actual = transaction_status(&id)?;
        let holds = match tx_write.expectation {
            TransactionExpectation::Absent => actual.is_none(),
            TransactionExpectation::InStatus(expected) => actual == Some(expected),
            TransactionExpectation::AbsentOrPending => {
                matches!(actual, None | Some(TransactionStatus::Pending))
            }
        };
        if !holds {
            return Ok(Some(CommitConflict::Transaction {
                transaction_id: id,
                actual,
            }));
        }
    }

    Ok(None)
}

/// Next ledger timestamp: wall clock, but never equal to or behind the last one
pub(crate) fn next_ledger_ts(last: u64, now_millis: u64) -> u64 {
    now_millis.max(last.saturating_add(1))
}

/// Durable ledger with atomic compare-and-set writes
#[async_trait]
pub trait TokenLedgerStore: Send + Sync {
    async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>, StoreError>;

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError>;

    async fn get_division(&self, id: &DivisionRequestId) -> Result<Option<DivisionRecord>, StoreError>;

    async fn get_mint(&self, funding: &FundingRef) -> Result<Option<TokenRecord>, StoreError>;

    /// Apply every part of `write` atomically, or report the first failed
    /// precondition and change nothing
    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, StoreError>;

    /// Insert a minted token and its purchase transaction unless the funding
    /// reference was already used
    async fn record_mint(
        &self,
        funding: &FundingRef,
        token: OfflineToken,
        purchase: Transaction,
    ) -> Result<MintRecordOutcome, StoreError>;

    async fn changes_since(&self, since: u64) -> Result<LedgerDelta, StoreError>;

    async fn tokens_with_status(&self, status: TokenStatus) -> Result<Vec<TokenRecord>, StoreError>;

    /// Single-token compare-and-set
    async fn compare_and_set_status(
        &self,
        id: &TokenId,
        expected: TokenStatus,
        new: TokenStatus,
        cause: StatusCause,
    ) -> Result<bool, StoreError> {
        let write = LedgerWrite::new().change_status(*id, expected, new, cause);
        Ok(self.commit(write).await?.is_applied())
    }

    /// Insert a transaction if its id is unused; otherwise hand back the
    /// stored one untouched
    async fn append_transaction(&self, transaction: Transaction) -> Result<AppendOutcome, StoreError> {
        let id = *transaction.id();
        let write = LedgerWrite::new().put_transaction(transaction, TransactionExpectation::Absent);
        match self.commit(write).await? {
            CommitOutcome::Applied { ledger_ts } => Ok(AppendOutcome::Inserted { ledger_ts }),
            CommitOutcome::Conflict(_) => match self.get_transaction(&id).await? {
                Some(existing) => Ok(AppendOutcome::Existing(existing)),
                None => Err(StoreError::Backend(format!(
                    "transaction {} reported present but not found",
                    id
                ))),
            },
        }
    }
}
