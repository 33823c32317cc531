// Transaction state machine
//
//   pending -> completed | failed | cancelled
//
// Every non-pending state is terminal. Events against a terminal
// transaction change nothing and report the state it is already in.

use crate::transaction::{FailureReason, Transaction, TransactionKind, TransactionStatus};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Offline transfer needs both sender and receiver signatures")]
    MissingSignature,

    #[error("Signature does not match the transaction")]
    SignatureMismatch,

    #[error("Event {event} does not apply to {kind:?} transactions")]
    WrongKind {
        event: &'static str,
        kind: TransactionKind,
    },
}

/// Something that happened to a pending transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Both parties signed and the referenced tokens were spent in the same commit
    TokensSpent { at: u64 },
    ConfirmationsObserved { confirmations: u64, required: u64, at: u64 },
    Failed { reason: FailureReason, at: u64 },
    /// One submission or polling round failed; fails the transaction once
    /// the budget is spent
    AttemptFailed { max_attempts: u32, at: u64 },
    Cancelled { at: u64 },
}

impl TransactionEvent {
    fn name(&self) -> &'static str {
        match self {
            TransactionEvent::TokensSpent { .. } => "tokens_spent",
            TransactionEvent::ConfirmationsObserved { .. } => "confirmations_observed",
            TransactionEvent::Failed { .. } => "failed",
            TransactionEvent::AttemptFailed { .. } => "attempt_failed",
            TransactionEvent::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The transaction moved to this status
    Moved(TransactionStatus),
    /// Nothing changed; the transaction is still in this status
    Unchanged(TransactionStatus),
}

impl Transition {
    pub fn status(&self) -> TransactionStatus {
        match self {
            Transition::Moved(s) | Transition::Unchanged(s) => *s,
        }
    }

    pub fn is_moved(&self) -> bool {
        matches!(self, Transition::Moved(_))
    }
}

impl Transaction {
    /// Apply `event`. Preconditions are checked here; side effects on tokens
    /// are the caller's to commit atomically with the new state.
    pub fn apply(&mut self, event: TransactionEvent) -> Result<Transition, TransitionError> {
        if self.status().is_terminal() {
            return Ok(Transition::Unchanged(self.status()));
        }

        match event {
            TransactionEvent::TokensSpent { at } => {
                if self.kind() != TransactionKind::OfflineTransfer {
                    return Err(TransitionError::WrongKind {
                        event: "tokens_spent",
                        kind: self.kind(),
                    });
                }
                if !self.has_both_signatures() {
                    return Err(TransitionError::MissingSignature);
                }
                let sender_ok = self.verify_sender_signature().unwrap_or(false);
                let receiver_ok = self.verify_receiver_signature().unwrap_or(false);
                if !sender_ok || !receiver_ok {
                    return Err(TransitionError::SignatureMismatch);
                }
                self.mark_completed(at);
                Ok(Transition::Moved(TransactionStatus::Completed))
            }
            TransactionEvent::ConfirmationsObserved {
                confirmations,
                required,
                at,
            } => {
                if !self.kind().is_chain_confirmed() {
                    return Err(TransitionError::WrongKind {
                        event: event.name(),
                        kind: self.kind(),
                    });
                }
                if confirmations >= required {
                    self.mark_completed(at);
                    Ok(Transition::Moved(TransactionStatus::Completed))
                } else {
                    Ok(Transition::Unchanged(TransactionStatus::Pending))
                }
            }
            TransactionEvent::Failed { reason, at } => {
                self.mark_failed(reason, at);
                Ok(Transition::Moved(TransactionStatus::Failed))
            }
            TransactionEvent::AttemptFailed { max_attempts, at } => {
                let attempts = self.record_attempt();
                if attempts >= max_attempts {
                    self.mark_failed(FailureReason::RetryBudgetExhausted { attempts }, at);
                    Ok(Transition::Moved(TransactionStatus::Failed))
                } else {
                    Ok(Transition::Unchanged(TransactionStatus::Pending))
                }
            }
            TransactionEvent::Cancelled { at } => {
                self.mark_cancelled(at);
                Ok(Transition::Moved(TransactionStatus::Cancelled))
            }
        }
    }
}
