// Engine error taxonomy
//
// Module errors stay precise; this folds them into the five kinds a caller
// acts on: fix the input, retry, resync, fund, or fix the configuration.

use crate::config::ConfigError;
use crate::gateway::OracleError;
use crate::ledger::StoreError;
use crate::retry::{RetryPolicyError, Retryable};
use crate::sync::{ReconcileError, SyncError};
use crate::token::{AmountError, DivisionError, IssueError};
use crate::transaction::{ProcessorError, SettlementError};
use crate::transport::TransportError;
use crate::wallet::WalletError;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// Lost a compare-and-set race; re-read and try again
    Race,
    /// The token was already consumed elsewhere; discard local state and resync
    DoubleSpend,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Race => f.write_str("race"),
            ConflictKind::DoubleSpend => f.write_str("double-spend"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed, expired, unsigned or unowned input
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict ({kind}): {detail}")]
    Conflict { kind: ConflictKind, detail: String },

    /// Minting against unconfirmed or already used funding; never retried
    #[error("Funding error: {0}")]
    Funding(String),

    /// An amount that cannot be represented exactly; never rounded
    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Transient infrastructure failure: {0}")]
    TransientInfrastructure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientInfrastructure(_)
                | EngineError::Conflict {
                    kind: ConflictKind::Race,
                    ..
                }
        )
    }

    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict {
                kind: ConflictKind::DoubleSpend,
                ..
            }
        )
    }

    fn validation(err: impl ToString) -> Self {
        EngineError::Validation(err.to_string())
    }

    fn transient(err: impl ToString) -> Self {
        EngineError::TransientInfrastructure(err.to_string())
    }

    fn race(err: impl ToString) -> Self {
        EngineError::Conflict {
            kind: ConflictKind::Race,
            detail: err.to_string(),
        }
    }

    fn double_spend(err: impl ToString) -> Self {
        EngineError::Conflict {
            kind: ConflictKind::DoubleSpend,
            detail: err.to_string(),
        }
    }
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        EngineError::is_retryable(self)
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IllegalTransition { .. } => EngineError::validation(err),
            _ => EngineError::transient(err),
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::UnknownTransaction(_) => EngineError::Funding(err.to_string()),
            OracleError::Rejected(_) => EngineError::validation(err),
            _ => EngineError::transient(err),
        }
    }
}

impl From<AmountError> for EngineError {
    fn from(err: AmountError) -> Self {
        EngineError::Arithmetic(err.to_string())
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

impl From<RetryPolicyError> for EngineError {
    fn from(err: RetryPolicyError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

impl From<IssueError> for EngineError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::FundingNotConfirmed { .. } => EngineError::Funding(err.to_string()),
            IssueError::Registry(_) | IssueError::MissingSigningKey(_) => {
                EngineError::Configuration(err.to_string())
            }
            IssueError::Oracle(inner) => inner.into(),
            IssueError::Store(inner) => inner.into(),
            _ => EngineError::validation(err),
        }
    }
}

impl From<DivisionError> for EngineError {
    fn from(err: DivisionError) -> Self {
        match err {
            DivisionError::AmountNotDivisible { .. } | DivisionError::Arithmetic(_) => {
                EngineError::Arithmetic(err.to_string())
            }
            DivisionError::Conflict { .. } => EngineError::double_spend(err),
            DivisionError::RetriesExhausted { .. } => EngineError::race(err),
            DivisionError::Store(inner) => inner.into(),
            _ => EngineError::validation(err),
        }
    }
}

impl From<SettlementError> for EngineError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Store(inner) => inner.into(),
            SettlementError::RetriesExhausted { .. } => EngineError::race(err),
        }
    }
}

impl From<ProcessorError> for EngineError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::Arithmetic(inner) => inner.into(),
            ProcessorError::Oracle(inner) => inner.into(),
            ProcessorError::Store(inner) => inner.into(),
            ProcessorError::Settlement(inner) => inner.into(),
            ProcessorError::RetriesExhausted { .. } => EngineError::race(err),
            ProcessorError::TokenUnavailable { .. } => EngineError::double_spend(err),
            _ => EngineError::validation(err),
        }
    }
}

impl From<ReconcileError> for EngineError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Store(inner) => inner.into(),
        }
    }
}

impl From<SyncError> for EngineError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Timeout { .. } | SyncError::Unavailable(_) | SyncError::Remote(_) | SyncError::Cancelled => {
                EngineError::transient(err)
            }
            SyncError::InvalidConfig(_) => EngineError::Configuration(err.to_string()),
            _ => EngineError::validation(err),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidConfig(_) => EngineError::Configuration(err.to_string()),
            TransportError::PayloadTooLarge { .. } | TransportError::SerializationError(_) => {
                EngineError::validation(err)
            }
            _ => EngineError::transient(err),
        }
    }
}

impl From<WalletError> for EngineError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::DoubleSpend(_) => EngineError::double_spend(err),
            WalletError::CacheConflict(_) => EngineError::race(err),
            WalletError::Division(inner) => inner.into(),
            WalletError::Arithmetic(inner) => inner.into(),
            WalletError::Store(inner) => inner.into(),
            WalletError::Oracle(inner) => inner.into(),
            WalletError::Transport(inner) => inner.into(),
            WalletError::Storage(_) => EngineError::transient(err),
            _ => EngineError::validation(err),
        }
    }
}
