// Transaction module - transfer records, the pending -> terminal state
// machine, offline settlement and the online processor

mod machine;
mod model;
mod processor;
mod settlement;

pub use machine::{TransactionEvent, Transition, TransitionError};
pub use model::{
    FailureReason, Transaction, TransactionBuildError, TransactionBuilder, TransactionId,
    TransactionKind, TransactionStatus,
};
pub use processor::{
    ProcessorError, ProcessorEvent, ProcessorStats, TransactionProcessor, TransactionStatusView,
};
pub use settlement::{
    ClientClaim, DivisionClaim, Settlement, SettlementError, SettlementOutcome,
};
