// Ledger module - the authoritative token/transaction record, its atomic
// compare-and-set contract, and double-spend bookkeeping

mod conflict;
mod memory;
mod store;
mod timed;

pub use conflict::{ConflictDetector, ConflictError, DoubleSpendConflict, SpendingClaim};
pub use memory::MemoryLedgerStore;
pub(crate) use store::{find_conflict, next_ledger_ts};
pub use store::{
    AppendOutcome, CommitConflict, CommitOutcome, DivisionRecord, LedgerDelta, LedgerWrite,
    MintRecordOutcome, StatusCause, StatusChange, StoreError, TokenLedgerStore, TokenRecord,
    TransactionExpectation, TransactionRecord, TransactionWrite,
};
pub use timed::TimeoutStore;
