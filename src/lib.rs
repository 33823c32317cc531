// offlinepay - offline bearer tokens with division, a transaction state
// machine and double-spend reconciliation
//
// Layout:
//   identity     Ed25519 keys, wallet addresses, owner commitments, issuer registry
//   token        amounts, tokens, issuance, validation, division
//   transaction  transfer records, state machine, settlement, online processor
//   ledger       authoritative store contract and double-spend bookkeeping
//   storage      sled-backed ledger and device persistence
//   gateway      blockchain oracle seam and confirmation polling
//   sync         device <-> ledger reconciliation protocol
//   transport    device <-> device envelopes and links
//   wallet       the holder device
//   service      ledger-side facade

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod retry;
pub mod service;
pub mod storage;
pub mod sync;
pub mod token;
pub mod transaction;
pub mod transport;
pub mod wallet;

pub use error::{ConflictKind, EngineError};
pub use service::OfflineTokenService;
