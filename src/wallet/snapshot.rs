// Wallet snapshot - everything a device must keep across restarts except
// its keys, which the device store holds separately

use crate::ledger::{ConflictDetector, DivisionRecord, TokenRecord, TransactionRecord};
use crate::transaction::{ClientClaim, DivisionClaim};
use crate::wallet::{PaymentOffer, WalletError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub tokens: Vec<TokenRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub divisions: Vec<DivisionRecord>,
    /// Offline divisions the ledger has not seen yet
    pub lineage: Vec<DivisionClaim>,
    pub pending_claims: Vec<ClientClaim>,
    pub open_offers: Vec<PaymentOffer>,
    pub detector: ConflictDetector,
    pub last_sync_timestamp: u64,
    pub needs_resync: bool,
}

impl WalletSnapshot {
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        postcard::from_bytes(bytes).map_err(|e| WalletError::StateError(e.to_string()))
    }
}
