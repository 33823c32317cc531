// Offline payment messages exchanged between payer and payee

use crate::identity::Signature;
use crate::token::{Amount, OfflineToken};
use crate::transaction::{ClientClaim, DivisionClaim, Transaction, TransactionId};
use serde::{Deserialize, Serialize};

/// A sender-signed transfer with everything the payee needs to check it
/// offline and later prove it to the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOffer {
    pub transaction: Transaction,
    /// Bodies of the tokens listed in the transaction, in the same order
    pub tokens: Vec<OfflineToken>,
    /// Offline divisions that produced any of `tokens`
    pub divisions: Vec<DivisionClaim>,
}

impl PaymentOffer {
    pub fn transaction_id(&self) -> &TransactionId {
        self.transaction.id()
    }

    pub fn amount(&self) -> Amount {
        self.transaction.amount()
    }

    /// The settlement claim for this offer, carrying the countersigned
    /// copy of its transaction
    pub fn into_signed_claim(self, transaction: Transaction) -> ClientClaim {
        ClientClaim {
            transaction,
            tokens: self.tokens,
            divisions: self.divisions,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAcceptance {
    pub transaction_id: TransactionId,
    pub receiver_signature: Signature,
}
