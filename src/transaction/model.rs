use crate::gateway::ChainTxHash;
use crate::identity::{AddressError, Keypair, Signature, Signer, WalletAddress};
use crate::ledger::StatusCause;
use crate::token::canonical::transaction_fields;
use crate::token::{Amount, TokenId, ValidationReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Transaction id - also the idempotency key of every claim
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    OfflineTransfer,
    OnlineTransfer,
    TokenPurchase,
    TokenRedemption,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::OfflineTransfer => "offline_transfer",
            TransactionKind::OnlineTransfer => "online_transfer",
            TransactionKind::TokenPurchase => "token_purchase",
            TransactionKind::TokenRedemption => "token_redemption",
        }
    }

    /// Kinds that complete on chain confirmations rather than co-signatures
    pub fn is_chain_confirmed(&self) -> bool {
        !matches!(self, TransactionKind::OfflineTransfer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a transaction ended up failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    TokenInvalid {
        token_id: TokenId,
        reasons: Vec<ValidationReason>,
    },
    MissingSignature,
    SignatureMismatch,
    AmountMismatch {
        expected: Amount,
        actual: Amount,
    },
    OwnershipMismatch {
        token_id: TokenId,
    },
    UnknownToken {
        token_id: TokenId,
    },
    InvalidDivision {
        token_id: TokenId,
        detail: String,
    },
    DoubleSpend {
        token_id: TokenId,
        winner: StatusCause,
    },
    RetryBudgetExhausted {
        attempts: u32,
    },
    /// The chain refused the submitted payload
    ChainRejected(String),
    Malformed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TokenInvalid { token_id, reasons } => {
                write!(f, "token {} failed validation: {:?}", token_id, reasons)
            }
            FailureReason::MissingSignature => write!(f, "missing sender or receiver signature"),
            FailureReason::SignatureMismatch => write!(f, "signature does not match transaction"),
            FailureReason::AmountMismatch { expected, actual } => {
                write!(f, "tokens sum to {} but transaction amount is {}", actual, expected)
            }
            FailureReason::OwnershipMismatch { token_id } => {
                write!(f, "token {} is not owned by the sender", token_id)
            }
            FailureReason::UnknownToken { token_id } => {
                write!(f, "token {} is unknown to the ledger and no division produces it", token_id)
            }
            FailureReason::InvalidDivision { token_id, detail } => {
                write!(f, "division producing token {} is invalid: {}", token_id, detail)
            }
            FailureReason::DoubleSpend { token_id, winner } => {
                write!(f, "token {} already consumed by {}", token_id, winner)
            }
            FailureReason::RetryBudgetExhausted { attempts } => {
                write!(f, "retry budget exhausted after {} attempts", attempts)
            }
            FailureReason::ChainRejected(detail) => write!(f, "chain rejected submission: {}", detail),
            FailureReason::Malformed(detail) => write!(f, "malformed transaction: {}", detail),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransactionBuildError {
    #[error("Missing sender keypair")]
    MissingSender,

    #[error("Missing receiver address")]
    MissingReceiver,

    #[error("Missing amount")]
    MissingAmount,

    #[error("Amount cannot be zero")]
    ZeroAmount,

    #[error("Self-payment not allowed")]
    SelfPayment,
}

/// A value transfer tracked from creation to a terminal state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    sender: WalletAddress,
    receiver: WalletAddress,
    amount: Amount,
    status: TransactionStatus,
    token_ids: Vec<TokenId>,
    sender_signature: Option<Signature>,
    receiver_signature: Option<Signature>,
    blockchain_tx_hash: Option<ChainTxHash>,
    created_at: u64,
    completed_at: Option<u64>,
    failure: Option<FailureReason>,
    attempts: u32,
    /// Diagnostic only; never signed and never read by settlement
    metadata: BTreeMap<String, String>,
}

impl Transaction {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn sender(&self) -> &WalletAddress {
        &self.sender
    }

    pub fn receiver(&self) -> &WalletAddress {
        &self.receiver
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn token_ids(&self) -> &[TokenId] {
        &self.token_ids
    }

    pub fn sender_signature(&self) -> Option<&Signature> {
        self.sender_signature.as_ref()
    }

    pub fn receiver_signature(&self) -> Option<&Signature> {
        self.receiver_signature.as_ref()
    }

    pub fn blockchain_tx_hash(&self) -> Option<&ChainTxHash> {
        self.blockchain_tx_hash.as_ref()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<u64> {
        self.completed_at
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Canonical bytes both parties sign. Token ids are sorted so the
    /// order a device listed them in does not change the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut ids: Vec<String> = self.token_ids.iter().map(|id| id.to_hex()).collect();
        ids.sort();
        transaction_fields()
            .field("id", self.id)
            .field("kind", self.kind.as_str())
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("amount", self.amount)
            .field("tokens", ids.join(","))
            .field("created_at", self.created_at)
            .to_bytes()
    }

    pub fn verify_sender_signature(&self) -> Result<bool, AddressError> {
        let Some(signature) = &self.sender_signature else {
            return Ok(false);
        };
        let key = self.sender.public_key()?;
        Ok(Signer::verify(&key, &self.signing_bytes(), signature))
    }

    pub fn verify_receiver_signature(&self) -> Result<bool, AddressError> {
        let Some(signature) = &self.receiver_signature else {
            return Ok(false);
        };
        let key = self.receiver.public_key()?;
        Ok(Signer::verify(&key, &self.signing_bytes(), signature))
    }

    pub fn has_both_signatures(&self) -> bool {
        self.sender_signature.is_some() && self.receiver_signature.is_some()
    }

    /// Receiver acknowledgement over the same canonical bytes
    pub fn countersign(&mut self, receiver: &Keypair) -> Signature {
        let signature = Signer::sign(receiver, &self.signing_bytes());
        self.receiver_signature = Some(signature.clone());
        signature
    }

    pub fn attach_receiver_signature(&mut self, signature: Signature) {
        self.receiver_signature = Some(signature);
    }

    pub(crate) fn set_blockchain_tx_hash(&mut self, hash: ChainTxHash) {
        self.blockchain_tx_hash = Some(hash);
    }

    pub(crate) fn mark_completed(&mut self, at: u64) {
        self.status = TransactionStatus::Completed;
        self.completed_at = Some(at);
    }

    pub(crate) fn mark_failed(&mut self, reason: FailureReason, at: u64) {
        self.status = TransactionStatus::Failed;
        self.failure = Some(reason);
        self.completed_at = Some(at);
    }

    pub(crate) fn mark_cancelled(&mut self, at: u64) {
        self.status = TransactionStatus::Cancelled;
        self.completed_at = Some(at);
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Copy of this transaction as a fresh, unsettled proposal. Client
    /// supplied status fields are never trusted by the ledger.
    pub(crate) fn as_proposal(&self) -> Transaction {
        let mut tx = self.clone();
        tx.status = TransactionStatus::Pending;
        tx.completed_at = None;
        tx.failure = None;
        tx.attempts = 0;
        tx
    }
}

/// Builder for signed transactions
pub struct TransactionBuilder<'a> {
    kind: TransactionKind,
    sender: Option<&'a Keypair>,
    receiver: Option<WalletAddress>,
    amount: Option<Amount>,
    token_ids: Vec<TokenId>,
    created_at: Option<u64>,
    id: Option<TransactionId>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            sender: None,
            receiver: None,
            amount: None,
            token_ids: Vec::new(),
            created_at: None,
            id: None,
        }
    }

    pub fn offline_transfer() -> Self {
        Self::new(TransactionKind::OfflineTransfer)
    }

    pub fn sender(mut self, keypair: &'a Keypair) -> Self {
        self.sender = Some(keypair);
        self
    }

    pub fn receiver(mut self, address: WalletAddress) -> Self {
        self.receiver = Some(address);
        self
    }

    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn tokens<I: IntoIterator<Item = TokenId>>(mut self, ids: I) -> Self {
        self.token_ids.extend(ids);
        self
    }

    /// Device-local creation time. Signed, but never used for ordering.
    pub fn created_at(mut self, millis: u64) -> Self {
        self.created_at = Some(millis);
        self
    }

    pub fn id(mut self, id: TransactionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Build a pending transaction carrying the sender signature
    pub fn build(self) -> Result<Transaction, TransactionBuildError> {
        let sender_keypair = self.sender.ok_or(TransactionBuildError::MissingSender)?;
        let receiver = self.receiver.ok_or(TransactionBuildError::MissingReceiver)?;
        let amount = self.amount.ok_or(TransactionBuildError::MissingAmount)?;

        if amount.is_zero() {
            return Err(TransactionBuildError::ZeroAmount);
        }

        let sender = WalletAddress::from_public_key(&sender_keypair.public_key());
        if sender == receiver && self.kind == TransactionKind::OfflineTransfer {
            return Err(TransactionBuildError::SelfPayment);
        }

        let mut tx = Transaction {
            id: self.id.unwrap_or_else(TransactionId::generate),
            kind: self.kind,
            sender,
            receiver,
            amount,
            status: TransactionStatus::Pending,
            token_ids: self.token_ids,
            sender_signature: None,
            receiver_signature: None,
            blockchain_tx_hash: None,
            created_at: self.created_at.unwrap_or(0),
            completed_at: None,
            failure: None,
            attempts: 0,
            metadata: BTreeMap::new(),
        };
        tx.sender_signature = Some(Signer::sign(sender_keypair, &tx.signing_bytes()));
        Ok(tx)
    }
}
