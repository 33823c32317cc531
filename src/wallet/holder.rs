// Wallet - a holder device's view of its tokens
//
// The wallet proposes, the ledger decides. Everything here runs against a
// local cache: divisions, spends and accepted payments are provisional until
// a sync response overwrites the cache with the ledger's records.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::gateway::{BlockchainOracle, OracleError};
use crate::identity::{AddressError, Keypair, OwnerCommitment, WalletAddress};
use crate::ledger::{
    CommitOutcome, ConflictDetector, ConflictError, LedgerWrite, MemoryLedgerStore, SpendingClaim,
    StatusCause, StoreError, TokenLedgerStore, TokenRecord, TransactionExpectation,
};
use crate::storage::{DeviceStore, DeviceStoreError};
use crate::sync::{SyncRequest, SyncResponse};
use crate::token::{
    Amount, AmountError, DivisionError, DivisionRequestId, DivisionResult, Divider, OfflineToken,
    TokenId, TokenStatus, ValidationReport, Validator,
};
use crate::transaction::{
    ClientClaim, DivisionClaim, Transaction, TransactionBuildError, TransactionBuilder,
    TransactionEvent, TransactionId, TransactionKind, TransitionError,
};
use crate::transport::TransportError;
use crate::wallet::{Keyring, PaymentAcceptance, PaymentOffer, WalletSnapshot};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during wallet operations
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Amount, required: Amount },

    #[error("Payment amount must be positive")]
    ZeroAmount,

    #[error("Token {0} is not owned by this wallet")]
    NotOwner(TokenId),

    #[error("Token {token_id} failed validation: {report}")]
    InvalidToken {
        token_id: TokenId,
        report: ValidationReport,
    },

    #[error("Token {0} is already held with different contents")]
    TokenMismatch(TokenId),

    #[error("Payment is not addressed to this wallet")]
    RecipientMismatch,

    #[error("Invalid signature on transaction {0}")]
    InvalidSignature(TransactionId),

    #[error("Offer {0} does not match its transaction")]
    OfferMismatch(TransactionId),

    #[error("Offered tokens sum to {actual}, transaction says {expected}")]
    AmountMismatch { expected: Amount, actual: Amount },

    #[error("No open offer {0}")]
    UnknownOffer(TransactionId),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Local cache rejected the write: {0}")]
    CacheConflict(String),

    #[error("Payee refused transaction {transaction_id}: {reason}")]
    Refused {
        transaction_id: TransactionId,
        reason: String,
    },

    #[error("Unexpected {0} envelope")]
    UnexpectedEnvelope(&'static str),

    #[error(transparent)]
    DoubleSpend(#[from] ConflictError),

    #[error("Division failed: {0}")]
    Division(#[from] DivisionError),

    #[error("Could not build transaction: {0}")]
    Build(#[from] TransactionBuildError),

    #[error("Transition failed: {0}")]
    Transition(#[from] TransitionError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Arithmetic error: {0}")]
    Arithmetic(#[from] AmountError),

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device storage error: {0}")]
    Storage(#[from] DeviceStoreError),

    #[error("State export/import error: {0}")]
    StateError(String),
}

/// Counters for what the wallet is tracking
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletStats {
    pub cached_tokens: usize,
    pub active_tokens: usize,
    pub pending_claims: usize,
    pub open_offers: usize,
    pub unsynced_divisions: usize,
    pub keys: usize,
}

pub struct Wallet {
    keyring: Keyring,
    cache: Arc<MemoryLedgerStore>,
    validator: Validator,
    divider: Divider,
    clock: Arc<dyn Clock>,
    detector: ConflictDetector,
    /// Producing division of each token created offline, by child id
    lineage: HashMap<TokenId, DivisionClaim>,
    pending: BTreeMap<TransactionId, ClientClaim>,
    offers: HashMap<TransactionId, PaymentOffer>,
    last_sync_timestamp: u64,
    needs_resync: bool,
}

impl Wallet {
    pub fn new(keypair: Keypair, validator: Validator, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self::with_keyring(Keyring::new(keypair), validator, clock, config)
    }

    pub fn with_keyring(
        keyring: Keyring,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let cache = Arc::new(MemoryLedgerStore::new(clock.clone()));
        let divider = Divider::new(validator.clone(), cache.clone(), clock.clone(), config);
        Self {
            keyring,
            cache,
            validator,
            divider,
            clock,
            detector: ConflictDetector::new(),
            lineage: HashMap::new(),
            pending: BTreeMap::new(),
            offers: HashMap::new(),
            last_sync_timestamp: 0,
            needs_resync: false,
        }
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    pub fn address(&self) -> WalletAddress {
        self.keyring.address()
    }

    pub fn owner_commitment(&self) -> OwnerCommitment {
        *self.keyring.current_commitment()
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Switch to a fresh key. Tokens owned by older keys stay spendable.
    pub fn rotate_key(&mut self) -> String {
        let label = self.keyring.rotate();
        info!(label = %label, address = %self.address(), "rotated wallet key");
        label
    }

    // ========================================================================
    // TOKENS AND BALANCE
    // ========================================================================

    pub fn cache(&self) -> &Arc<MemoryLedgerStore> {
        &self.cache
    }

    /// Take custody of a token issued or transferred to one of our keys.
    /// Receiving the same token twice is a no-op.
    pub async fn receive_token(&mut self, token: OfflineToken) -> Result<(), WalletError> {
        let owner = *token.owner_commitment();
        if !self.keyring.owns(&owner) {
            return Err(WalletError::NotOwner(*token.id()));
        }
        let report = self.validator.validate(&token, Some(&owner), self.clock.now_millis());
        if !report.valid {
            return Err(WalletError::InvalidToken {
                token_id: *token.id(),
                report,
            });
        }

        if let Some(existing) = self.cache.get(token.id()).await? {
            if existing.token.signing_bytes() == token.signing_bytes()
                && existing.token.signature() == token.signature()
            {
                debug!(token_id = %token.id(), "token already held");
                return Ok(());
            }
            return Err(WalletError::TokenMismatch(*token.id()));
        }

        let token_id = *token.id();
        let amount = token.amount();
        let write = LedgerWrite::new().insert_token(TokenRecord::new(token, None));
        self.commit_local(write).await?;
        info!(token_id = %token_id, amount = %amount, "token received");
        Ok(())
    }

    /// Active tokens owned by any of our keys
    pub async fn tokens(&self) -> Result<Vec<OfflineToken>, WalletError> {
        Ok(self
            .cache
            .tokens_with_status(TokenStatus::Active)
            .await?
            .into_iter()
            .filter(|r| self.keyring.owns(r.token.owner_commitment()))
            .map(|r| r.token)
            .collect())
    }

    /// Tokens a new payment may use: active, unexpired by the device clock
    /// and not already promised in an open offer
    pub async fn spendable_tokens(&self) -> Result<Vec<OfflineToken>, WalletError> {
        let now = self.clock.now_millis();
        let reserved: HashSet<&TokenId> = self
            .offers
            .values()
            .flat_map(|o| o.transaction.token_ids())
            .collect();
        Ok(self
            .tokens()
            .await?
            .into_iter()
            .filter(|t| !t.is_expired_at(now) && !reserved.contains(t.id()))
            .collect())
    }

    /// Sum of active token amounts in the cache
    pub async fn offline_balance(&self) -> Result<Amount, WalletError> {
        let tokens = self.tokens().await?;
        Ok(total(&tokens)?)
    }

    pub async fn blockchain_balance(&self, oracle: &dyn BlockchainOracle) -> Result<Amount, WalletError> {
        Ok(oracle.balance(&self.address()).await?)
    }

    /// Transactions the cache knows about, oldest first
    pub async fn history(&self) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self
            .cache
            .all_transactions()
            .await
            .into_iter()
            .map(|r| r.transaction)
            .collect();
        transactions.sort_by_key(|t| (t.created_at(), *t.id()));
        transactions
    }

    pub async fn stats(&self) -> Result<WalletStats, WalletError> {
        Ok(WalletStats {
            cached_tokens: self.cache.token_count().await,
            active_tokens: self.tokens().await?.len(),
            pending_claims: self.pending.len(),
            open_offers: self.offers.len(),
            unsynced_divisions: self.lineage.len(),
            keys: self.keyring.len(),
        })
    }

    // ========================================================================
    // DIVISION
    // ========================================================================

    /// Split a held token into `amount` and change, offline
    pub async fn divide_token(&mut self, token_id: &TokenId, amount: Amount) -> Result<DivisionResult, WalletError> {
        let record = self
            .cache
            .get(token_id)
            .await?
            .ok_or(WalletError::NotOwner(*token_id))?;
        let holder = self
            .keyring
            .find(record.token.owner_commitment())
            .cloned()
            .ok_or(WalletError::NotOwner(*token_id))?;

        let result = self
            .divider
            .divide(&holder, &record.token, amount, DivisionRequestId::generate())
            .await?;

        let claim = DivisionClaim::from(result.clone());
        for child in result.children() {
            self.lineage.insert(*child.id(), claim.clone());
        }
        Ok(result)
    }

    /// Offline divisions needed to introduce `tokens` to the ledger
    fn lineage_for(&self, tokens: &[OfflineToken]) -> Vec<DivisionClaim> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        for token in tokens {
            let mut current = *token.id();
            while let Some(division) = self.lineage.get(&current) {
                if !seen.insert(division.request_id) {
                    break;
                }
                chain.push(division.clone());
                current = division.parent_id;
            }
        }
        chain
    }

    // ========================================================================
    // PAYING
    // ========================================================================

    /// Build a signed offer for exactly `amount`, dividing a token for change
    /// when no combination of held tokens matches. All tokens in one offer
    /// belong to the same key, newest key first.
    pub async fn prepare_payment(&mut self, receiver: &WalletAddress, amount: Amount) -> Result<PaymentOffer, WalletError> {
        if amount.is_zero() {
            return Err(WalletError::ZeroAmount);
        }
        let candidates = self.spendable_tokens().await?;
        let (owner, mut selected) = self.select(candidates, amount)?;

        let covered = total(&selected)?;
        if covered > amount {
            if let Some(last) = selected.pop() {
                let before = covered.checked_sub(last.amount())?;
                let part = amount.checked_sub(before)?;
                let division = self.divide_token(last.id(), part).await?;
                selected.push(division.payment);
            }
        }

        let holder = self
            .keyring
            .find(&owner)
            .cloned()
            .ok_or_else(|| WalletError::UnknownKey(owner.to_hex()))?;
        let transaction = TransactionBuilder::offline_transfer()
            .sender(&holder)
            .receiver(receiver.clone())
            .amount(amount)
            .tokens(selected.iter().map(|t| *t.id()))
            .created_at(self.clock.now_millis())
            .build()?;

        let divisions = self.lineage_for(&selected);
        let offer = PaymentOffer {
            transaction,
            tokens: selected,
            divisions,
        };
        self.offers.insert(*offer.transaction_id(), offer.clone());
        info!(
            tx_id = %offer.transaction_id(),
            amount = %amount,
            tokens = offer.tokens.len(),
            divisions = offer.divisions.len(),
            "payment offer prepared"
        );
        Ok(offer)
    }

    /// Pick tokens of one owner covering `amount`, largest first
    fn select(
        &self,
        candidates: Vec<OfflineToken>,
        amount: Amount,
    ) -> Result<(OwnerCommitment, Vec<OfflineToken>), WalletError> {
        let mut by_owner: HashMap<OwnerCommitment, Vec<OfflineToken>> = HashMap::new();
        for token in candidates {
            by_owner.entry(*token.owner_commitment()).or_default().push(token);
        }

        let mut available = Amount::ZERO;
        for owner in self.keyring.commitments() {
            let Some(mut tokens) = by_owner.remove(&owner) else {
                continue;
            };
            tokens.sort_by(|a, b| b.amount().cmp(&a.amount()).then_with(|| a.id().cmp(b.id())));

            let mut chosen = Vec::new();
            let mut sum = Amount::ZERO;
            for token in tokens {
                sum = sum.checked_add(token.amount())?;
                chosen.push(token);
                if sum >= amount {
                    return Ok((owner, chosen));
                }
            }
            available = available.max(sum);
        }

        Err(WalletError::InsufficientBalance {
            available,
            required: amount,
        })
    }

    /// Attach the payee's countersignature, spend the tokens in the cache
    /// and queue the claim for the next sync
    pub async fn finalize_payment(&mut self, acceptance: &PaymentAcceptance) -> Result<Transaction, WalletError> {
        let id = acceptance.transaction_id;
        let Some(offer) = self.offers.get(&id).cloned() else {
            if self.pending.contains_key(&id) {
                if let Some(record) = self.cache.get_transaction(&id).await? {
                    return Ok(record.transaction);
                }
            }
            return Err(WalletError::UnknownOffer(id));
        };

        let mut signed = offer.transaction.clone();
        signed.attach_receiver_signature(acceptance.receiver_signature.clone());
        if !signed.verify_receiver_signature()? {
            return Err(WalletError::InvalidSignature(id));
        }

        let mut completed = signed.clone();
        completed.apply(TransactionEvent::TokensSpent {
            at: self.clock.now_millis(),
        })?;

        let cause = StatusCause::Transaction(id);
        let mut write = LedgerWrite::new();
        for token_id in signed.token_ids() {
            write = write.change_status(*token_id, TokenStatus::Active, TokenStatus::Spent, cause);
        }
        let write = write.put_transaction(completed.clone(), TransactionExpectation::Absent);
        self.commit_local(write).await?;

        self.offers.remove(&id);
        self.pending.insert(id, offer.into_signed_claim(signed));
        info!(tx_id = %id, amount = %completed.amount(), "payment completed offline");
        Ok(completed)
    }

    /// Withdraw an offer the payee has not accepted; its tokens become
    /// spendable again
    pub fn cancel_payment(&mut self, id: &TransactionId) -> Result<PaymentOffer, WalletError> {
        let offer = self.offers.remove(id).ok_or(WalletError::UnknownOffer(*id))?;
        debug!(tx_id = %id, "payment offer cancelled");
        Ok(offer)
    }

    pub fn open_offers(&self) -> impl Iterator<Item = &PaymentOffer> {
        self.offers.values()
    }

    // ========================================================================
    // GETTING PAID
    // ========================================================================

    /// Check an offer using only cached issuer keys and countersign it.
    /// Accepting the same offer again returns the same acceptance.
    pub async fn accept_payment(&mut self, offer: &PaymentOffer) -> Result<PaymentAcceptance, WalletError> {
        let id = *offer.transaction_id();
        let tx = &offer.transaction;

        let receiver = tx.receiver().commitment()?;
        let receiver_key = self
            .keyring
            .find(&receiver)
            .cloned()
            .ok_or(WalletError::RecipientMismatch)?;

        if let Some(claim) = self.pending.get(&id) {
            if claim.transaction.signing_bytes() == tx.signing_bytes() {
                if let Some(signature) = claim.transaction.receiver_signature() {
                    return Ok(PaymentAcceptance {
                        transaction_id: id,
                        receiver_signature: signature.clone(),
                    });
                }
            }
        }

        if tx.kind() != TransactionKind::OfflineTransfer {
            return Err(WalletError::OfferMismatch(id));
        }
        if !tx.verify_sender_signature()? {
            return Err(WalletError::InvalidSignature(id));
        }
        let offered: Vec<TokenId> = offer.tokens.iter().map(|t| *t.id()).collect();
        if offered.as_slice() != tx.token_ids() {
            return Err(WalletError::OfferMismatch(id));
        }

        let sender = tx.sender().commitment()?;
        let now = self.clock.now_millis();
        for token in &offer.tokens {
            let report = self.validator.validate(token, Some(&sender), now);
            if !report.valid {
                warn!(tx_id = %id, token_id = %token.id(), reasons = %report, "offered token invalid");
                return Err(WalletError::InvalidToken {
                    token_id: *token.id(),
                    report,
                });
            }
        }
        let actual = total(&offer.tokens)?;
        if actual != tx.amount() {
            return Err(WalletError::AmountMismatch {
                expected: tx.amount(),
                actual,
            });
        }

        let seen: Vec<SpendingClaim> = offer
            .tokens
            .iter()
            .map(|t| SpendingClaim::new(*t.id(), id, sender, now))
            .collect();
        for claim in &seen {
            if let Err(err) = self.detector.check(claim) {
                warn!(tx_id = %id, token_id = %claim.token_id(), "token already offered to us");
                return Err(err.into());
            }
        }
        for claim in seen {
            self.detector.register_claim(claim)?;
        }

        let mut signed = tx.clone();
        let receiver_signature = signed.countersign(&receiver_key);
        let mut completed = signed.clone();
        completed.apply(TransactionEvent::TokensSpent { at: now })?;
        let write = LedgerWrite::new().put_transaction(completed, TransactionExpectation::AbsentOrPending);
        self.commit_local(write).await?;

        self.pending.insert(id, offer.clone().into_signed_claim(signed));
        info!(tx_id = %id, amount = %tx.amount(), "payment accepted offline");
        Ok(PaymentAcceptance {
            transaction_id: id,
            receiver_signature,
        })
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    // ========================================================================
    // SYNC
    // ========================================================================

    pub fn pending_claims(&self) -> impl Iterator<Item = &ClientClaim> {
        self.pending.values()
    }

    pub fn last_sync_timestamp(&self) -> u64 {
        self.last_sync_timestamp
    }

    /// True after the ledger rejected one of our claims; local provisional
    /// state is discarded by the next full response
    pub fn needs_full_resync(&self) -> bool {
        self.needs_resync
    }

    /// Pending claims plus our cursor. Asks for the whole history while a
    /// resync is owed.
    pub fn sync_request(&self) -> SyncRequest {
        let since = if self.needs_resync { 0 } else { self.last_sync_timestamp };
        self.keyring
            .commitments()
            .into_iter()
            .fold(SyncRequest::new(since), |req, owner| req.with_owner(owner))
            .with_claims(self.pending.values().cloned())
    }

    pub fn full_resync_request(&self) -> SyncRequest {
        SyncRequest::full_resync(self.keyring.commitments())
    }

    /// Overwrite the cache with the ledger's records and settle our queue.
    /// While a resync is owed the cache is rebuilt from scratch.
    pub async fn apply_sync(&mut self, response: &SyncResponse) -> Result<(), WalletError> {
        let full = self.needs_resync;
        if full {
            self.cache.clear().await;
            self.lineage.clear();
            self.offers.clear();
        }

        for record in &response.tokens {
            self.lineage.remove(record.id());
            self.cache.overwrite_token(record.clone()).await;
        }
        for record in &response.transactions {
            self.cache.overwrite_transaction(record.clone()).await;
        }
        for record in &response.divisions {
            self.cache.overwrite_division(record.clone()).await;
        }

        let mut rejected = 0;
        for outcome in &response.outcomes {
            let Some(claim) = self.pending.remove(outcome.transaction_id()) else {
                continue;
            };
            if outcome.is_accepted() {
                for token in &claim.tokens {
                    self.detector.forget(token.id());
                }
            } else {
                rejected += 1;
                warn!(tx_id = %outcome.transaction_id(), ?outcome, "ledger rejected claim");
            }
        }

        self.last_sync_timestamp = if full {
            response.last_sync_timestamp
        } else {
            self.last_sync_timestamp.max(response.last_sync_timestamp)
        };
        self.needs_resync = rejected > 0 || response.resync_required;
        debug!(
            full,
            tokens = response.tokens.len(),
            transactions = response.transactions.len(),
            rejected,
            cursor = self.last_sync_timestamp,
            "applied sync response"
        );
        Ok(())
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    pub async fn snapshot(&self) -> WalletSnapshot {
        let mut seen = HashSet::new();
        let lineage = self
            .lineage
            .values()
            .filter(|d| seen.insert(d.request_id))
            .cloned()
            .collect();
        WalletSnapshot {
            tokens: self.cache.all_tokens().await,
            transactions: self.cache.all_transactions().await,
            divisions: self.cache.all_divisions().await,
            lineage,
            pending_claims: self.pending.values().cloned().collect(),
            open_offers: self.offers.values().cloned().collect(),
            detector: self.detector.clone(),
            last_sync_timestamp: self.last_sync_timestamp,
            needs_resync: self.needs_resync,
        }
    }

    pub async fn restore(
        keyring: Keyring,
        snapshot: WalletSnapshot,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let mut wallet = Self::with_keyring(keyring, validator, clock, config);
        for record in snapshot.tokens {
            wallet.cache.overwrite_token(record).await;
        }
        for record in snapshot.transactions {
            wallet.cache.overwrite_transaction(record).await;
        }
        for record in snapshot.divisions {
            wallet.cache.overwrite_division(record).await;
        }
        for division in snapshot.lineage {
            let children: Vec<TokenId> = division.children().map(|c| *c.id()).collect();
            for child in children {
                wallet.lineage.insert(child, division.clone());
            }
        }
        wallet.pending = snapshot
            .pending_claims
            .into_iter()
            .map(|c| (*c.transaction_id(), c))
            .collect();
        wallet.offers = snapshot
            .open_offers
            .into_iter()
            .map(|o| (*o.transaction_id(), o))
            .collect();
        wallet.detector = snapshot.detector;
        wallet.last_sync_timestamp = snapshot.last_sync_timestamp;
        wallet.needs_resync = snapshot.needs_resync;
        wallet
    }

    /// Persist keys and state to the device store
    pub async fn save(&self, store: &DeviceStore) -> Result<(), WalletError> {
        store.save_wallet(&self.keyring, &self.snapshot().await)?;
        store.flush()?;
        debug!(keys = self.keyring.len(), "wallet saved");
        Ok(())
    }

    /// Load the wallet kept in `store`, or start a new one with a fresh key
    pub async fn open(
        store: &DeviceStore,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, WalletError> {
        let mut labels = store.keypair_labels()?;
        if labels.is_empty() {
            info!("no stored keys, creating wallet");
            return Ok(Self::new(Keypair::generate(), validator, clock, config));
        }
        labels.sort_by_key(|label| label_index(label));

        let mut entries = Vec::with_capacity(labels.len());
        for label in labels {
            if let Some(keypair) = store.load_keypair(&label)? {
                entries.push((label, keypair));
            }
        }
        let current = store
            .current_label()?
            .ok_or_else(|| WalletError::StateError("no current key label".to_string()))?;
        let keyring = Keyring::from_entries(entries, &current)?;

        let wallet = match store.load_snapshot()? {
            Some(snapshot) => Self::restore(keyring, snapshot, validator, clock, config).await,
            None => Self::with_keyring(keyring, validator, clock, config),
        };
        info!(address = %wallet.address(), pending = wallet.pending.len(), "wallet opened");
        Ok(wallet)
    }

    async fn commit_local(&self, write: LedgerWrite) -> Result<u64, WalletError> {
        match self.cache.commit(write).await? {
            CommitOutcome::Applied { ledger_ts } => Ok(ledger_ts),
            CommitOutcome::Conflict(conflict) => Err(WalletError::CacheConflict(format!("{:?}", conflict))),
        }
    }
}

fn total(tokens: &[OfflineToken]) -> Result<Amount, AmountError> {
    tokens
        .iter()
        .try_fold(Amount::ZERO, |acc, t| acc.checked_add(t.amount()))
}

fn label_index(label: &str) -> (usize, String) {
    let index = label
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX);
    (index, label.to_string())
}
