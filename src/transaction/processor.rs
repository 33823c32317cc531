// Transaction processor - drives transactions through the state machine
// against the authoritative ledger and the blockchain oracle

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::gateway::{BlockchainOracle, ChainTxHash, ConfirmationPoller, OracleError, PollOutcome};
use crate::identity::AddressError;
use crate::ledger::{
    AppendOutcome, CommitConflict, CommitOutcome, LedgerWrite, StatusCause, StoreError, TokenLedgerStore,
    TransactionExpectation,
};
use crate::token::{Amount, AmountError, OfflineToken, TokenId, TokenStatus, ValidationReport, Validator};
use crate::transaction::{
    ClientClaim, FailureReason, Settlement, SettlementError, SettlementOutcome, Transaction,
    TransactionEvent, TransactionId, TransactionKind, TransactionStatus, TransitionError,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// PROCESSOR ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    #[error("Transaction {id} is a {kind:?}; this operation does not apply")]
    WrongKind { id: TransactionId, kind: TransactionKind },

    #[error("Transaction {0} has no blockchain hash to poll")]
    NotSubmitted(TransactionId),

    #[error("Token {token_id} cannot be redeemed: {report}")]
    InvalidToken {
        token_id: TokenId,
        report: ValidationReport,
    },

    #[error("Token {0} referenced by the transaction was not presented")]
    MissingToken(TokenId),

    #[error("Token {token_id} was consumed first by {cause:?}")]
    TokenUnavailable {
        token_id: TokenId,
        cause: Option<StatusCause>,
    },

    #[error("Transaction id {0} is recorded for a different transaction")]
    IdInUse(TransactionId),

    #[error("Tokens sum to {actual} but transaction amount is {expected}")]
    AmountMismatch { expected: Amount, actual: Amount },

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Arithmetic error: {0}")]
    Arithmetic(#[from] AmountError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Transaction {id} lost {attempts} compare-and-set races")]
    RetriesExhausted { id: TransactionId, attempts: u32 },
}

// ============================================================================
// STATUS VIEW & EVENTS
// ============================================================================

/// What `get_status` reports
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatusView {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    /// Current depth for pending chain-confirmed transactions, when the
    /// oracle answered
    pub confirmations: Option<u64>,
    pub required_confirmations: Option<u64>,
    pub failure: Option<FailureReason>,
}

/// Events emitted by the processor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorEvent {
    Submitted {
        id: TransactionId,
        kind: TransactionKind,
        amount: Amount,
    },
    Completed { id: TransactionId },
    Failed { id: TransactionId, reason: FailureReason },
    Cancelled { id: TransactionId },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct TransactionProcessor {
    store: Arc<dyn TokenLedgerStore>,
    oracle: Arc<dyn BlockchainOracle>,
    poller: ConfirmationPoller,
    validator: Validator,
    settlement: Settlement,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: Mutex<Vec<ProcessorEvent>>,
    stats: Mutex<ProcessorStats>,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn TokenLedgerStore>,
        oracle: Arc<dyn BlockchainOracle>,
        validator: Validator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let poller = ConfirmationPoller::new(oracle.clone(), &config);
        let settlement = Settlement::new(store.clone(), validator.clone(), clock.clone(), config.clone());
        Self {
            store,
            oracle,
            poller,
            validator,
            settlement,
            clock,
            config,
            events: Mutex::new(Vec::new()),
            stats: Mutex::new(ProcessorStats::default()),
        }
    }

    pub fn settlement(&self) -> &Settlement {
        &self.settlement
    }

    /// Record a new pending transaction. Repeating an id returns the
    /// recorded transaction unchanged.
    pub async fn create(&self, transaction: Transaction) -> Result<Transaction, ProcessorError> {
        let proposal = transaction.as_proposal();
        match self.store.append_transaction(proposal.clone()).await? {
            AppendOutcome::Inserted { ledger_ts } => {
                debug!(tx_id = %proposal.id(), kind = proposal.kind().as_str(), ledger_ts, "recorded pending transaction");
                Ok(proposal)
            }
            AppendOutcome::Existing(record) => Ok(record.transaction),
        }
    }

    /// Settle a co-signed offline transfer
    pub async fn complete_offline(&self, claim: &ClientClaim) -> Result<SettlementOutcome, ProcessorError> {
        let outcome = self.settlement.settle(claim).await?;
        let id = *claim.transaction_id();
        match &outcome {
            SettlementOutcome::Completed { .. } => self.emit(ProcessorEvent::Completed { id }),
            SettlementOutcome::Rejected { reason, .. } => self.emit(ProcessorEvent::Failed {
                id,
                reason: reason.clone(),
            }),
            SettlementOutcome::DoubleSpend { transaction, .. } => {
                if let Some(reason) = transaction.failure() {
                    self.emit(ProcessorEvent::Failed {
                        id,
                        reason: reason.clone(),
                    });
                }
            }
            SettlementOutcome::AlreadySettled(_) => {}
        }
        Ok(outcome)
    }

    /// Submit an online transfer or redemption to the chain and record it
    /// pending with its blockchain hash. `tokens` are the bodies redeemed;
    /// online transfers carry none.
    ///
    /// The pending record and, for a redemption, every token's move to
    /// `redeemed` commit together before anything reaches the chain. A
    /// recorded transaction that never got a hash is broadcast again.
    pub async fn submit_online(
        &self,
        transaction: Transaction,
        tokens: &[OfflineToken],
    ) -> Result<Transaction, ProcessorError> {
        let id = *transaction.id();
        if !transaction.kind().is_chain_confirmed() {
            return Err(ProcessorError::WrongKind {
                id,
                kind: transaction.kind(),
            });
        }

        let pending = match self.store.get_transaction(&id).await? {
            Some(record) if record.transaction.signing_bytes() != transaction.signing_bytes() => {
                return Err(ProcessorError::IdInUse(id));
            }
            Some(record) => record.transaction,
            None => match self.reserve(&transaction, tokens).await? {
                Some(reserved) => reserved,
                None => self.load(&id).await?,
            },
        };
        if pending.status().is_terminal() || pending.blockchain_tx_hash().is_some() {
            debug!(tx_id = %id, status = %pending.status(), "transaction already submitted");
            return Ok(pending);
        }

        match self.broadcast(&pending).await {
            Ok(hash) => self.attach_hash(&id, hash).await,
            Err(OracleError::Rejected(detail)) => {
                warn!(tx_id = %id, detail = %detail, "chain refused submission");
                let at = self.clock.now_millis();
                self.advance(
                    &id,
                    TransactionEvent::Failed {
                        reason: FailureReason::ChainRejected(detail),
                        at,
                    },
                )
                .await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record `transaction` pending and take its tokens out of `active` in
    /// one commit. `None` when the id was recorded concurrently.
    async fn reserve(
        &self,
        transaction: &Transaction,
        tokens: &[OfflineToken],
    ) -> Result<Option<Transaction>, ProcessorError> {
        let id = *transaction.id();
        let proposal = transaction.as_proposal();
        let mut write = LedgerWrite::new();
        if proposal.kind() == TransactionKind::TokenRedemption {
            self.check_redemption(&proposal, tokens).await?;
            for token_id in proposal.token_ids() {
                write = write.change_status(
                    *token_id,
                    TokenStatus::Active,
                    TokenStatus::Redeemed,
                    StatusCause::Transaction(id),
                );
            }
        }
        let write = write.put_transaction(proposal.clone(), TransactionExpectation::Absent);

        match self.store.commit(write).await? {
            CommitOutcome::Applied { ledger_ts } => {
                debug!(
                    tx_id = %id,
                    kind = proposal.kind().as_str(),
                    tokens = proposal.token_ids().len(),
                    ledger_ts,
                    "recorded pending transaction"
                );
                Ok(Some(proposal))
            }
            CommitOutcome::Conflict(CommitConflict::TokenStatus { token_id, actual, .. }) => {
                let cause = self.store.get(&token_id).await?.and_then(|r| r.cause);
                warn!(tx_id = %id, token_id = %token_id, ?actual, "redeemed token consumed first");
                Err(ProcessorError::TokenUnavailable { token_id, cause })
            }
            CommitOutcome::Conflict(conflict) => {
                debug!(tx_id = %id, ?conflict, "transaction recorded concurrently");
                Ok(None)
            }
        }
    }

    async fn broadcast(&self, transaction: &Transaction) -> Result<ChainTxHash, OracleError> {
        let payload = transaction.signing_bytes();
        let timeout = self.config.oracle_timeout();
        self.config
            .retry
            .run("chain_submit", |_| {
                let oracle = self.oracle.clone();
                let payload = payload.clone();
                async move {
                    match tokio::time::timeout(timeout, oracle.submit(&payload)).await {
                        Ok(result) => result,
                        Err(_) => Err(OracleError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
            })
            .await
    }

    async fn attach_hash(&self, id: &TransactionId, hash: ChainTxHash) -> Result<Transaction, ProcessorError> {
        let max_attempts = self.config.cas_retry_limit.max(1);
        for attempt in 1..=max_attempts {
            let stored = self.load(id).await?;
            if stored.status().is_terminal() {
                return Ok(stored);
            }
            let mut next = stored;
            next.set_blockchain_tx_hash(hash.clone());
            let write = LedgerWrite::new()
                .put_transaction(next.clone(), TransactionExpectation::InStatus(TransactionStatus::Pending));
            match self.store.commit(write).await? {
                CommitOutcome::Applied { .. } => {
                    info!(tx_id = %id, kind = next.kind().as_str(), hash = %hash, "submitted to chain");
                    self.emit(ProcessorEvent::Submitted {
                        id: *id,
                        kind: next.kind(),
                        amount: next.amount(),
                    });
                    return Ok(next);
                }
                CommitOutcome::Conflict(conflict) => {
                    warn!(tx_id = %id, attempt, ?conflict, "chain hash update lost race");
                }
            }
        }
        Err(ProcessorError::RetriesExhausted {
            id: *id,
            attempts: max_attempts,
        })
    }

    async fn check_redemption(
        &self,
        transaction: &Transaction,
        tokens: &[OfflineToken],
    ) -> Result<(), ProcessorError> {
        let owner = transaction.sender().commitment()?;
        let now = self.clock.now_millis();
        let mut total = Amount::ZERO;
        for token_id in transaction.token_ids() {
            let token = tokens
                .iter()
                .find(|t| t.id() == token_id)
                .ok_or(ProcessorError::MissingToken(*token_id))?;
            let report = self
                .validator
                .validate_in_store(self.store.as_ref(), token, Some(&owner), now)
                .await?;
            if !report.valid {
                return Err(ProcessorError::InvalidToken {
                    token_id: *token_id,
                    report,
                });
            }
            total = total.checked_add(token.amount())?;
        }
        if total != transaction.amount() {
            return Err(ProcessorError::AmountMismatch {
                expected: transaction.amount(),
                actual: total,
            });
        }
        Ok(())
    }

    /// Poll the chain until the transaction reaches the configured depth or
    /// the retry budget is spent, then commit the terminal state
    pub async fn poll_confirmations(&self, id: &TransactionId) -> Result<Transaction, ProcessorError> {
        let transaction = self.load(id).await?;
        if transaction.status().is_terminal() {
            return Ok(transaction);
        }
        if !transaction.kind().is_chain_confirmed() {
            return Err(ProcessorError::WrongKind {
                id: *id,
                kind: transaction.kind(),
            });
        }
        let hash = transaction
            .blockchain_tx_hash()
            .cloned()
            .ok_or(ProcessorError::NotSubmitted(*id))?;

        let event = match self.poller.wait_for(&hash).await {
            Ok(PollOutcome::Confirmed { confirmations }) => TransactionEvent::ConfirmationsObserved {
                confirmations,
                required: self.poller.required(),
                at: self.clock.now_millis(),
            },
            Ok(PollOutcome::Exhausted { attempts, last_seen }) => {
                warn!(tx_id = %id, attempts, ?last_seen, "confirmation budget exhausted");
                TransactionEvent::Failed {
                    reason: FailureReason::RetryBudgetExhausted { attempts },
                    at: self.clock.now_millis(),
                }
            }
            Err(err) => {
                warn!(tx_id = %id, error = %err, "confirmation poll failed");
                TransactionEvent::AttemptFailed {
                    max_attempts: self.config.retry.max_attempts,
                    at: self.clock.now_millis(),
                }
            }
        };
        self.advance(id, event).await
    }

    /// Cancel a pending transaction. A terminal transaction is returned as is.
    pub async fn cancel(&self, id: &TransactionId) -> Result<Transaction, ProcessorError> {
        let at = self.clock.now_millis();
        self.advance(id, TransactionEvent::Cancelled { at }).await
    }

    pub async fn get_status(&self, id: &TransactionId) -> Result<TransactionStatusView, ProcessorError> {
        let transaction = self.load(id).await?;
        let chain = transaction.kind().is_chain_confirmed();
        let confirmations = match (transaction.status(), transaction.blockchain_tx_hash()) {
            (TransactionStatus::Pending, Some(hash)) if chain => self.poller.check_once(hash).await.ok(),
            _ => None,
        };
        Ok(TransactionStatusView {
            transaction_id: *id,
            status: transaction.status(),
            confirmations,
            required_confirmations: chain.then(|| self.poller.required()),
            failure: transaction.failure().cloned(),
        })
    }

    /// Apply `event` to the stored transaction and commit it. Redeemed
    /// tokens already moved at submission. Lost races re-read and re-apply.
    async fn advance(&self, id: &TransactionId, event: TransactionEvent) -> Result<Transaction, ProcessorError> {
        let max_attempts = self.config.cas_retry_limit.max(1);
        for attempt in 1..=max_attempts {
            let stored = self.load(id).await?;
            let mut next = stored.clone();
            let transition = next.apply(event.clone())?;
            if !transition.is_moved() && next == stored {
                return Ok(stored);
            }

            let write = LedgerWrite::new()
                .put_transaction(next.clone(), TransactionExpectation::InStatus(TransactionStatus::Pending));

            match self.store.commit(write).await? {
                CommitOutcome::Applied { ledger_ts } => {
                    debug!(tx_id = %id, status = %next.status(), ledger_ts, "transaction advanced");
                    self.record_terminal(&next);
                    return Ok(next);
                }
                CommitOutcome::Conflict(conflict) => {
                    warn!(tx_id = %id, attempt, ?conflict, "transaction update lost race");
                }
            }
        }
        Err(ProcessorError::RetriesExhausted {
            id: *id,
            attempts: max_attempts,
        })
    }

    async fn load(&self, id: &TransactionId) -> Result<Transaction, ProcessorError> {
        self.store
            .get_transaction(id)
            .await?
            .map(|r| r.transaction)
            .ok_or(ProcessorError::NotFound(*id))
    }

    fn record_terminal(&self, transaction: &Transaction) {
        let id = *transaction.id();
        match transaction.status() {
            TransactionStatus::Completed => {
                info!(tx_id = %id, kind = transaction.kind().as_str(), "transaction completed");
                self.emit(ProcessorEvent::Completed { id });
            }
            TransactionStatus::Failed => {
                if let Some(reason) = transaction.failure() {
                    self.emit(ProcessorEvent::Failed {
                        id,
                        reason: reason.clone(),
                    });
                }
            }
            TransactionStatus::Cancelled => self.emit(ProcessorEvent::Cancelled { id }),
            TransactionStatus::Pending => {}
        }
    }

    fn emit(&self, event: ProcessorEvent) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            match &event {
                ProcessorEvent::Submitted { .. } => stats.submitted += 1,
                ProcessorEvent::Completed { .. } => stats.completed += 1,
                ProcessorEvent::Failed { .. } => stats.failed += 1,
                ProcessorEvent::Cancelled { .. } => stats.cancelled += 1,
            }
        }
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }

    /// Drain emitted events
    pub fn poll_events(&self) -> Vec<ProcessorEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
