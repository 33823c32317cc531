// Offline token service - the ledger-side entry point
//
// Wires issuer, validator, divider, processor and reconciler over one
// timeout-bounded store and one authoritative clock. Module errors are
// folded into `EngineError` here.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gateway::{BlockchainOracle, FundingRef};
use crate::identity::{Keypair, OwnerCommitment, SharedKeyRegistry};
use crate::ledger::{TimeoutStore, TokenLedgerStore};
use crate::sync::{LocalEndpoint, Reconciler, SyncResponse};
use crate::token::{
    Amount, DivisionRequestId, DivisionResult, Divider, Issuer, MintOutcome, OfflineToken, TokenId,
    ValidationReport, Validator,
};
use crate::transaction::{ClientClaim, TransactionId, TransactionProcessor, TransactionStatusView};
use std::sync::Arc;

pub struct OfflineTokenService {
    store: Arc<dyn TokenLedgerStore>,
    validator: Validator,
    issuer: Issuer,
    divider: Divider,
    processor: TransactionProcessor,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl OfflineTokenService {
    /// Build the service. `issuer_key` is registered in `keys` and becomes
    /// the current signing key if none is current yet.
    pub fn new(
        store: Arc<dyn TokenLedgerStore>,
        oracle: Arc<dyn BlockchainOracle>,
        keys: SharedKeyRegistry,
        issuer_key: Keypair,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let store: Arc<dyn TokenLedgerStore> = Arc::new(TimeoutStore::new(store, config.store_timeout()));
        let validator = Validator::new(keys.clone());
        let issuer = Issuer::new(
            keys,
            issuer_key,
            store.clone(),
            oracle.clone(),
            clock.clone(),
            config.clone(),
        );
        let divider = Divider::new(validator.clone(), store.clone(), clock.clone(), config.clone());
        let processor = TransactionProcessor::new(
            store.clone(),
            oracle,
            validator.clone(),
            clock.clone(),
            config.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            validator.clone(),
            clock.clone(),
            config.clone(),
        ));

        Ok(Self {
            store,
            validator,
            issuer,
            divider,
            processor,
            reconciler,
            clock,
            config,
        })
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Mint against confirmed funding; a repeated funding reference returns
    /// the token minted the first time
    pub async fn mint(
        &self,
        owner: OwnerCommitment,
        amount: Amount,
        funding: &FundingRef,
    ) -> Result<MintOutcome, EngineError> {
        Ok(self.issuer.mint(owner, amount, funding).await?)
    }

    /// Validate `token` against the ledger's view of it, if the ledger has one
    pub async fn validate_token(
        &self,
        token: &OfflineToken,
        expected_owner: Option<&OwnerCommitment>,
    ) -> Result<ValidationReport, EngineError> {
        let now = self.clock.now_millis();
        Ok(self
            .validator
            .validate_in_store(self.store.as_ref(), token, expected_owner, now)
            .await?)
    }

    pub async fn divide_token(
        &self,
        token: &OfflineToken,
        amount: Amount,
        holder: &Keypair,
        request_id: DivisionRequestId,
    ) -> Result<DivisionResult, EngineError> {
        Ok(self.divider.divide(holder, token, amount, request_id).await?)
    }

    /// Reconcile a batch of device claims and return every ledger change
    /// after `since`. Per-claim failures are outcomes, not errors.
    pub async fn sync_offline_transactions(
        &self,
        claims: Vec<ClientClaim>,
        since: u64,
    ) -> Result<SyncResponse, EngineError> {
        let result = self.reconciler.reconcile(claims, since).await?;
        Ok(SyncResponse::from_delta(result.outcomes, result.delta, &[]))
    }

    pub async fn get_transaction_status(&self, id: &TransactionId) -> Result<TransactionStatusView, EngineError> {
        Ok(self.processor.get_status(id).await?)
    }

    pub async fn sweep_expired(&self) -> Result<Vec<TokenId>, EngineError> {
        Ok(self.reconciler.sweep_expired().await?)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Sync endpoint for device clients running in the same process
    pub fn local_endpoint(&self) -> LocalEndpoint {
        LocalEndpoint::new(self.reconciler.clone())
    }

    pub fn store(&self) -> &Arc<dyn TokenLedgerStore> {
        &self.store
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn processor(&self) -> &TransactionProcessor {
        &self.processor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
