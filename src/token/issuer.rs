// Issuer - mints offline tokens against confirmed on-chain funding

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::gateway::{BlockchainOracle, ConfirmationPoller, FundingRef, OracleError, PollOutcome};
use crate::identity::{
    IssuerKeyId, Keypair, OwnerCommitment, RegistryError, SharedKeyRegistry, Signer, WalletAddress,
};
use crate::ledger::{MintRecordOutcome, StoreError, TokenLedgerStore};
use crate::token::{Amount, OfflineToken, TokenDraft, TokenId};
use crate::transaction::{TransactionBuildError, TransactionBuilder, TransactionKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("Amount {amount} outside (0, {max}]")]
    AmountOutOfRange { amount: Amount, max: Amount },

    #[error("Funding {funding} has {confirmations} of {required} confirmations")]
    FundingNotConfirmed {
        funding: FundingRef,
        confirmations: u64,
        required: u64,
    },

    #[error("Issuer key registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("No signing key held for issuer key {0}")]
    MissingSigningKey(IssuerKeyId),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Could not build purchase record: {0}")]
    PurchaseRecord(#[from] TransactionBuildError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MintOutcome {
    Minted(OfflineToken),
    /// The funding reference was already used; this is the original token
    Duplicate(OfflineToken),
}

impl MintOutcome {
    pub fn token(&self) -> &OfflineToken {
        match self {
            MintOutcome::Minted(token) | MintOutcome::Duplicate(token) => token,
        }
    }

    pub fn into_token(self) -> OfflineToken {
        match self {
            MintOutcome::Minted(token) | MintOutcome::Duplicate(token) => token,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, MintOutcome::Duplicate(_))
    }
}

pub struct Issuer {
    keys: SharedKeyRegistry,
    signing_keys: RwLock<HashMap<IssuerKeyId, Keypair>>,
    store: Arc<dyn TokenLedgerStore>,
    poller: ConfirmationPoller,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Issuer {
    /// Create an issuer whose first key becomes current if none is yet
    pub fn new(
        keys: SharedKeyRegistry,
        signing_key: Keypair,
        store: Arc<dyn TokenLedgerStore>,
        oracle: Arc<dyn BlockchainOracle>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let poller = ConfirmationPoller::new(oracle, &config);
        let issuer = Self {
            keys,
            signing_keys: RwLock::new(HashMap::new()),
            store,
            poller,
            clock,
            config,
        };
        issuer.add_signing_key(signing_key);
        issuer
    }

    pub fn keys(&self) -> &SharedKeyRegistry {
        &self.keys
    }

    /// Register a key and keep its secret for signing
    pub fn add_signing_key(&self, keypair: Keypair) -> IssuerKeyId {
        let id = self
            .keys
            .write()
            .register(keypair.public_key(), self.clock.now_millis());
        self.signing_keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), keypair);
        id
    }

    /// Start signing new tokens with `keypair`; older keys keep verifying
    pub fn rotate(&self, keypair: Keypair) -> Result<IssuerKeyId, IssueError> {
        let id = self.add_signing_key(keypair);
        self.keys.write().rotate_to(&id)?;
        info!(issuer_key = %id, "rotated issuer key");
        Ok(id)
    }

    pub fn retire(&self, id: &IssuerKeyId) -> Result<(), IssueError> {
        self.keys.write().retire(id, self.clock.now_millis())?;
        self.signing_keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        Ok(())
    }

    pub fn current_key_id(&self) -> Result<IssuerKeyId, IssueError> {
        Ok(self.keys.read().current()?.clone())
    }

    /// Mint one token for `owner` against `funding`.
    /// A funding reference mints at most once; repeats return the original.
    pub async fn mint(
        &self,
        owner: OwnerCommitment,
        amount: Amount,
        funding: &FundingRef,
    ) -> Result<MintOutcome, IssueError> {
        if amount.is_zero() || amount > self.config.max_mint_amount {
            return Err(IssueError::AmountOutOfRange {
                amount,
                max: self.config.max_mint_amount,
            });
        }

        if let Some(existing) = self.store.get_mint(funding).await? {
            debug!(funding = %funding, token_id = %existing.id(), "mint already recorded");
            return Ok(MintOutcome::Duplicate(existing.token));
        }

        let confirmations = self.funding_confirmations(funding).await?;
        let required = self.config.required_confirmations;
        if confirmations < required {
            warn!(funding = %funding, confirmations, required, "funding not confirmed");
            return Err(IssueError::FundingNotConfirmed {
                funding: funding.clone(),
                confirmations,
                required,
            });
        }

        self.sign_and_record(owner, amount, funding).await
    }

    /// Wait on the confirmation poller, then mint
    pub async fn mint_when_confirmed(
        &self,
        owner: OwnerCommitment,
        amount: Amount,
        funding: &FundingRef,
    ) -> Result<MintOutcome, IssueError> {
        match self.poller.wait_for(funding.tx_hash()).await? {
            PollOutcome::Confirmed { .. } => self.mint(owner, amount, funding).await,
            PollOutcome::Exhausted { last_seen, .. } => Err(IssueError::FundingNotConfirmed {
                funding: funding.clone(),
                confirmations: last_seen.unwrap_or(0),
                required: self.config.required_confirmations,
            }),
        }
    }

    async fn funding_confirmations(&self, funding: &FundingRef) -> Result<u64, IssueError> {
        let result = self
            .config
            .retry
            .run("funding_check", |_| self.poller.check_once(funding.tx_hash()))
            .await;
        match result {
            Ok(confirmations) => Ok(confirmations),
            Err(OracleError::UnknownTransaction(_)) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn sign_and_record(
        &self,
        owner: OwnerCommitment,
        amount: Amount,
        funding: &FundingRef,
    ) -> Result<MintOutcome, IssueError> {
        let key_id = self.current_key_id()?;
        let signing_key = self
            .signing_keys
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key_id)
            .cloned()
            .ok_or_else(|| IssueError::MissingSigningKey(key_id.clone()))?;

        let now = self.clock.now_millis();
        let draft = TokenDraft {
            id: TokenId::generate(),
            amount,
            issuer_key_id: key_id.clone(),
            issued_at: now,
            expires_at: now.saturating_add(self.config.token_ttl_millis()),
            owner_commitment: owner,
        };
        let signature = Signer::sign(&signing_key, &draft.signing_bytes());
        let token = draft.into_root(signature);

        let treasury = WalletAddress::from_public_key(&signing_key.public_key());
        let mut purchase = TransactionBuilder::new(TransactionKind::TokenPurchase)
            .sender(&signing_key)
            .receiver(treasury)
            .amount(amount)
            .tokens([*token.id()])
            .created_at(now)
            .build()?
            .with_metadata("owner", &owner.to_hex())
            .with_metadata("funding", funding.tx_hash().as_str());
        purchase.set_blockchain_tx_hash(funding.tx_hash().clone());
        purchase.mark_completed(now);

        match self.store.record_mint(funding, token.clone(), purchase).await? {
            MintRecordOutcome::Inserted { ledger_ts } => {
                info!(
                    token_id = %token.id(),
                    amount = %amount,
                    issuer_key = %key_id,
                    ledger_ts,
                    "minted token"
                );
                Ok(MintOutcome::Minted(token))
            }
            MintRecordOutcome::Existing(record) => {
                debug!(funding = %funding, token_id = %record.id(), "lost mint race, returning original");
                Ok(MintOutcome::Duplicate(record.token))
            }
        }
    }
}
