// Blockchain oracle - the narrow view of the chain this engine consumes:
// confirmation depth, balances and payload submission

use crate::identity::WalletAddress;
use crate::retry::Retryable;
use crate::token::Amount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// On-chain transaction hash
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainTxHash(String);

impl ChainTxHash {
    pub fn new(hash: &str) -> Self {
        Self(hash.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainTxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the on-chain payment that funds a mint.
/// Doubles as the mint idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FundingRef(ChainTxHash);

impl FundingRef {
    pub fn new(tx_hash: ChainTxHash) -> Self {
        Self(tx_hash)
    }

    pub fn tx_hash(&self) -> &ChainTxHash {
        &self.0
    }
}

impl fmt::Display for FundingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "funding:{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Unknown chain transaction: {0}")]
    UnknownTransaction(ChainTxHash),

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Only {confirmations} of {required} confirmations")]
    NotYetConfirmed { confirmations: u64, required: u64 },
}

impl Retryable for OracleError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::Unavailable(_) | OracleError::Timeout { .. } | OracleError::NotYetConfirmed { .. }
        )
    }
}

// ============================================================================
// ORACLE TRAIT
// ============================================================================

#[async_trait]
pub trait BlockchainOracle: Send + Sync {
    /// Current confirmation depth of a chain transaction
    async fn get_confirmations(&self, tx_hash: &ChainTxHash) -> Result<u64, OracleError>;

    /// Broadcast a signed payload, returning its chain hash
    async fn submit(&self, payload: &[u8]) -> Result<ChainTxHash, OracleError>;

    async fn balance(&self, address: &WalletAddress) -> Result<Amount, OracleError>;
}

// ============================================================================
// MOCK ORACLE
// ============================================================================

/// In-process chain for tests and the demo binary
pub struct MockOracle {
    confirmations: Mutex<HashMap<ChainTxHash, u64>>,
    balances: Mutex<HashMap<WalletAddress, Amount>>,
    /// Depth added to a known transaction on every confirmation query
    growth_per_poll: u64,
    delay_ms: u64,
    failures_before_success: usize,
    reject_submissions: bool,
    call_count: AtomicUsize,
    submit_count: AtomicUsize,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            confirmations: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            growth_per_poll: 0,
            delay_ms: 0,
            failures_before_success: 0,
            reject_submissions: false,
            call_count: AtomicUsize::new(0),
            submit_count: AtomicUsize::new(0),
        }
    }

    /// Known transactions gain this many confirmations per query
    pub fn with_growth_per_poll(mut self, blocks: u64) -> Self {
        self.growth_per_poll = blocks;
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Fail the first N calls with `Unavailable`, then behave normally
    pub fn with_failures_then_success(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    pub fn with_rejected_submissions(mut self) -> Self {
        self.reject_submissions = true;
        self
    }

    pub fn set_confirmations(&self, tx_hash: &ChainTxHash, confirmations: u64) {
        lock(&self.confirmations).insert(tx_hash.clone(), confirmations);
    }

    pub fn set_balance(&self, address: &WalletAddress, amount: Amount) {
        lock(&self.balances).insert(address.clone(), amount);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Successful submissions so far
    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), OracleError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let call_num = self.call_count.fetch_add(1, Ordering::SeqCst);
        if call_num < self.failures_before_success {
            return Err(OracleError::Unavailable("mock failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BlockchainOracle for MockOracle {
    async fn get_confirmations(&self, tx_hash: &ChainTxHash) -> Result<u64, OracleError> {
        self.enter().await?;
        let mut confirmations = lock(&self.confirmations);
        let depth = confirmations
            .get_mut(tx_hash)
            .ok_or_else(|| OracleError::UnknownTransaction(tx_hash.clone()))?;
        let seen = *depth;
        *depth = depth.saturating_add(self.growth_per_poll);
        Ok(seen)
    }

    async fn submit(&self, payload: &[u8]) -> Result<ChainTxHash, OracleError> {
        self.enter().await?;
        if self.reject_submissions {
            return Err(OracleError::Rejected("mock rejects submissions".to_string()));
        }
        let n = self.submit_count.fetch_add(1, Ordering::SeqCst);
        let digest = hex::encode(Sha256::digest(payload));
        let hash = ChainTxHash(format!("0xmock{}{}", n, &digest[..16]));
        lock(&self.confirmations).insert(hash.clone(), 0);
        Ok(hash)
    }

    async fn balance(&self, address: &WalletAddress) -> Result<Amount, OracleError> {
        self.enter().await?;
        Ok(lock(&self.balances).get(address).copied().unwrap_or(Amount::ZERO))
    }
}
