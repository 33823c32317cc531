// Confirmation poller - waits for a chain transaction to reach the
// configured depth, bounded by a timeout per call and a retry budget

use crate::config::EngineConfig;
use crate::gateway::{BlockchainOracle, ChainTxHash, OracleError};
use crate::retry::RetryPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed { confirmations: u64 },
    /// Retry budget spent before the depth was reached
    Exhausted { last_seen: Option<u64>, attempts: u32 },
}

#[derive(Clone)]
pub struct ConfirmationPoller {
    oracle: Arc<dyn BlockchainOracle>,
    policy: RetryPolicy,
    timeout: Duration,
    required: u64,
}

impl ConfirmationPoller {
    pub fn new(oracle: Arc<dyn BlockchainOracle>, config: &EngineConfig) -> Self {
        Self {
            oracle,
            policy: config.retry.clone(),
            timeout: config.oracle_timeout(),
            required: config.required_confirmations,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// One timeout-bounded confirmation query
    pub async fn check_once(&self, tx_hash: &ChainTxHash) -> Result<u64, OracleError> {
        match tokio::time::timeout(self.timeout, self.oracle.get_confirmations(tx_hash)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Poll until `required` confirmations. Transient oracle failures and
    /// "not deep enough yet" both consume the retry budget; any other
    /// oracle error is returned as is.
    pub async fn wait_for(&self, tx_hash: &ChainTxHash) -> Result<PollOutcome, OracleError> {
        let last_seen = AtomicU64::new(u64::MAX);
        let attempts = AtomicU64::new(0);
        let required = self.required;

        let result = self
            .policy
            .run("confirmation_poll", |attempt| {
                let last_seen = &last_seen;
                let attempts = &attempts;
                async move {
                    attempts.store(u64::from(attempt), Ordering::SeqCst);
                    let confirmations = self.check_once(tx_hash).await?;
                    last_seen.store(confirmations, Ordering::SeqCst);
                    debug!(tx_hash = %tx_hash, confirmations, required, attempt, "polled confirmations");
                    if confirmations >= required {
                        Ok(confirmations)
                    } else {
                        Err(OracleError::NotYetConfirmed {
                            confirmations,
                            required,
                        })
                    }
                }
            })
            .await;

        let attempts = attempts.load(Ordering::SeqCst) as u32;
        match result {
            Ok(confirmations) => {
                info!(tx_hash = %tx_hash, confirmations, "chain transaction confirmed");
                Ok(PollOutcome::Confirmed { confirmations })
            }
            Err(OracleError::NotYetConfirmed { .. })
            | Err(OracleError::Unavailable(_))
            | Err(OracleError::Timeout { .. }) => {
                let seen = last_seen.load(Ordering::SeqCst);
                let last_seen = (seen != u64::MAX).then_some(seen);
                warn!(tx_hash = %tx_hash, ?last_seen, attempts, "confirmation budget exhausted");
                Ok(PollOutcome::Exhausted { last_seen, attempts })
            }
            Err(err) => Err(err),
        }
    }
}
