// Engine configuration
//
// Builder-style settings shared by the issuer, divider, transaction
// processor and reconciler.

use crate::retry::RetryPolicy;
use crate::token::Amount;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the token engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Largest amount a single mint may carry
    pub max_mint_amount: Amount,
    /// Lifetime of a freshly minted token in seconds
    pub token_ttl_secs: u64,
    /// Chain confirmations needed before funding or online transfers count
    pub required_confirmations: u64,
    /// Smallest unit a division may produce; every child is a multiple of it
    pub min_division_unit: Amount,
    /// Re-read/re-validate rounds after a lost compare-and-set
    pub cas_retry_limit: u32,
    /// Timeout for each ledger store call in milliseconds
    pub store_timeout_ms: u64,
    /// Timeout for each oracle call in milliseconds
    pub oracle_timeout_ms: u64,
    /// Backoff for oracle polling and funding confirmation
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_mint_amount: Amount::from_minor(1_000_000),
            token_ttl_secs: 7 * 24 * 60 * 60,
            required_confirmations: 6,
            min_division_unit: Amount::from_minor(1),
            cas_retry_limit: 3,
            store_timeout_ms: 2_000,
            oracle_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_mint_amount(mut self, amount: Amount) -> Self {
        self.max_mint_amount = amount;
        self
    }

    pub fn with_token_ttl_secs(mut self, secs: u64) -> Self {
        self.token_ttl_secs = secs;
        self
    }

    pub fn with_required_confirmations(mut self, confirmations: u64) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    pub fn with_min_division_unit(mut self, unit: Amount) -> Self {
        self.min_division_unit = unit;
        self
    }

    pub fn with_cas_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }

    pub fn with_store_timeout_ms(mut self, ms: u64) -> Self {
        self.store_timeout_ms = ms;
        self
    }

    pub fn with_oracle_timeout_ms(mut self, ms: u64) -> Self {
        self.oracle_timeout_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn token_ttl_millis(&self) -> u64 {
        self.token_ttl_secs.saturating_mul(1_000)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_mint_amount.is_zero() {
            return Err(ConfigError::Invalid("max_mint_amount must be > 0".into()));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be > 0".into()));
        }
        if self.min_division_unit.is_zero() {
            return Err(ConfigError::Invalid("min_division_unit must be > 0".into()));
        }
        if self.store_timeout_ms == 0 || self.oracle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        self.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}
