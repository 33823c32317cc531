// Sync client - device side of reconciliation
//
// Every exchange is timeout-bounded per attempt, retried with the shared
// backoff policy on transient failures, and cancellable from another task.

use crate::retry::{RetryPolicy, RetryPolicyError, Retryable};
use crate::sync::{ProtocolError, Reconciler, SyncRequest, SyncResponse};
use crate::wallet::{Wallet, WalletError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Sync endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Ledger refused the request: {0}")]
    Remote(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Timeout { .. } | SyncError::Unavailable(_))
    }
}

impl From<WalletError> for SyncError {
    fn from(err: WalletError) -> Self {
        SyncError::Wallet(err.to_string())
    }
}

impl From<RetryPolicyError> for SyncError {
    fn from(err: RetryPolicyError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

// ============================================================================
// ENDPOINTS
// ============================================================================

/// Where a device sends its sync requests
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, SyncError>;
}

/// Endpoint backed by an in-process reconciler. Requests and responses
/// still pass through their wire encoding.
pub struct LocalEndpoint {
    reconciler: Arc<Reconciler>,
}

impl LocalEndpoint {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl SyncEndpoint for LocalEndpoint {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let request = SyncRequest::from_bytes(&request.to_bytes()?)?;
        let response = match self.reconciler.handle(request).await {
            Ok(response) => response,
            Err(err) => return Err(SyncError::Unavailable(err.to_string())),
        };
        Ok(SyncResponse::from_bytes(&response.to_bytes()?)?)
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Clone, Debug)]
pub struct SyncClientConfig {
    /// Timeout for one request attempt
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl SyncClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("timeout_ms must be > 0".to_string()));
        }
        self.retry.validate()?;
        Ok(())
    }
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cancels in-flight and future syncs of the client it came from
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Allow syncing again after a cancellation
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Result of one wallet sync, including any full resync it triggered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub response: SyncResponse,
    pub resynced: bool,
}

pub struct SyncClient {
    endpoint: Arc<dyn SyncEndpoint>,
    config: SyncClientConfig,
    cancel: CancelHandle,
}

impl SyncClient {
    pub fn new(endpoint: Arc<dyn SyncEndpoint>, config: SyncClientConfig) -> Self {
        Self {
            endpoint,
            config,
            cancel: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SyncClientConfig {
        &self.config
    }

    /// Send one request, retrying transient failures
    pub async fn send(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        self.config
            .retry
            .run("sync", |attempt| {
                let request = request.clone();
                async move {
                    if self.cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    debug!(attempt, claims = request.claims().len(), since = request.since(), "sync attempt");
                    tokio::select! {
                        _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
                        result = tokio::time::timeout(timeout, self.endpoint.sync(request)) => match result {
                            Ok(response) => response,
                            Err(_) => Err(SyncError::Timeout {
                                timeout_ms: timeout.as_millis() as u64,
                            }),
                        },
                    }
                }
            })
            .await
    }

    /// Push the wallet's pending claims and apply the answer. A rejected
    /// claim, double spends included, triggers a full resync before
    /// returning.
    pub async fn sync_wallet(&self, wallet: &mut Wallet) -> Result<SyncReport, SyncError> {
        let request = wallet.sync_request();
        let response = self.send(request).await?;
        wallet.apply_sync(&response).await?;

        if !wallet.needs_full_resync() {
            info!(
                accepted = response.accepted().count(),
                cursor = response.last_sync_timestamp,
                "wallet synced"
            );
            return Ok(SyncReport {
                response,
                resynced: false,
            });
        }

        warn!(
            rejected = response.rejected().count(),
            conflicts = response.conflicts.len(),
            "claims rejected, resyncing wallet"
        );
        let full = self.send(wallet.full_resync_request()).await?;
        wallet.apply_sync(&full).await?;
        Ok(SyncReport {
            response,
            resynced: true,
        })
    }
}
