// Sync Client Tests
// Retry, timeout and cancellation around an endpoint

use async_trait::async_trait;
use offlinepay::retry::RetryPolicy;
use offlinepay::sync::{SyncClient, SyncClientConfig, SyncEndpoint, SyncError, SyncRequest, SyncResponse};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::common::{amount, Harness};

/// Fails the first `failures` calls, then answers with an empty response
struct FlakyEndpoint {
    failures: usize,
    delay: Duration,
    calls: AtomicUsize,
}

impl FlakyEndpoint {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            failures: 0,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncEndpoint for FlakyEndpoint {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.failures {
            return Err(SyncError::Unavailable("ledger down".to_string()));
        }
        Ok(SyncResponse {
            last_sync_timestamp: request.since() + 1,
            ..Default::default()
        })
    }
}

fn client(endpoint: Arc<FlakyEndpoint>, attempts: u32, timeout_ms: u64) -> SyncClient {
    SyncClient::new(
        endpoint,
        SyncClientConfig::new()
            .with_timeout_ms(timeout_ms)
            .with_retry(RetryPolicy::immediate(attempts)),
    )
}

// ============================================================================
// RETRY
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let endpoint = Arc::new(FlakyEndpoint::new(2));
    let client = client(endpoint.clone(), 3, 1_000);

    let response = client.send(SyncRequest::new(41)).await.expect("third attempt succeeds");
    assert_eq!(response.last_sync_timestamp, 42);
    assert_eq!(endpoint.calls(), 3);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let endpoint = Arc::new(FlakyEndpoint::new(10));
    let client = client(endpoint.clone(), 3, 1_000);

    let err = client.send(SyncRequest::new(0)).await.unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(_)));
    assert_eq!(endpoint.calls(), 3);
}

// ============================================================================
// TIMEOUT & CANCEL
// ============================================================================

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let endpoint = Arc::new(FlakyEndpoint::slow(Duration::from_millis(500)));
    let client = client(endpoint.clone(), 2, 20);

    let err = client.send(SyncRequest::new(0)).await.unwrap_err();
    assert_eq!(err, SyncError::Timeout { timeout_ms: 20 });
    assert_eq!(endpoint.calls(), 2);
}

#[tokio::test]
async fn test_cancel_stops_in_flight_sync() {
    let endpoint = Arc::new(FlakyEndpoint::slow(Duration::from_secs(5)));
    let client = client(endpoint.clone(), 3, 10_000);
    let handle = client.cancel_handle();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });
    let err = client.send(SyncRequest::new(0)).await.unwrap_err();
    canceller.await.expect("canceller");

    assert_eq!(err, SyncError::Cancelled);
    assert_eq!(endpoint.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_client_refuses_until_reset() {
    let endpoint = Arc::new(FlakyEndpoint::new(0));
    let client = client(endpoint.clone(), 3, 1_000);
    let handle = client.cancel_handle();

    handle.cancel();
    assert!(handle.is_cancelled());
    assert_eq!(client.send(SyncRequest::new(0)).await.unwrap_err(), SyncError::Cancelled);
    assert_eq!(endpoint.calls(), 0);

    handle.reset();
    assert!(client.send(SyncRequest::new(0)).await.is_ok());
}

// ============================================================================
// CONFIG & LOCAL ENDPOINT
// ============================================================================

#[test]
fn test_config_validation() {
    assert!(SyncClientConfig::default().validate().is_ok());
    assert!(matches!(
        SyncClientConfig::new().with_timeout_ms(0).validate(),
        Err(SyncError::InvalidConfig(_))
    ));
}

/// Test: a wallet with nothing pending syncs against the in-process ledger
#[tokio::test]
async fn test_local_endpoint_sync() {
    let harness = Harness::new();
    let mut wallet = harness.funded_wallet(15).await;
    let report = harness.sync_client().sync_wallet(&mut wallet).await.expect("sync");

    assert!(!report.resynced);
    assert!(report.response.outcomes.is_empty());
    assert_eq!(report.response.tokens.len(), 1);
    assert_eq!(wallet.last_sync_timestamp(), report.response.last_sync_timestamp);
    assert_eq!(wallet.offline_balance().await.expect("balance"), amount(15));
}
