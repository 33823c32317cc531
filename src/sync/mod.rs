// Sync module - HOW DEVICES RECONCILE
// Wire protocol, the ledger-side reconciler and the device-side client

mod client;
mod protocol;
mod reconciler;

pub use client::{
    CancelHandle, LocalEndpoint, SyncClient, SyncClientConfig, SyncEndpoint, SyncError, SyncReport,
};
pub use protocol::{ClaimOutcome, ProtocolError, SyncRequest, SyncResponse};
pub use reconciler::{ReconcileError, ReconcileResult, Reconciler};
