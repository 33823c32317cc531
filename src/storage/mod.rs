// Storage module - PERSISTENCE
// Durable sled backends: the authoritative ledger and a device's own state

mod device;
mod ledger;

pub use device::{DeviceStore, DeviceStoreError, StorageStats};
pub use ledger::SledLedgerStore;
