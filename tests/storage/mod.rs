#[path = "../common/mod.rs"]
mod common;

mod device_test;
mod sled_ledger_test;
