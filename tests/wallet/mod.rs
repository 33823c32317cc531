#[path = "../common/mod.rs"]
mod common;

mod exchange_test;
mod holder_test;
