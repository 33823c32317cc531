// Wallet module - what a holder device owns, pays and is paid while offline

mod exchange;
mod holder;
mod keyring;
mod payment;
mod snapshot;

pub use holder::{Wallet, WalletError, WalletStats};
pub use keyring::Keyring;
pub use payment::{PaymentAcceptance, PaymentOffer};
pub use snapshot::WalletSnapshot;
