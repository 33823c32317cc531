// Identity module - Ed25519 keys, wallet addresses, owner commitments and the
// issuer key registry

mod address;
mod encoding;
mod keypair;
mod registry;
mod signer;

pub use address::*;
pub use keypair::*;
pub use registry::*;
pub use signer::*;
