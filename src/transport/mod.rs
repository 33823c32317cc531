// Transport module - DEVICE TO DEVICE
// Point-to-point links that carry payment envelopes while both devices are
// offline from the ledger

mod envelope;
mod memory;
mod traits;

pub use envelope::{EnvelopeCodec, EnvelopeId, PeerEnvelope};
pub use memory::MemoryPeerLink;
pub use traits::{Ack, PeerTransport, TransportConfig, TransportError, TransportStats};
