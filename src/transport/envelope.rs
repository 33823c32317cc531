// Peer envelopes - what two devices exchange during an offline payment
//
// Frames are postcard-encoded envelopes. Text forms (hex, base64) exist for
// links that can only carry strings, such as QR codes.

use crate::token::{from_wire, to_wire, OfflineToken};
use crate::transaction::TransactionId;
use crate::transport::TransportError;
use crate::wallet::{PaymentAcceptance, PaymentOffer};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content hash of one encoded frame
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId([u8; 32]);

impl EnvelopeId {
    pub fn of(frame: &[u8]) -> Self {
        Self(Sha256::digest(frame).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvelopeId({})", self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEnvelope {
    /// Payer -> payee: signed transfer plus the tokens it spends
    Offer(PaymentOffer),
    /// Payee -> payer: countersignature for an accepted offer
    Acceptance(PaymentAcceptance),
    /// Payee -> payer: the offer was refused
    Rejection {
        transaction_id: TransactionId,
        reason: String,
    },
    /// Freshly issued tokens handed to their owner's device
    TokenBundle(Vec<OfflineToken>),
}

impl PeerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerEnvelope::Offer(_) => "offer",
            PeerEnvelope::Acceptance(_) => "acceptance",
            PeerEnvelope::Rejection { .. } => "rejection",
            PeerEnvelope::TokenBundle(_) => "token_bundle",
        }
    }
}

pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn encode(envelope: &PeerEnvelope) -> Result<Vec<u8>, TransportError> {
        to_wire(envelope).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<PeerEnvelope, TransportError> {
        from_wire(frame).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    pub fn encode_hex(envelope: &PeerEnvelope) -> Result<String, TransportError> {
        Ok(hex::encode(Self::encode(envelope)?))
    }

    pub fn decode_hex(text: &str) -> Result<PeerEnvelope, TransportError> {
        let frame = hex::decode(text.trim()).map_err(|e| TransportError::SerializationError(e.to_string()))?;
        Self::decode(&frame)
    }

    pub fn encode_base64(envelope: &PeerEnvelope) -> Result<String, TransportError> {
        Ok(URL_SAFE_NO_PAD.encode(Self::encode(envelope)?))
    }

    pub fn decode_base64(text: &str) -> Result<PeerEnvelope, TransportError> {
        let frame = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        Self::decode(&frame)
    }
}
