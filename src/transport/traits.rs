// Transport Traits and Core Types
// The narrow peer link the wallet hands envelopes to. Discovery and the
// radio underneath are someone else's problem.

use crate::retry::Retryable;
use crate::transport::{EnvelopeCodec, EnvelopeId, PeerEnvelope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Configuration shared by peer transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Delivery/receive timeout in milliseconds
    pub message_timeout_ms: u64,
    /// Largest frame accepted for delivery
    pub max_payload_bytes: usize,
    /// Frames buffered per direction
    pub buffer_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: 5_000,
            max_payload_bytes: 256 * 1024,
            buffer_frames: 32,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_timeout_ms(mut self, ms: u64) -> Self {
        self.message_timeout_ms = ms;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_buffer_frames(mut self, frames: usize) -> Self {
        self.buffer_frames = frames;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.message_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig("message_timeout_ms cannot be 0".to_string()));
        }
        if self.buffer_frames == 0 {
            return Err(TransportError::InvalidConfig("buffer_frames cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// ACKNOWLEDGEMENT
// ============================================================================

/// Receipt returned by the peer for one delivered frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub envelope_id: EnvelopeId,
    pub bytes: usize,
}

impl Ack {
    pub fn for_frame(frame: &[u8]) -> Self {
        Self {
            envelope_id: EnvelopeId::of(frame),
            bytes: frame.len(),
        }
    }

    /// True when this ack acknowledges exactly `frame`
    pub fn matches(&self, frame: &[u8]) -> bool {
        self.bytes == frame.len() && self.envelope_id == EnvelopeId::of(frame)
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Peer link timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Peer link closed")]
    Closed,

    #[error("Payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Peer acknowledged a different frame")]
    AckMismatch,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::SendFailed(_) | Self::ReceiveFailed(_) | Self::AckMismatch
        )
    }
}

// ============================================================================
// TRANSPORT STATISTICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// A point-to-point link to one nearby peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hand `frame` to the peer and wait for its acknowledgement
    async fn deliver(&self, frame: Vec<u8>) -> Result<Ack, TransportError>;

    /// Wait for the next frame from the peer, acknowledging it
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    fn stats(&self) -> TransportStats;

    async fn send_envelope(&self, envelope: &PeerEnvelope) -> Result<Ack, TransportError> {
        let frame = EnvelopeCodec::encode(envelope)?;
        let ack = self.deliver(frame.clone()).await?;
        if !ack.matches(&frame) {
            return Err(TransportError::AckMismatch);
        }
        Ok(ack)
    }

    async fn receive_envelope(&self) -> Result<PeerEnvelope, TransportError> {
        let frame = self.receive().await?;
        EnvelopeCodec::decode(&frame)
    }
}
