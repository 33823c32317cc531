// In-process peer link
//
// Two ends joined by bounded tokio channels. Each frame travels with a
// oneshot the receiving end answers with its ack, so `deliver` returns only
// once the peer has actually taken the frame.

use crate::transport::{Ack, PeerTransport, TransportConfig, TransportError, TransportStats};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

struct Frame {
    bytes: Vec<u8>,
    ack: oneshot::Sender<Ack>,
}

pub struct MemoryPeerLink {
    outgoing: mpsc::Sender<Frame>,
    incoming: Mutex<mpsc::Receiver<Frame>>,
    config: TransportConfig,
    stats: StdMutex<TransportStats>,
}

impl MemoryPeerLink {
    /// Two connected ends sharing one configuration
    pub fn pair(config: TransportConfig) -> Result<(Self, Self), TransportError> {
        config.validate()?;
        let (a_tx, b_rx) = mpsc::channel(config.buffer_frames);
        let (b_tx, a_rx) = mpsc::channel(config.buffer_frames);
        let a = Self::new(a_tx, a_rx, config.clone());
        let b = Self::new(b_tx, b_rx, config);
        Ok((a, b))
    }

    fn new(outgoing: mpsc::Sender<Frame>, incoming: mpsc::Receiver<Frame>, config: TransportConfig) -> Self {
        Self {
            outgoing,
            incoming: Mutex::new(incoming),
            config,
            stats: StdMutex::new(TransportStats::default()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.message_timeout_ms)
    }

    fn record(&self, update: impl FnOnce(&mut TransportStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut stats);
    }

    fn fail(&self, err: TransportError) -> TransportError {
        self.record(|s| s.errors += 1);
        err
    }
}

#[async_trait]
impl PeerTransport for MemoryPeerLink {
    async fn deliver(&self, frame: Vec<u8>) -> Result<Ack, TransportError> {
        let size = frame.len();
        if size > self.config.max_payload_bytes {
            return Err(self.fail(TransportError::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            }));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let timeout_ms = self.config.message_timeout_ms;
        let exchange = async {
            self.outgoing
                .send(Frame {
                    bytes: frame,
                    ack: ack_tx,
                })
                .await
                .map_err(|_| TransportError::Closed)?;
            ack_rx
                .await
                .map_err(|_| TransportError::SendFailed("peer dropped the frame".to_string()))
        };

        let ack = match tokio::time::timeout(self.timeout(), exchange).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(err)) => return Err(self.fail(err)),
            Err(_) => {
                warn!(timeout_ms, size, "peer did not acknowledge frame");
                return Err(self.fail(TransportError::Timeout { timeout_ms }));
            }
        };

        self.record(|s| {
            s.frames_sent += 1;
            s.bytes_sent += size as u64;
        });
        debug!(envelope_id = %ack.envelope_id, size, "frame delivered");
        Ok(ack)
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let timeout_ms = self.config.message_timeout_ms;
        let mut incoming = self.incoming.lock().await;
        let frame = match tokio::time::timeout(self.timeout(), incoming.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(self.fail(TransportError::Closed)),
            Err(_) => return Err(self.fail(TransportError::Timeout { timeout_ms })),
        };
        drop(incoming);

        let ack = Ack::for_frame(&frame.bytes);
        // The sender may have timed out already; the frame is still ours
        let _ = frame.ack.send(ack);
        self.record(|s| {
            s.frames_received += 1;
            s.bytes_received += frame.bytes.len() as u64;
        });
        Ok(frame.bytes)
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
