//! Sealed event transport over an opaque byte pipe.
//!
//! The daemon does not own a network stack. Whatever carries bytes between
//! two devices implements [`BytePipe`]; a [`SecureLink`] wraps it and moves
//! MessagePack [`Envelope`]s sealed with the session's AEAD cipher.

use std::sync::Arc;

use bytes::Bytes;
use tether_protocol::{
    AeadCipher, AppEvent, DeviceId, Envelope, ProtocolError, RotatedKey, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::router::Delivery;
use crate::session::SessionId;

/// Errors that can occur on a secure link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Sealing, opening or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The pipe is closed.
    #[error("pipe closed")]
    Closed,

    /// An envelope arrived out of order or twice.
    #[error("replayed envelope: sequence {sequence} after {last}")]
    Replay { sequence: u64, last: u64 },

    /// The peer speaks another protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

/// A bidirectional, message-oriented byte channel.
#[allow(async_fn_in_trait)]
pub trait BytePipe: Send {
    /// Sends one frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Receives one frame, or `None` once the peer has closed the pipe.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// In-process [`BytePipe`] backed by channels.
pub struct MemoryPipe {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Creates two connected in-process pipes.
pub fn memory_pipe_pair(capacity: usize) -> (MemoryPipe, MemoryPipe) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryPipe { tx: a_tx, rx: b_rx },
        MemoryPipe { tx: b_tx, rx: a_rx },
    )
}

impl BytePipe for MemoryPipe {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// AEAD-sealed envelope stream over a [`BytePipe`].
///
/// Every frame is bound to the session id as associated data, so frames
/// cannot be moved between sessions that happen to share a key.
pub struct SecureLink<P: BytePipe> {
    pipe: P,
    cipher: AeadCipher,
    session_id: SessionId,
    local: DeviceId,
    next_sequence: u64,
    last_received: Option<u64>,
}

impl<P: BytePipe> SecureLink<P> {
    pub fn new(pipe: P, cipher: AeadCipher, session_id: SessionId, local: DeviceId) -> Self {
        Self {
            pipe,
            cipher,
            session_id,
            local,
            next_sequence: 0,
            last_received: None,
        }
    }

    /// The cipher's key epoch.
    pub fn epoch(&self) -> u64 {
        self.cipher.epoch()
    }

    fn seal(&mut self, source: DeviceId, event: AppEvent) -> Result<Bytes, TransportError> {
        let envelope = Envelope::new(self.next_sequence, source, event);
        let plaintext = zeroize::Zeroizing::new(envelope.to_msgpack()?);
        let sealed = self
            .cipher
            .encrypt(&plaintext, Some(self.session_id.as_bytes()))?;
        self.next_sequence += 1;
        Ok(Bytes::from(sealed))
    }

    /// Seals and sends an event produced by this device.
    pub async fn send_event(&mut self, event: AppEvent) -> Result<(), TransportError> {
        let frame = self.seal(self.local.clone(), event)?;
        self.pipe.send(frame).await
    }

    /// Seals and sends an event routed from another participant.
    pub async fn forward(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        trace!(
            session_id = %self.session_id,
            source = %delivery.source,
            kind = delivery.event.kind(),
            "Forwarding event"
        );
        let frame = self.seal(delivery.source.clone(), delivery.event.clone())?;
        self.pipe.send(frame).await
    }

    /// Receives and opens the next envelope, or `None` once the pipe closes.
    pub async fn recv_event(&mut self) -> Result<Option<Envelope>, TransportError> {
        let Some(frame) = self.pipe.recv().await? else {
            return Ok(None);
        };

        let plaintext = zeroize::Zeroizing::new(
            self.cipher
                .decrypt(&frame, Some(self.session_id.as_bytes()))?,
        );
        let envelope = Envelope::from_msgpack(&plaintext)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(TransportError::UnsupportedVersion(envelope.version));
        }
        if let Some(last) = self.last_received {
            if envelope.sequence <= last {
                warn!(
                    session_id = %self.session_id,
                    sequence = envelope.sequence,
                    last,
                    "Replayed envelope rejected"
                );
                return Err(TransportError::Replay {
                    sequence: envelope.sequence,
                    last,
                });
            }
        }
        self.last_received = Some(envelope.sequence);
        Ok(Some(envelope))
    }

    /// Switches to fresh key material. The returned key must reach the peer
    /// over an already protected channel.
    pub fn rotate_key(&mut self) -> Result<RotatedKey, TransportError> {
        let key = self.cipher.rotate_key()?;
        debug!(session_id = %self.session_id, epoch = self.cipher.epoch(), "Link key rotated");
        Ok(key)
    }

    /// Installs key material rotated by the peer.
    pub fn install_key(&mut self, key: &[u8]) -> Result<(), TransportError> {
        self.cipher.install_key(key)?;
        Ok(())
    }

    /// Forwards everything a router puts into `outbox` until the outbox
    /// closes or `cancel` fires. Returns the number of forwarded events.
    pub async fn run_outbox(
        &mut self,
        mut outbox: mpsc::Receiver<Arc<Delivery>>,
        cancel: CancellationToken,
    ) -> Result<usize, TransportError> {
        let mut forwarded = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = outbox.recv() => {
                    let Some(delivery) = delivery else { break };
                    self.forward(&delivery).await?;
                    forwarded += 1;
                }
            }
        }
        Ok(forwarded)
    }

    /// Zeroizes the key material and returns the pipe.
    pub fn close(mut self) -> P {
        self.cipher.dispose();
        self.pipe
    }
}
