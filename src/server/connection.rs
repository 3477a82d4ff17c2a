use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SendError;
use crate::protocol::Outbound;

/// Opaque connection identity. Issued once per accepted socket, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cheap, cloneable handle to one live connection: its outbound queue and
/// its close signal. The socket itself stays with the connection's pumps.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub peer: Arc<str>,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Builds a handle and the receiving end its write pump drains.
    pub fn channel(
        id: ConnId,
        peer: impl Into<Arc<str>>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                peer: peer.into(),
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queues a frame without waiting. A full queue means the peer has
    /// stopped reading: the connection is closed and `QueueFull` returned.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn = %self.id, peer = %self.peer, "outbound queue full, closing");
                self.close();
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(SendError::Closed)
            }
        }
    }

    pub fn send_message(&self, msg: &Outbound) -> Result<(), SendError> {
        match msg.encode() {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "encoding outbound message failed");
                Ok(())
            }
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
