//! Transport Channel
//!
//! Abstract bidirectional message channel the engine sends through. Sends
//! are fire-and-forget and must never block the caller; inbound messages
//! are fed to the engine by its host (see [`SyncDriver`](crate::SyncDriver)).

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound half of a session connection
pub trait Transport: Send {
    /// Queue a message for delivery without waiting for it
    fn send(&mut self, envelope: Envelope) -> TransportResult<()>;

    /// Check if the transport can currently deliver
    fn is_connected(&self) -> bool {
        true
    }

    /// Get transport statistics
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    /// Total messages sent
    pub messages_sent: u64,
    /// Number of send errors
    pub send_errors: u64,
}

/// In-process transport backed by an unbounded channel
///
/// The receiving half is typically drained by a socket writer task, or by
/// another engine in tests.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Envelope>,
    stats: TransportStats,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            sender,
            stats: TransportStats::default(),
        }
    }

    /// Create a transport together with the receiver for its messages
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        match self.sender.send(envelope) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                Ok(())
            }
            Err(_) => {
                self.stats.send_errors += 1;
                Err(TransportError::Closed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
