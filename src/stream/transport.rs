//! Transport seam between the stream client and a persistent socket.
//!
//! A [`Transport`] opens one [`TransportConnection`] per connect cycle. Each
//! connection reports its lifecycle on its own [`TransportEvents`] channel, so
//! notifications from a replaced connection can never be mistaken for the
//! current one. The client treats every close the same way; no error detail
//! is carried.

use tokio::sync::mpsc;

use crate::stream::config::Endpoint;
use crate::stream::message::{Message, ReadyState};

/// Notification emitted by a transport connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection finished its handshake and is ready for traffic.
    Opened,
    /// A complete inbound message.
    Message(Message),
    /// The connection is gone, whether it was refused, dropped, or closed.
    Closed,
}

/// Sending half of a connection's notification channel.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Factory for transport connections.
///
/// `open` must not block: it starts the handshake and returns a handle right
/// away, reporting progress through `events`. Implementations send at most one
/// [`TransportEvent::Closed`] and nothing after it.
pub trait Transport: Send + Sync + 'static {
    /// Connection handle type produced by [`open`](Transport::open).
    type Connection: TransportConnection;

    /// Starts opening a connection to `endpoint`.
    fn open(&self, endpoint: &Endpoint, events: TransportEvents) -> Self::Connection;
}

/// A single live (or opening) transport connection.
pub trait TransportConnection: Send + Sync + 'static {
    /// Submits a payload for delivery without waiting for it to be written.
    fn write(&self, message: Message);

    /// Bytes submitted through [`write`](Self::write) that are not yet flushed.
    fn pending_outbound_bytes(&self) -> usize;

    /// Current readiness of this connection.
    fn ready_state(&self) -> ReadyState;

    /// Starts closing the connection. Idempotent.
    fn close(&self);
}
