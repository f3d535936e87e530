//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! Each opened connection is served by a background worker task that owns the
//! socket. Writes are handed to the worker over an unbounded queue; the handle
//! tracks how many submitted bytes have not been written and flushed yet.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use crate::stream::config::Endpoint;
use crate::stream::message::{Message, ReadyState};
use crate::stream::transport::{Transport, TransportConnection, TransportEvent, TransportEvents};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Transport that opens real websocket connections.
///
/// [`open`](Transport::open) spawns onto the current tokio runtime, so it
/// must be called from within one.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    fn open(&self, endpoint: &Endpoint, events: TransportEvents) -> WebSocketConnection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(SocketState::default());
        let url = endpoint.url();

        tokio::spawn(socket_worker(url, outbound_rx, events, Arc::clone(&socket)));

        WebSocketConnection {
            outbound: outbound_tx,
            socket,
        }
    }
}

enum Outbound {
    Frame(Message),
    Close,
}

#[derive(Debug, Default)]
struct SocketState {
    ready: AtomicU8,
    pending_bytes: AtomicUsize,
}

impl SocketState {
    fn ready_state(&self) -> ReadyState {
        match self.ready.load(Ordering::SeqCst) {
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }

    /// Moves from connecting to open; fails if the handle was closed meanwhile.
    fn mark_open(&self) -> bool {
        self.ready
            .compare_exchange(STATE_CONNECTING, STATE_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_closed(&self) {
        self.ready.store(STATE_CLOSED, Ordering::SeqCst);
    }
}

/// Handle to one websocket connection opened by [`WebSocketTransport`].
#[derive(Debug)]
pub struct WebSocketConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    socket: Arc<SocketState>,
}

impl TransportConnection for WebSocketConnection {
    fn write(&self, message: Message) {
        let len = message.len();
        self.socket.pending_bytes.fetch_add(len, Ordering::SeqCst);
        if self.outbound.send(Outbound::Frame(message)).is_err() {
            self.socket.pending_bytes.fetch_sub(len, Ordering::SeqCst);
        }
    }

    fn pending_outbound_bytes(&self) -> usize {
        self.socket.pending_bytes.load(Ordering::SeqCst)
    }

    fn ready_state(&self) -> ReadyState {
        self.socket.ready_state()
    }

    fn close(&self) {
        self.socket.mark_closed();
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn socket_worker(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
    socket: Arc<SocketState>,
) {
    let connecting = connect_async(url.as_str());
    tokio::pin!(connecting);

    // A close during the handshake drops the pending connect and its socket.
    let stream = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok((stream, _)) => break stream,
                Err(err) => {
                    debug!(event = "websocket_connect_failed", url = %url, error = %err);
                    socket.mark_closed();
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            },
            maybe_outbound = outbound_rx.recv() => match maybe_outbound {
                Some(Outbound::Frame(message)) => {
                    socket.pending_bytes.fetch_sub(message.len(), Ordering::SeqCst);
                }
                Some(Outbound::Close) | None => {
                    debug!(event = "websocket_connect_cancelled", url = %url);
                    socket.mark_closed();
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            },
        }
    };

    let (mut write, mut read) = stream.split();

    if !socket.mark_open() {
        let _ = write.send(WsMessage::Close(None)).await;
        let _ = events.send(TransportEvent::Closed);
        return;
    }
    debug!(event = "websocket_open", url = %url);
    let _ = events.send(TransportEvent::Opened);

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Frame(message)) => {
                        let len = message.len();
                        let result = write.send(into_ws_message(message)).await;
                        socket.pending_bytes.fetch_sub(len, Ordering::SeqCst);
                        if let Err(err) = result {
                            warn!(event = "websocket_write_failed", url = %url, error = %err);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            maybe_inbound = read.next() => {
                match maybe_inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        trace!(event = "websocket_inbound", kind = "text", len = text.len());
                        let _ = events.send(TransportEvent::Message(Message::Text(text.to_string())));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        trace!(event = "websocket_inbound", kind = "binary", len = data.len());
                        let _ = events.send(TransportEvent::Message(Message::Binary(data.to_vec())));
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(event = "websocket_read_failed", url = %url, error = %err);
                        break;
                    }
                }
            }
        }
    }

    socket.mark_closed();
    debug!(event = "websocket_closed", url = %url);
    let _ = events.send(TransportEvent::Closed);
}

fn into_ws_message(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text.into()),
        Message::Binary(data) => WsMessage::Binary(data.into()),
    }
}
