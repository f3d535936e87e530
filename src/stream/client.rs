//! Resilient stream client.
//!
//! A [`StreamClient`] owns one logical connection to an [`Endpoint`] and keeps
//! it alive across transport drops. A background driver task consumes the
//! current connection's notifications and funnels every inbound message into
//! two sinks: the [`EventBus`] (push) and the pull-protocol buffer behind
//! [`StreamClient::next`]. When the transport closes, the driver either
//! schedules a reconnect after a backoff delay or settles into the terminal
//! `Closed` phase.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::stream::buffer::{MessageBuffer, Waiter};
use crate::stream::config::{Endpoint, StreamConfig, StreamDefaults};
use crate::stream::events::{EventBus, Subscription};
use crate::stream::message::{Message, ReadyState};
use crate::stream::transport::{Transport, TransportConnection, TransportEvent};
use crate::stream::websocket::WebSocketTransport;

/// Lifecycle phase of a [`StreamClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionPhase {
    /// Constructed, `connect` not called yet.
    Disconnected,
    /// A connection is being opened.
    Connecting,
    /// The current connection is open.
    Open,
    /// Waiting out the backoff delay before the next connect.
    Reconnecting,
    /// Terminal: shut down explicitly, or closed with auto-reconnect off.
    Closed,
}

/// Errors returned by stream client operations.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// `next` found nothing buffered and no open connection.
    #[error("stream is not connected")]
    NotConnected,

    /// `send` found the connection not open, or it dropped mid-flush.
    #[error("connection is not open")]
    NotOpen,

    /// `send` gave up waiting for the outbound buffer to drain.
    ///
    /// The payload may still be delivered.
    #[error("timed out waiting for outbound buffer to flush")]
    Timeout,

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint address could not be used.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Auto-reconnecting duplex message stream client.
///
/// Clones share one connection. The connection is shut down when
/// [`close`](Self::close) is called or the last clone is dropped.
pub struct StreamClient<T: Transport = WebSocketTransport> {
    handle: Arc<ClientHandle<T>>,
}

impl<T: Transport> Clone for StreamClient<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl StreamClient<WebSocketTransport> {
    /// Creates a websocket client with the default configuration.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, StreamConfig::default())
    }

    /// Creates a websocket client with an explicit configuration.
    pub fn with_config(endpoint: Endpoint, config: StreamConfig) -> Self {
        Self::with_transport(endpoint, config, WebSocketTransport::new())
    }
}

impl<T: Transport> StreamClient<T> {
    /// Creates a client over a custom transport.
    ///
    /// No connection is made until [`connect`](Self::connect).
    pub fn with_transport(endpoint: Endpoint, config: StreamConfig, transport: T) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        let shared = Arc::new(Shared {
            endpoint,
            config,
            transport,
            events: EventBus::new(),
            phase_tx,
            state: Mutex::new(ClientState {
                phase: ConnectionPhase::Disconnected,
                connection: None,
                reconnect_attempts: 0,
                stop: false,
                inbox: MessageBuffer::new(),
            }),
        });
        Self {
            handle: Arc::new(ClientHandle { shared }),
        }
    }

    fn shared(&self) -> &Arc<Shared<T>> {
        &self.handle.shared
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared().endpoint
    }

    /// Reconnect configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.shared().config
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionPhase {
        self.shared().state.lock().phase
    }

    /// Returns `true` while the current connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionPhase::Open
    }

    /// Consecutive failed connection cycles since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared().state.lock().reconnect_attempts
    }

    /// Inbound message events.
    pub fn events(&self) -> &EventBus {
        &self.shared().events
    }

    /// Registers a listener for every inbound message.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.events().message.on(listener)
    }

    /// Registers a listener for inbound text payloads.
    pub fn on_text<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events().text.on(listener)
    }

    /// Registers a listener for inbound binary payloads.
    pub fn on_binary<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.events().binary.on(listener)
    }

    /// Registers a listener for the next inbound message only.
    pub fn once_message<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&Message) + Send + 'static,
    {
        self.events().message.once(listener)
    }

    /// Registers a listener for the next inbound text payload only.
    pub fn once_text<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.events().text.once(listener)
    }

    /// Registers a listener for the next inbound binary payload only.
    pub fn once_binary<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.events().binary.once(listener)
    }

    /// Opens the connection and waits until it is open.
    ///
    /// Transport failures are never returned: a refused or dropped connection
    /// is retried with backoff, and this future keeps waiting. It also returns
    /// once the client reaches the terminal `Closed` phase, so a client with
    /// auto-reconnect disabled cannot hang here. Check [`state`](Self::state)
    /// to tell the two apart.
    ///
    /// Calling this while a connection cycle is already running only waits.
    pub async fn connect(&self) {
        let shared = self.shared();
        let mut phase_rx = shared.phase_tx.subscribe();

        if let Some(events) = shared.begin_connect() {
            tokio::spawn(run_connection_cycles(Arc::clone(shared), events));
        }

        loop {
            let phase = *phase_rx.borrow_and_update();
            if matches!(phase, ConnectionPhase::Open | ConnectionPhase::Closed) {
                return;
            }
            if phase_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Receives the next inbound message.
    ///
    /// Buffered messages are returned first, even after shutdown. `Ok(None)`
    /// marks the end of the stream and is returned for every call once the
    /// client is closed and the buffer is drained. With nothing buffered and
    /// no open connection this fails with [`StreamClientError::NotConnected`]
    /// instead of waiting.
    pub async fn next(&self) -> Result<Option<Message>, StreamClientError> {
        let waiter = {
            let mut state = self.shared().state.lock();
            if let Some(message) = state.inbox.pop() {
                return Ok(Some(message));
            }
            if state.inbox.is_ended() {
                return Ok(None);
            }
            if state.phase != ConnectionPhase::Open {
                return Err(StreamClientError::NotConnected);
            }
            state.inbox.wait()
        };

        let mut pending = PendingNext {
            shared: self.shared(),
            waiter,
            settled: false,
        };
        let delivered = (&mut pending.waiter).await.unwrap_or(None);
        pending.settled = true;
        Ok(delivered)
    }

    /// Adapts [`next`](Self::next) into a `Stream`.
    ///
    /// The stream ends at the terminal marker. An error is yielded once and
    /// also ends the stream.
    ///
    /// The stream holds its own clone of the client. Dropping it early does
    /// not close the connection while other clones exist; call
    /// [`close`](Self::close) to stop the client.
    pub fn messages(
        &self,
    ) -> impl Stream<Item = Result<Message, StreamClientError>> + Send + 'static {
        self.clone().into_stream()
    }

    /// Consumes this handle into a message `Stream`. See [`messages`](Self::messages).
    ///
    /// When this was the last clone, dropping the stream closes the client.
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = Result<Message, StreamClientError>> + Send + 'static {
        futures_util::stream::unfold(Some(self), |client| async move {
            let Some(client) = client else {
                return None;
            };
            match client.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(client))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Sends a payload and waits for the outbound buffer to drain.
    ///
    /// The payload is written immediately. Completion only means the local
    /// buffer drained, not that the peer received it. Fails with `NotOpen` as
    /// soon as the connection is seen not open, and with `Timeout` after
    /// [`StreamDefaults::SEND_TIMEOUT`]. Concurrent sends are not serialized.
    pub async fn send(&self, payload: impl Into<Message>) -> Result<(), StreamClientError> {
        let message = payload.into();
        let connection = self
            .shared()
            .live_connection()
            .ok_or(StreamClientError::NotOpen)?;
        if connection.ready_state() != ReadyState::Open {
            return Err(StreamClientError::NotOpen);
        }

        let len = message.len();
        connection.write(message);
        let submitted_at = Instant::now();

        loop {
            if connection.ready_state() != ReadyState::Open {
                debug!(event = "stream_send_not_open", len);
                return Err(StreamClientError::NotOpen);
            }
            if submitted_at.elapsed() > StreamDefaults::SEND_TIMEOUT {
                warn!(
                    event = "stream_send_timeout",
                    len,
                    pending_bytes = connection.pending_outbound_bytes()
                );
                return Err(StreamClientError::Timeout);
            }
            if connection.pending_outbound_bytes() == 0 {
                return Ok(());
            }
            tokio::time::sleep(StreamDefaults::SEND_POLL_INTERVAL).await;
        }
    }

    /// Serializes `value` as JSON and sends it as a text message.
    pub async fn send_json<V>(&self, value: &V) -> Result<(), StreamClientError>
    where
        V: Serialize + ?Sized,
    {
        let text = serde_json::to_string(value)?;
        self.send(text).await
    }

    /// Shuts the client down.
    ///
    /// Stops any further reconnects, closes the live connection, and resolves
    /// every pending [`next`](Self::next) with the terminal marker. An
    /// in-flight backoff delay is not cut short, but no connect follows it.
    /// Idempotent.
    pub fn close(&self) {
        self.shared().shutdown();
    }
}

impl<T: Transport> std::fmt::Debug for StreamClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint().url())
            .field("state", &self.state())
            .finish()
    }
}

/// Closes the shared state when the last user-facing clone goes away.
///
/// The driver task holds `Shared` directly, so it does not keep the client
/// alive on its own.
struct ClientHandle<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Drop for ClientHandle<T> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Waiter of an in-flight `next`.
///
/// If the future is dropped after a message was handed to the waiter but
/// before it was observed, the message is put back in the inbox.
struct PendingNext<'a, T: Transport> {
    shared: &'a Shared<T>,
    waiter: Waiter,
    settled: bool,
}

impl<T: Transport> Drop for PendingNext<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.waiter.close();
        if let Ok(Some(message)) = self.waiter.try_recv() {
            trace!(event = "stream_message_requeued", len = message.len());
            self.shared.state.lock().inbox.requeue_front(message);
        }
    }
}

struct Shared<T: Transport> {
    endpoint: Endpoint,
    config: StreamConfig,
    transport: T,
    events: EventBus,
    phase_tx: watch::Sender<ConnectionPhase>,
    state: Mutex<ClientState<T::Connection>>,
}

struct ClientState<C> {
    phase: ConnectionPhase,
    connection: Option<Arc<C>>,
    reconnect_attempts: u32,
    stop: bool,
    inbox: MessageBuffer,
}

impl<T: Transport> Shared<T> {
    fn set_phase(&self, state: &mut ClientState<T::Connection>, phase: ConnectionPhase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn live_connection(&self) -> Option<Arc<T::Connection>> {
        self.state.lock().connection.clone()
    }

    /// Starts the first connection cycle, unless one already ran.
    fn begin_connect(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut state = self.state.lock();
        if state.stop || state.phase != ConnectionPhase::Disconnected {
            return None;
        }
        Some(self.open_connection(&mut state))
    }

    /// Connects again after a backoff delay, unless shut down meanwhile.
    fn reopen(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut state = self.state.lock();
        if state.stop {
            debug!(event = "stream_reconnect_cancelled", endpoint = %self.endpoint);
            return None;
        }
        Some(self.open_connection(&mut state))
    }

    fn open_connection(
        &self,
        state: &mut ClientState<T::Connection>,
    ) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.transport.open(&self.endpoint, events_tx);
        state.connection = Some(Arc::new(connection));
        self.set_phase(state, ConnectionPhase::Connecting);
        debug!(
            event = "stream_connecting",
            endpoint = %self.endpoint,
            attempt = state.reconnect_attempts
        );
        events_rx
    }

    fn handle_open(&self) {
        let mut state = self.state.lock();
        if state.stop {
            return;
        }
        state.reconnect_attempts = 0;
        self.set_phase(&mut state, ConnectionPhase::Open);
        debug!(event = "stream_open", endpoint = %self.endpoint);
    }

    fn handle_message(&self, message: Message) {
        if self.state.lock().stop {
            trace!(event = "stream_message_dropped", len = message.len());
            return;
        }

        trace!(event = "stream_message", kind = ?message.kind(), len = message.len());
        self.events.dispatch(&message);
        self.state.lock().inbox.push(message);
    }

    /// Decides what follows a transport close.
    ///
    /// Returns the backoff delay before the next connect, or `None` once the
    /// client is closed for good.
    fn handle_disconnect(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        state.connection = None;

        if state.stop || !self.config.auto_reconnect {
            if state.phase != ConnectionPhase::Closed {
                state.stop = true;
                self.set_phase(&mut state, ConnectionPhase::Closed);
                let released = state.inbox.end();
                debug!(
                    event = "stream_closed",
                    endpoint = %self.endpoint,
                    reason = "transport_closed",
                    released_waiters = released
                );
            }
            return None;
        }

        state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
        let delay = self
            .config
            .backoff()
            .delay_for_attempt(state.reconnect_attempts);
        self.set_phase(&mut state, ConnectionPhase::Reconnecting);
        debug!(
            event = "stream_reconnect_scheduled",
            endpoint = %self.endpoint,
            attempt = state.reconnect_attempts,
            delay_ms = delay.as_millis() as u64
        );
        Some(delay)
    }

    fn shutdown(&self) {
        let connection = {
            let mut state = self.state.lock();
            if state.phase == ConnectionPhase::Closed {
                return;
            }
            state.stop = true;
            self.set_phase(&mut state, ConnectionPhase::Closed);
            let released = state.inbox.end();
            debug!(
                event = "stream_closed",
                endpoint = %self.endpoint,
                reason = "shutdown",
                released_waiters = released
            );
            state.connection.take()
        };

        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// Processes one connection's notifications until it closes.
    async fn pump(&self, events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Opened => self.handle_open(),
                TransportEvent::Message(message) => self.handle_message(message),
                TransportEvent::Closed => return,
            }
        }
    }
}

async fn run_connection_cycles<T: Transport>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        shared.pump(&mut events).await;

        let Some(delay) = shared.handle_disconnect() else {
            return;
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match shared.reopen() {
            Some(next) => events = next,
            None => return,
        }
    }
}
