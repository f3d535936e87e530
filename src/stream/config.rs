//! Endpoint addressing and client configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::stream::client::StreamClientError;

/// Default reconnect bounds and fixed timing of the flow-controlled sender.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Default delay before the first reconnect attempt.
    pub const INITIAL_BACKOFF_MS: u64 = 1_000;
    /// Default ceiling for the reconnect delay.
    pub const MAX_BACKOFF_MS: u64 = 30_000;
    /// Interval between outbound buffer drain checks in `send`.
    pub const SEND_POLL_INTERVAL: Duration = Duration::from_millis(20);
    /// Deadline for the outbound buffer to drain after a `send`.
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Address of a stream endpoint: a `ws://` or `wss://` origin plus a path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    origin: String,
    path: String,
}

impl Endpoint {
    /// Creates an endpoint from a websocket origin and a path.
    ///
    /// Trailing whitespace and a trailing `/` on the origin are dropped. A path
    /// without a leading `/` gets one.
    pub fn new(
        origin: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self, StreamClientError> {
        let origin = origin.into();
        let origin = origin.trim_end().trim_end_matches('/').to_string();
        if !(origin.starts_with("ws://") || origin.starts_with("wss://")) {
            return Err(StreamClientError::InvalidEndpoint(format!(
                "origin must use ws:// or wss://, got {origin:?}"
            )));
        }
        if origin.split_once("://").is_some_and(|(_, host)| host.is_empty()) {
            return Err(StreamClientError::InvalidEndpoint(
                "origin is missing a host".to_string(),
            ));
        }

        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Ok(Self { origin, path })
    }

    /// Creates an endpoint from an `http://` or `https://` page origin.
    ///
    /// The scheme is mapped to `ws://` or `wss://` respectively; websocket
    /// origins are accepted unchanged.
    pub fn from_http_origin(
        origin: impl AsRef<str>,
        path: impl Into<String>,
    ) -> Result<Self, StreamClientError> {
        let origin = origin.as_ref();
        let mapped = if let Some(rest) = origin.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = origin.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            origin.to_string()
        };
        Self::new(mapped, path)
    }

    /// Websocket origin, e.g. `wss://example.com`.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Request path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full connection URL.
    pub fn url(&self) -> String {
        format!("{}{}", self.origin, self.path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.origin, self.path)
    }
}

/// Reconnect behavior of a [`StreamClient`](crate::stream::client::StreamClient).
///
/// Deserializing a partial document fills only the absent fields with
/// defaults.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Reconnect automatically after the transport closes (default: true).
    pub auto_reconnect: bool,
    /// Delay before the first reconnect attempt (default: 1000).
    pub initial_backoff_ms: u64,
    /// Ceiling for the reconnect delay (default: 30000).
    pub max_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            initial_backoff_ms: StreamDefaults::INITIAL_BACKOFF_MS,
            max_backoff_ms: StreamDefaults::MAX_BACKOFF_MS,
        }
    }
}

impl StreamConfig {
    /// Enables or disables automatic reconnects.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the delay before the first reconnect attempt.
    pub fn with_initial_backoff_ms(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    /// Sets the reconnect delay ceiling.
    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Backoff policy derived from this configuration.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(self.initial_backoff_ms, self.max_backoff_ms)
    }
}
