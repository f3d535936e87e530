//! Auto-reconnecting duplex message stream client.
//!
//! The crate is organized by concern:
//! - `stream`: connection lifecycle, pull-style receive, event listeners,
//!   and the flow-controlled sender.
//! - `backoff`: reconnect delay policy.

/// Reconnect backoff policy.
pub mod backoff;
/// Stream client, transports, and message types.
pub mod stream;

pub use stream::client::{ConnectionPhase, StreamClient, StreamClientError};
pub use stream::config::{Endpoint, StreamConfig};
pub use stream::message::Message;
