//! Realtime stream modules.
//!
//! - `client`: connection state machine, pull protocol, and sender.
//! - `config`: endpoint addressing and reconnect settings.
//! - `events`: push-style listeners for inbound messages.
//! - `transport`: the seam between the client and a socket implementation.
//! - `websocket`: the default websocket transport.

mod buffer;

/// Stream client facade and connection state machine.
pub mod client;
/// Endpoint and reconnect configuration.
pub mod config;
/// Message event listeners.
pub mod events;
/// Message payload and readiness types.
pub mod message;
/// Transport abstraction.
pub mod transport;
/// Websocket transport.
pub mod websocket;
