//! The anoq runtime: the per-client protocol engine and the utility server,
//! wired to TCP transport, timers and settings loading.
//!
//! A process hosts either a [`ClientNode`] or a [`ServerNode`], each driven
//! by a single event loop that owns all protocol state: incoming messages
//! and timer expirations are interleaved on one task, so no handler ever
//! observes another handler half-way through (the engine is free of locks by
//! construction).
//!
//! The protocol state machines talk to the world through the
//! [`network::Network`] trait; production uses [`network::TcpMessenger`],
//! tests substitute an in-memory network and drive whole queries
//! deterministically.

pub mod client;
pub mod network;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod testutils;
pub mod timers;

pub use self::{
    client::{run_client, ClientNode},
    server::{run_server, ServerCommand, ServerNode},
    settings::{Settings, SettingsError},
};
