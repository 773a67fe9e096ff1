//! CoEdit relay
//!
//! Relays plain-text edits between clients grouped into password-protected
//! sessions. Each session has a host that holds the document; joiners receive a
//! snapshot from the host before edits start flowing to them.
//!
//! - [`registry`]: session id -> [`session::Session`]
//! - [`session`]: participants, host election, fan-out
//! - [`sync`]: join-time snapshot handshake
//! - [`broadcast`]: edit validation and relay
//! - [`server`]: TCP accept loop and per-connection command loop

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod sync;

pub use config::RelayConfig;
pub use server::RelayServer;
