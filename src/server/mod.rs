//! Server core module
//!
//! Owns the connection registry and drives the event and command
//! pipeline on top of a transport.

mod core;
mod registry;

pub use self::core::{ServerState, SocketServer};
pub use self::registry::ConnectionRegistry;
