//! Embeddable WebSocket server core
//!
//! Accepts client connections through a pluggable transport, turns
//! socket lifecycle into a typed event stream, and routes inbound
//! messages to named command handlers. The WebSocket wire protocol
//! itself is handled by the transport; the core owns connection
//! bookkeeping, event delivery, and command dispatch.

pub mod command;
pub mod config;
pub mod event;
pub mod server;
pub mod transport;

pub use command::{
    CommandHandler, CommandOutcome, CommandResolver, CommandRouter, JsonFieldResolver,
    NullResolver,
};
pub use config::{ConfigError, ServerConfig};
pub use event::{EventNotifier, ServerEvent};
pub use server::{ConnectionRegistry, ServerState, SocketServer};
pub use transport::{
    BindError, Connection, ConnectionError, ConnectionId, SendError, Transport, TransportEvent,
    WsTransport,
};
