//! Transport layer
//!
//! The server core consumes an abstract [`Transport`]: something that
//! binds a listening socket, accepts clients, and delivers already-framed
//! messages as [`TransportEvent`]s over a channel. The bundled
//! [`WsTransport`] speaks WebSocket via tokio-tungstenite.

mod connection;
mod ws;

pub use connection::{Connection, ConnectionId, OutboundFrame, SendError};
pub use ws::WsTransport;

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Failure to bind the listening socket.
///
/// Cloneable so the same cause can ride the `server_open_error` event and
/// the `start` return value.
#[derive(Debug, Clone, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    /// The address that could not be bound
    pub addr: String,
    #[source]
    pub source: Arc<std::io::Error>,
}

impl BindError {
    pub fn new(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            addr: addr.into(),
            source: Arc::new(source),
        }
    }
}

/// Error on an established connection, delivered with [`TransportEvent::Error`].
///
/// Observational: the transport keeps running, the core decides whether
/// to close the affected connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("websocket error: {0}")]
    Protocol(Arc<tokio_tungstenite::tungstenite::Error>),

    #[error("{0}")]
    Other(String),
}

/// Events a transport delivers to the server core.
///
/// For a single connection the transport must deliver `Opened` first,
/// then any number of `Message`/`Error`, then exactly one `Closed`.
/// No ordering is required between different connections.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A client completed the handshake
    Opened(Connection),
    /// A text message arrived from a client
    Message { connection: Connection, text: String },
    /// The connection reported an error
    Error {
        connection: Connection,
        cause: ConnectionError,
    },
    /// The connection is gone
    Closed { connection: Connection },
}

/// Sender half used by transport tasks to reach the core's run loop
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A successfully bound listener
pub struct Bound {
    /// The resolved local address of the listening socket
    pub local_addr: SocketAddr,
    /// The accept loop; the core drives it until shutdown
    pub accept: BoxFuture<'static, ()>,
}

/// Abstract listener and framing provider consumed by the server core.
///
/// Implementations own all socket I/O. The accept loop must stop
/// accepting when `shutdown` fires; it must not force-close connections
/// that are already open. Close requests for individual connections
/// travel through the [`Connection`] handle's outbound queue.
pub trait Transport: Send + Sync + 'static {
    /// Bind the listening socket at `addr` ("host:port").
    ///
    /// On success the returned [`Bound`] carries the accept loop to
    /// drive; on failure nothing has been spawned.
    fn bind(
        &self,
        addr: String,
        events: EventSender,
        shutdown: broadcast::Receiver<()>,
    ) -> BoxFuture<'static, Result<Bound, BindError>>;
}
