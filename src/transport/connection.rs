//! Client connection handles
//!
//! A [`Connection`] is the core's non-owning view of one client channel.
//! The transport task owns the socket; the handle carries a stable id and
//! an outbound queue draining into that task.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable identifier for one client connection
///
/// Generated when the transport hands the connection to the core. All
/// registry bookkeeping is keyed by this id, never by handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames queued from the core or application to the transport task
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A text frame
    Text(String),
    /// A binary frame
    Binary(Vec<u8>),
    /// Request to close the connection
    Close,
}

/// Error returned when queueing a frame to a connection that is gone
#[derive(Debug, Error)]
#[error("connection {0} is closed")]
pub struct SendError(pub ConnectionId);

/// Handle to one client's bidirectional channel
///
/// Cheap to clone; equality is by connection id. Sending only queues the
/// frame, delivery is up to the transport task that owns the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl Connection {
    /// Create a handle for a newly accepted client.
    ///
    /// Called by transport implementations once the handshake succeeded;
    /// `outbound` is the queue their connection task drains.
    pub fn new(peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            id: ConnectionId::generate(),
            peer_addr,
            outbound,
        }
    }

    /// Stable id of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.outbound
            .send(OutboundFrame::Text(text.into()))
            .map_err(|_| SendError(self.id))
    }

    /// Queue a binary frame to the client
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.outbound
            .send(OutboundFrame::Binary(data))
            .map_err(|_| SendError(self.id))
    }

    /// Request closure of the connection.
    ///
    /// The transport closes the socket and reports the close back to the
    /// core, so deregistration happens through the normal path. Calling
    /// this on an already-closed connection is a no-op.
    pub fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
