//! WebSocket transport over tokio-tungstenite
//!
//! One task per connection: the accept loop upgrades each TCP stream and
//! spawns a task that pumps frames both ways, reporting lifecycle to the
//! core through the event channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::{
    BindError, Bound, Connection, ConnectionError, EventSender, OutboundFrame, Transport,
    TransportEvent,
};

/// Default transport: WebSocket over TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn bind(
        &self,
        addr: String,
        events: EventSender,
        shutdown: broadcast::Receiver<()>,
    ) -> BoxFuture<'static, Result<Bound, BindError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| BindError::new(addr.as_str(), e))?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| BindError::new(addr.as_str(), e))?;
            info!("WebSocket transport listening on ws://{}", local_addr);

            Ok(Bound {
                local_addr,
                accept: Box::pin(accept_loop(listener, events, shutdown)),
            })
        })
    }
}

/// Accept clients until the shutdown signal fires.
///
/// Open connections are left to their own tasks; shutting the listener
/// down only stops new clients from arriving.
async fn accept_loop(
    listener: TcpListener,
    events: EventSender,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, events).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Shutdown signal received, listener closing");
                break;
            }
        }
    }
}

/// Pump one client's frames until either side closes.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, events: EventSender) {
    // No `Opened` before the handshake completes: a failed upgrade never
    // becomes a connection.
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(peer_addr, outbound_tx);
    debug!("Client {} connected from {}", connection.id(), peer_addr);

    if events.send(TransportEvent::Opened(connection.clone())).is_err() {
        // Core is gone; nothing to serve.
        return;
    }

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            report_error(&events, &connection, e);
                            break;
                        }
                    }
                    Some(OutboundFrame::Binary(data)) => {
                        if let Err(e) = ws_sender.send(Message::Binary(data)).await {
                            report_error(&events, &connection, e);
                            break;
                        }
                    }
                    // Close requested, or every handle to this connection
                    // was dropped.
                    Some(OutboundFrame::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event = TransportEvent::Message {
                            connection: connection.clone(),
                            text,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        let fatal = is_fatal(&e);
                        report_error(&events, &connection, e);
                        if fatal {
                            break;
                        }
                    }
                    None => {
                        debug!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(TransportEvent::Closed { connection });
    debug!("Connection from {} closed", peer_addr);
}

fn report_error(events: &EventSender, connection: &Connection, error: tungstenite::Error) {
    let _ = events.send(TransportEvent::Error {
        connection: connection.clone(),
        cause: ConnectionError::Protocol(Arc::new(error)),
    });
}

/// Errors that leave the stream unusable end the connection task;
/// per-message problems only get reported.
fn is_fatal(error: &tungstenite::Error) -> bool {
    !matches!(
        error,
        tungstenite::Error::Utf8
            | tungstenite::Error::Capacity(_)
            | tungstenite::Error::WriteBufferFull(_)
    )
}
