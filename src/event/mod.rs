//! Lifecycle and command events
//!
//! Typed publish/subscribe for everything the server core observes.
//! Listeners run synchronously, in subscription order, on the task that
//! triggered the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};

use tracing::error;

use crate::command::CommandOutcome;
use crate::transport::{BindError, Connection, ConnectionError};

/// Everything the server core reports to subscribers.
///
/// Events are immutable once constructed and delivered by reference;
/// listeners that need to keep data clone it out.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listening socket was bound
    ServerOpened,
    /// `stop()` was called
    ServerClosed,
    /// Binding the listening socket failed
    ServerOpenError { cause: BindError },
    /// A client completed the handshake
    ClientConnected { connection: Connection },
    /// A client's channel closed
    ClientDisconnected { connection: Connection },
    /// The transport reported an error on a connection
    ClientError {
        connection: Connection,
        cause: ConnectionError,
    },
    /// A text message arrived from a client
    ClientMessage { connection: Connection, text: String },
    /// A command handler is about to run
    CommandRun { connection: Connection, name: String },
    /// A command handler finished
    CommandEnd {
        connection: Connection,
        name: String,
        outcome: CommandOutcome,
    },
}

impl ServerEvent {
    /// Stable name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ServerOpened => "server_opened",
            ServerEvent::ServerClosed => "server_closed",
            ServerEvent::ServerOpenError { .. } => "server_open_error",
            ServerEvent::ClientConnected { .. } => "client_connected",
            ServerEvent::ClientDisconnected { .. } => "client_disconnected",
            ServerEvent::ClientError { .. } => "client_error",
            ServerEvent::ClientMessage { .. } => "client_message",
            ServerEvent::CommandRun { .. } => "command_run",
            ServerEvent::CommandEnd { .. } => "command_end",
        }
    }
}

type Listener = Box<dyn Fn(&ServerEvent) + Send + Sync>;

/// Synchronous dispatch point for [`ServerEvent`]s.
///
/// Listeners are invoked in subscription order on whatever task emitted
/// the event. A listener that panics is contained and logged; the
/// remaining listeners still run.
#[derive(Default)]
pub struct EventNotifier {
    listeners: RwLock<Vec<Listener>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for all events
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every listener
    pub fn emit(&self, event: &ServerEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("Event listener panicked while handling {}", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_without_listeners() {
        let notifier = EventNotifier::new();
        notifier.emit(&ServerEvent::ServerOpened);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let notifier = EventNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            notifier.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        notifier.emit(&ServerEvent::ServerOpened);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listener_sees_event_kind() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            notifier.subscribe(move |event| seen.lock().unwrap().push(event.kind()));
        }

        notifier.emit(&ServerEvent::ServerOpened);
        notifier.emit(&ServerEvent::ServerClosed);
        assert_eq!(*seen.lock().unwrap(), vec!["server_opened", "server_closed"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let notifier = EventNotifier::new();
        let reached = Arc::new(Mutex::new(false));

        notifier.subscribe(|_| panic!("listener blew up"));
        {
            let reached = Arc::clone(&reached);
            notifier.subscribe(move |_| *reached.lock().unwrap() = true);
        }

        notifier.emit(&ServerEvent::ServerOpened);
        assert!(*reached.lock().unwrap());
    }
}
