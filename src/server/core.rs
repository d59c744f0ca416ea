//! Server core
//!
//! Single entry and exit point for the server lifecycle. Bridges
//! transport events to the notifier, the registry, and the command
//! dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::command::{CommandResolver, CommandRouter, NullResolver};
use crate::config::ServerConfig;
use crate::event::{EventNotifier, ServerEvent};
use crate::server::ConnectionRegistry;
use crate::transport::{
    BindError, Connection, ConnectionError, Transport, TransportEvent, WsTransport,
};

/// Lifecycle states of the server itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not yet bound
    Idle,
    /// Accepting connections
    Listening,
    /// Stop was requested or the run loop returned
    Stopped,
}

/// WebSocket server core
///
/// Owns the connection registry, wires transport callbacks to the event
/// notifier, and routes inbound messages to registered commands. Built
/// once, started once; `stop` is callable from any task.
pub struct SocketServer {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<EventNotifier>,
    registry: Arc<ConnectionRegistry>,
    resolver: Box<dyn CommandResolver>,
    commands: CommandRouter,
    shutdown_tx: broadcast::Sender<()>,
    state: RwLock<ServerState>,
    stop_requested: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl SocketServer {
    /// Create a server with the default transport and no command parsing
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            transport: Arc::new(WsTransport),
            notifier: Arc::new(EventNotifier::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            resolver: Box::new(NullResolver),
            commands: CommandRouter::new(),
            shutdown_tx,
            state: RwLock::new(ServerState::Idle),
            stop_requested: AtomicBool::new(false),
            local_addr: RwLock::new(None),
        }
    }

    /// Replace the transport implementation
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Replace the command resolver
    pub fn with_resolver<R: CommandResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Install the command handler set
    pub fn with_commands(mut self, commands: CommandRouter) -> Self {
        self.commands = commands;
        self
    }

    /// Dispatch point external listeners subscribe to
    pub fn notifier(&self) -> Arc<EventNotifier> {
        Arc::clone(&self.notifier)
    }

    /// The set of currently open connections
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Effective configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the transport and run until [`stop`](Self::stop) is called.
    ///
    /// Occupies the calling task for the whole server lifetime. A bind
    /// failure is reported through `server_open_error` and the return
    /// value; the run loop is never entered in that case.
    pub async fn start(&self) -> Result<(), BindError> {
        let addr = self.config.socket_addr();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let bound = match self
            .transport
            .bind(addr, event_tx, self.shutdown_tx.subscribe())
            .await
        {
            Ok(bound) => bound,
            Err(e) => {
                warn!("Failed to open server: {}", e);
                self.notifier
                    .emit(&ServerEvent::ServerOpenError { cause: e.clone() });
                return Err(e);
            }
        };

        *self
            .local_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(bound.local_addr);
        self.set_state(ServerState::Listening);
        info!("Server listening on {}", bound.local_addr);

        self.notifier.emit(&ServerEvent::ServerOpened);
        self.registry.clear();

        let accept_task = tokio::spawn(bound.accept);

        if self.stop_requested.load(Ordering::SeqCst) {
            // A stop raced ahead of the bind; its shutdown signal may
            // predate the transport's subscription, so don't wait on it.
            accept_task.abort();
        } else {
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => self.handle_transport_event(event),
                            // The transport dropped every sender; nothing
                            // more can arrive.
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        let _ = accept_task.await;
        self.set_state(ServerState::Stopped);
        info!("Server run loop finished");
        Ok(())
    }

    /// Shut the listener down and emit `server_closed`.
    ///
    /// Safe to call from any task, including while `start` is blocked in
    /// its run loop, and never deadlocks against a pending accept.
    /// Emits `server_closed` exactly once; open connections are left
    /// alone.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stop requested, shutting listener down");
        let _ = self.shutdown_tx.send(());
        self.set_state(ServerState::Stopped);
        self.notifier.emit(&ServerEvent::ServerClosed);
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(connection) => self.on_open(connection),
            TransportEvent::Message { connection, text } => self.on_message(connection, text),
            TransportEvent::Error { connection, cause } => self.on_error(connection, cause),
            TransportEvent::Closed { connection } => self.on_close(connection),
        }
    }

    /// Notify-then-register: listeners observing `client_connected` must
    /// not assume the connection is registry-visible yet.
    fn on_open(&self, connection: Connection) {
        debug!(
            "Client {} connected from {}",
            connection.id(),
            connection.peer_addr()
        );
        self.notifier.emit(&ServerEvent::ClientConnected {
            connection: connection.clone(),
        });
        self.registry.add(connection);
    }

    fn on_close(&self, connection: Connection) {
        debug!("Client {} disconnected", connection.id());
        self.notifier.emit(&ServerEvent::ClientDisconnected {
            connection: connection.clone(),
        });
        self.registry.remove(connection.id());
    }

    fn on_error(&self, connection: Connection, cause: ConnectionError) {
        warn!("Client {} error: {}", connection.id(), cause);
        self.notifier.emit(&ServerEvent::ClientError {
            connection: connection.clone(),
            cause,
        });
        if self.config.close_connection_on_error {
            connection.close();
        }
    }

    fn on_message(&self, connection: Connection, text: String) {
        self.notifier.emit(&ServerEvent::ClientMessage {
            connection: connection.clone(),
            text: text.clone(),
        });

        if !self.config.run_client_commands {
            return;
        }
        if let Some(name) = self.resolver.resolve(&connection, &text) {
            self.commands
                .dispatch(&self.notifier, &connection, &text, &name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use serde_json::json;
    use tokio::task::JoinHandle;

    use crate::command::{CommandOutcome, JsonFieldResolver};
    use crate::transport::{Bound, EventSender, OutboundFrame};

    /// Transport double: hands the event sender to the test, which then
    /// plays the role of the accept loop and connection tasks.
    struct ScriptedTransport {
        events: Arc<Mutex<Option<EventSender>>>,
    }

    impl Transport for ScriptedTransport {
        fn bind(
            &self,
            _addr: String,
            events: EventSender,
            shutdown: broadcast::Receiver<()>,
        ) -> BoxFuture<'static, Result<Bound, BindError>> {
            let slot = Arc::clone(&self.events);
            Box::pin(async move {
                *slot.lock().unwrap() = Some(events);
                let mut shutdown = shutdown;
                Ok(Bound {
                    local_addr: "127.0.0.1:0".parse().unwrap(),
                    accept: Box::pin(async move {
                        let _ = shutdown.recv().await;
                    }),
                })
            })
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn bind(
            &self,
            addr: String,
            _events: EventSender,
            _shutdown: broadcast::Receiver<()>,
        ) -> BoxFuture<'static, Result<Bound, BindError>> {
            Box::pin(async move {
                Err(BindError::new(
                    addr,
                    std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
                ))
            })
        }
    }

    struct Harness {
        server: Arc<SocketServer>,
        events: EventSender,
        seen: Arc<Mutex<Vec<ServerEvent>>>,
        handle: JoinHandle<Result<(), BindError>>,
    }

    impl Harness {
        fn kinds(&self) -> Vec<&'static str> {
            self.seen.lock().unwrap().iter().map(|e| e.kind()).collect()
        }

        fn count(&self, kind: &str) -> usize {
            self.kinds().into_iter().filter(|k| *k == kind).count()
        }
    }

    async fn launch(server: SocketServer) -> Harness {
        let slot: Arc<Mutex<Option<EventSender>>> = Arc::default();
        let server = Arc::new(server.with_transport(ScriptedTransport {
            events: Arc::clone(&slot),
        }));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            server
                .notifier()
                .subscribe(move |event| seen.lock().unwrap().push(event.clone()));
        }

        let handle = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });

        let events = loop {
            if let Some(events) = slot.lock().unwrap().take() {
                break events;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };

        Harness {
            server,
            events,
            seen,
            handle,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition was not reached in time");
    }

    fn test_connection() -> (Connection, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new("127.0.0.1:9000".parse().unwrap(), tx);
        (connection, rx)
    }

    #[tokio::test]
    async fn test_start_emits_server_opened_and_listens() {
        let harness = launch(SocketServer::new(ServerConfig::default())).await;
        wait_until(|| harness.count("server_opened") == 1).await;
        assert_eq!(harness.server.state(), ServerState::Listening);
        assert!(harness.server.local_addr().is_some());

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
        assert_eq!(harness.server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_notifies_before_registering() {
        let harness = launch(SocketServer::new(ServerConfig::default())).await;

        let registry = harness.server.registry();
        let visible_at_event = Arc::new(Mutex::new(None));
        {
            let registry = Arc::clone(&registry);
            let visible_at_event = Arc::clone(&visible_at_event);
            harness.server.notifier().subscribe(move |event| {
                if let ServerEvent::ClientConnected { connection } = event {
                    *visible_at_event.lock().unwrap() = Some(registry.contains(connection.id()));
                }
            });
        }

        let (connection, _rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();

        wait_until(|| registry.contains(connection.id())).await;
        assert_eq!(*visible_at_event.lock().unwrap(), Some(false));

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_deregisters_and_is_idempotent() {
        let harness = launch(SocketServer::new(ServerConfig::default())).await;
        let registry = harness.server.registry();

        let (connection, _rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        wait_until(|| registry.contains(connection.id())).await;

        harness
            .events
            .send(TransportEvent::Closed {
                connection: connection.clone(),
            })
            .unwrap();
        wait_until(|| !registry.contains(connection.id())).await;

        // A second close for the same connection must not disturb anything.
        harness
            .events
            .send(TransportEvent::Closed {
                connection: connection.clone(),
            })
            .unwrap();
        wait_until(|| harness.count("client_disconnected") == 2).await;
        assert!(registry.is_empty());

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_error_closes_connection_by_default() {
        let harness = launch(SocketServer::new(ServerConfig::default())).await;
        let registry = harness.server.registry();

        let (connection, mut rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        wait_until(|| registry.contains(connection.id())).await;

        harness
            .events
            .send(TransportEvent::Error {
                connection: connection.clone(),
                cause: ConnectionError::Other("stream reset".to_string()),
            })
            .unwrap();

        // The core asks the transport to close the connection...
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(OutboundFrame::Close));

        // ...and deregistration happens through the normal close path.
        harness
            .events
            .send(TransportEvent::Closed {
                connection: connection.clone(),
            })
            .unwrap();
        wait_until(|| !registry.contains(connection.id())).await;
        assert_eq!(harness.count("client_error"), 1);
        assert_eq!(harness.count("client_disconnected"), 1);

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_error_keeps_connection_when_configured() {
        let config = ServerConfig::default().with_close_on_error(false);
        let harness = launch(SocketServer::new(config)).await;
        let registry = harness.server.registry();

        let (connection, mut rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        harness
            .events
            .send(TransportEvent::Error {
                connection: connection.clone(),
                cause: ConnectionError::Other("stream reset".to_string()),
            })
            .unwrap();

        wait_until(|| harness.count("client_error") == 1).await;
        assert!(registry.contains(connection.id()));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resolved_command_runs_with_notifications() {
        let commands = CommandRouter::new()
            .with_command("chat", |_connection, _raw| Ok(Some(json!("ok"))));
        let server = SocketServer::new(ServerConfig::default())
            .with_resolver(JsonFieldResolver::default())
            .with_commands(commands);
        let harness = launch(server).await;

        let (connection, _rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        harness
            .events
            .send(TransportEvent::Message {
                connection: connection.clone(),
                text: r#"{"action":"chat"}"#.to_string(),
            })
            .unwrap();

        wait_until(|| harness.count("command_end") == 1).await;
        assert_eq!(
            harness.kinds(),
            vec![
                "server_opened",
                "client_connected",
                "client_message",
                "command_run",
                "command_end"
            ]
        );

        let seen = harness.seen.lock().unwrap();
        match seen.last().unwrap() {
            ServerEvent::CommandEnd { name, outcome, .. } => {
                assert_eq!(name, "chat");
                assert_eq!(outcome, &CommandOutcome::Completed(Some(json!("ok"))));
            }
            other => panic!("expected command_end, got {}", other.kind()),
        }
        drop(seen);

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_command_is_message_only() {
        let server =
            SocketServer::new(ServerConfig::default()).with_resolver(JsonFieldResolver::default());
        let harness = launch(server).await;

        let (connection, _rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        harness
            .events
            .send(TransportEvent::Message {
                connection: connection.clone(),
                text: r#"{"action":"ping"}"#.to_string(),
            })
            .unwrap();

        wait_until(|| harness.count("client_message") == 1).await;
        assert_eq!(harness.count("command_run"), 0);
        assert_eq!(harness.count("command_end"), 0);

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commands_disabled_by_configuration() {
        let invoked = Arc::new(AtomicBool::new(false));
        let commands = {
            let invoked = Arc::clone(&invoked);
            CommandRouter::new().with_command("chat", move |_connection, _raw| {
                invoked.store(true, Ordering::SeqCst);
                Ok(None)
            })
        };
        let config = ServerConfig::default().with_client_commands(false);
        let server = SocketServer::new(config)
            .with_resolver(JsonFieldResolver::default())
            .with_commands(commands);
        let harness = launch(server).await;

        let (connection, _rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        harness
            .events
            .send(TransportEvent::Message {
                connection: connection.clone(),
                text: r#"{"action":"chat"}"#.to_string(),
            })
            .unwrap();

        wait_until(|| harness.count("client_message") == 1).await;
        assert_eq!(harness.count("command_run"), 0);
        assert!(!invoked.load(Ordering::SeqCst));

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_the_run_loop() {
        let commands = CommandRouter::new()
            .with_command("boom", |_connection, _raw| panic!("handler exploded"))
            .with_command("echo", |connection, raw| {
                connection.send_text(raw)?;
                Ok(None)
            });
        let server = SocketServer::new(ServerConfig::default())
            .with_resolver(JsonFieldResolver::default())
            .with_commands(commands);
        let harness = launch(server).await;

        let (connection, mut rx) = test_connection();
        harness
            .events
            .send(TransportEvent::Opened(connection.clone()))
            .unwrap();
        harness
            .events
            .send(TransportEvent::Message {
                connection: connection.clone(),
                text: r#"{"action":"boom"}"#.to_string(),
            })
            .unwrap();
        harness
            .events
            .send(TransportEvent::Message {
                connection: connection.clone(),
                text: r#"{"action":"echo"}"#.to_string(),
            })
            .unwrap();

        wait_until(|| harness.count("command_end") == 2).await;

        let seen = harness.seen.lock().unwrap();
        let outcomes: Vec<_> = seen
            .iter()
            .filter_map(|event| match event {
                ServerEvent::CommandEnd { outcome, .. } => Some(outcome.clone()),
                _ => None,
            })
            .collect();
        assert!(outcomes[0].is_failed());
        assert!(!outcomes[1].is_failed());
        drop(seen);

        // The second handler ran and replied.
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Text(r#"{"action":"echo"}"#.to_string())
        );

        harness.server.stop();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_emits_server_closed_once_and_keeps_connections() {
        let mut harness = launch(SocketServer::new(ServerConfig::default())).await;
        let registry = harness.server.registry();

        let mut queues = Vec::new();
        for _ in 0..3 {
            let (connection, rx) = test_connection();
            queues.push(rx);
            harness
                .events
                .send(TransportEvent::Opened(connection))
                .unwrap();
        }
        wait_until(|| registry.len() == 3).await;

        harness.server.stop();
        harness.server.stop();
        (&mut harness.handle).await.unwrap().unwrap();

        assert_eq!(harness.count("server_closed"), 1);
        assert_eq!(registry.len(), 3);
        for mut rx in queues {
            assert!(matches!(
                rx.try_recv(),
                Err(mpsc::error::TryRecvError::Empty)
            ));
        }
    }

    #[tokio::test]
    async fn test_bind_failure_reports_and_returns() {
        let server =
            SocketServer::new(ServerConfig::default()).with_transport(FailingTransport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            server
                .notifier()
                .subscribe(move |event| seen.lock().unwrap().push(event.clone()));
        }

        let result = server.start().await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("address in use"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), "server_open_error");
        assert_eq!(server.state(), ServerState::Idle);
        assert!(server.registry().is_empty());
        assert!(server.local_addr().is_none());
    }
}
