//! Command dispatch
//!
//! Explicit name-to-handler map, populated at construction. Dispatch
//! surrounds each invocation with `command_run` / `command_end` events
//! and contains handler failures at the dispatch boundary.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{EventNotifier, ServerEvent};
use crate::transport::Connection;

/// Value carried by `command_end` for a finished command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The handler returned normally, possibly with no value
    Completed(Option<Value>),
    /// The handler failed or panicked; the message describes the cause
    Failed(String),
}

impl CommandOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CommandOutcome::Failed(_))
    }
}

/// Handler invoked for one named command.
///
/// Receives the originating connection and the raw message the command
/// was resolved from; returns an application-defined result.
pub type CommandHandler =
    Box<dyn Fn(&Connection, &str) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Registry of named command handlers
#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under a command name
    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Connection, &str) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    /// Whether a handler is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered under `name`, if any.
    ///
    /// Unregistered names are a silent no-op: no handler runs, no events
    /// fire. For registered names the notifier sees `command_run`, the
    /// handler runs to completion on the calling task, and `command_end`
    /// carries the outcome. A handler error or panic becomes
    /// [`CommandOutcome::Failed`]; it never propagates to the caller.
    pub fn dispatch(
        &self,
        notifier: &EventNotifier,
        connection: &Connection,
        raw: &str,
        name: &str,
    ) -> Option<CommandOutcome> {
        let handler = self.handlers.get(name)?;
        debug!("Running command '{}' for client {}", name, connection.id());

        notifier.emit(&ServerEvent::CommandRun {
            connection: connection.clone(),
            name: name.to_string(),
        });

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(connection, raw))) {
            Ok(Ok(value)) => CommandOutcome::Completed(value),
            Ok(Err(e)) => {
                warn!("Command '{}' failed: {:#}", name, e);
                CommandOutcome::Failed(format!("{:#}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("Command '{}' panicked: {}", name, message);
                CommandOutcome::Failed(message)
            }
        };

        notifier.emit(&ServerEvent::CommandEnd {
            connection: connection.clone(),
            name: name.to_string(),
            outcome: outcome.clone(),
        });

        Some(outcome)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "command handler panicked".to_string()
    }
}
