//! Command name resolution
//!
//! Maps a raw inbound message to an optional command name. The default
//! resolver never yields one; applications supply their own parsing.

use serde_json::Value;

use crate::transport::Connection;

/// Extracts a command name from an inbound message.
///
/// Must be side-effect free and total: malformed input resolves to
/// `None`, never an error. Called for every inbound message when command
/// dispatch is enabled.
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, connection: &Connection, raw: &str) -> Option<String>;
}

/// Default resolver: no message carries a command
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl CommandResolver for NullResolver {
    fn resolve(&self, _connection: &Connection, _raw: &str) -> Option<String> {
        None
    }
}

/// Resolves the command from a string field of a JSON message,
/// e.g. `{"action": "chat", ...}` with the default field name.
#[derive(Debug, Clone)]
pub struct JsonFieldResolver {
    field: String,
}

impl JsonFieldResolver {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// The JSON field holding the command name
    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Default for JsonFieldResolver {
    fn default() -> Self {
        Self::new("action")
    }
}

impl CommandResolver for JsonFieldResolver {
    fn resolve(&self, _connection: &Connection, raw: &str) -> Option<String> {
        let value: Value = serde_json::from_str(raw).ok()?;
        value.get(self.field.as_str())?.as_str().map(str::to_owned)
    }
}
