//! Server configuration
//!
//! Runtime options for the server core, loadable from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 8080;
/// Bind address used when none is configured
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime options for the server core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Close a connection after the transport reports an error on it
    pub close_connection_on_error: bool,
    /// Route inbound messages to registered command handlers
    pub run_client_commands: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            close_connection_on_error: true,
            run_client_commands: true,
        }
    }
}

impl ServerConfig {
    /// Create a configuration for the given bind address and port
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Set whether transport errors close the affected connection
    pub fn with_close_on_error(mut self, close: bool) -> Self {
        self.close_connection_on_error = close;
        self
    }

    /// Set whether inbound messages are routed to command handlers
    pub fn with_client_commands(mut self, run: bool) -> Self {
        self.run_client_commands = run;
        self
    }

    /// Socket address string to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
