use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::unit::{ConfigurationError, FunctionCode};
use crate::PollError;

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot resolve {0}")]
    Resolve(String, #[source] io::Error),

    #[error("No address found for {0}")]
    NoAddress(String),

    #[error("Cannot connect to {0}")]
    Connect(String, #[source] io::Error),

    #[error("Connection closed by peer")]
    ClosedByPeer,

    #[error("Connection already closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where to reach the device and how long to wait for each response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    timeout: Duration,
}

pub struct ConnectionConfigBuilder {
    host: Option<String>,
    port: u16,
    timeout: Duration,
}

impl ConnectionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig, ConfigurationError> {
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host,
            _ => return Err(ConfigurationError::EmptyHost),
        };
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort(self.port));
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidTimeout);
        }
        Ok(ConnectionConfig {
            host,
            port: self.port,
            timeout: self.timeout,
        })
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            host: None,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One open transport session to a device.
pub trait Connection: Send {
    /// Issues one read request and blocks until its response or the timeout.
    fn execute(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        start_addr: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, PollError>;

    /// Releases the transport. Safe to call more than once.
    fn close(&mut self);
}

/// Opens connections for a polling session, one per run.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection + 'static;

    fn open(&self, config: &ConnectionConfig) -> Result<Self::Conn, TransportError>;
}
