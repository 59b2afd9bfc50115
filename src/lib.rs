// lib.rs

mod connection;
mod modbus_tcp;
mod session;
mod unit;

pub use connection::{
    Connection, ConnectionConfig, ConnectionConfigBuilder, Connector, DEFAULT_PORT,
    DEFAULT_TIMEOUT, TransportError,
};
pub use modbus_tcp::{TcpConnection, TcpConnector, unwrap_tcp, wrap_tcp};
pub use session::{EventSink, PollEvent, PollingSession, SessionError, SessionState, log_sink};
pub use unit::{
    ConfigurationError, FunctionCode, ProtocolError, ReadSpec, START_ADDRESS, UNIT_ID,
    create_read_request, parse_read_response,
};

/// Why a polling run ended.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
