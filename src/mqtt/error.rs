//! Error types for the messaging session and its transports

use super::config::ConfigError;
use super::session::ConnectionState;
use thiserror::Error;

/// Failures of the byte-level connection to a broker.
///
/// rumqttc errors are boxed, `ConnectionError` alone is well over 100 bytes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[source] Box<rumqttc::ClientError>),

    #[error("MQTT connection error: {0}")]
    Connection(#[source] Box<rumqttc::ConnectionError>),

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("Connection attempt timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Transport is closed")]
    Closed,
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(err: rumqttc::ClientError) -> Self {
        TransportError::Client(Box::new(err))
    }
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransportError::Connection(Box::new(err))
    }
}

/// Errors surfaced synchronously to callers of the session.
///
/// Connection failures that happen in the background never show up here,
/// they are reported through the connectivity channel instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// publish/subscribe while the session has no live connection
    #[error("Not connected (session is {0})")]
    NotConnected(ConnectionState),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Pending acknowledgment released because its connection was torn down
    #[error("Connection closed before the broker acknowledged")]
    ConnectionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
