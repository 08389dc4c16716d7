//! Error types raised while handling relay events.
//!
//! Every error ends at the handler boundary: it is logged, and when the
//! triggering client can do something about it, reported back to that
//! client as a single `error` message.

use crate::registry::ConnectionId;
use shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Failure to hand a message to a single connection
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("outbound queue for connection {0} is full")]
    Full(ConnectionId),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Coarse classification used for logging and client reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    UnknownConnection,
    DuplicateConnection,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Protocol(ProtocolError::InvalidPayload { .. }) => ErrorKind::Unexpected,
            RelayError::Protocol(_) => ErrorKind::Validation,
            RelayError::Registry(RegistryError::DuplicateConnection(_)) => {
                ErrorKind::DuplicateConnection
            }
            RelayError::Registry(RegistryError::UnknownConnection(_)) => {
                ErrorKind::UnknownConnection
            }
            RelayError::Channel(_) => ErrorKind::Unexpected,
        }
    }

    /// Text of the `error` message sent back to the triggering connection.
    ///
    /// Unknown connections get nothing since there is no live client to tell,
    /// and a failed send cannot be reported over the same channel.
    pub fn client_message(&self) -> Option<String> {
        match self {
            RelayError::Protocol(err) => Some(err.to_string()),
            RelayError::Registry(err @ RegistryError::DuplicateConnection(_)) => {
                Some(err.to_string())
            }
            RelayError::Registry(RegistryError::UnknownConnection(_)) => None,
            RelayError::Channel(_) => None,
        }
    }
}
