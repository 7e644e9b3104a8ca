//! Error types for the comms core
//!
//! This module contains the error types used throughout the comms layer:
//! transport send failures, byte-stream decoding failures, address problems,
//! and the top-level `CommsError` that unifies them.

use crate::conn_type::ConnType;
use crate::types::{ChannelNo, GameId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a transport when asked to put bytes on the wire
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not available: {conn_type}")]
    Unavailable { conn_type: ConnType },
    #[error("Peer unreachable via {conn_type}: {reason}")]
    PeerUnreachable { conn_type: ConnType, reason: String },
    #[error("Send rejected by {conn_type}: {reason}")]
    Rejected { conn_type: ConnType, reason: String },
    #[error("Address incomplete for {conn_type}")]
    IncompleteAddress { conn_type: ConnType },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

impl TransportError {
    /// The transport the failure happened on, if known
    pub fn conn_type(&self) -> Option<ConnType> {
        match self {
            TransportError::Unavailable { conn_type }
            | TransportError::PeerUnreachable { conn_type, .. }
            | TransportError::Rejected { conn_type, .. }
            | TransportError::IncompleteAddress { conn_type } => Some(*conn_type),
            TransportError::Shutdown { .. } => None,
        }
    }
}

/// Failures while reading a byte stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Variable-length integer overflows 32 bits")]
    VarintOverflow,
    #[error("String is not valid UTF-8")]
    InvalidUtf8,
    #[error("String too long for stream: {len} bytes")]
    StringTooLong { len: usize },
    #[error("Unknown value {value} for {field}")]
    UnknownValue { field: &'static str, value: u32 },
    #[error("Too many {field} for stream: {count}")]
    TooMany { field: &'static str, count: usize },
}

/// Problems with an address record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address does not include transport {conn_type}")]
    MissingType { conn_type: ConnType },
    #[error("No address known for channel {channel}")]
    NoChannel { channel: ChannelNo },
    #[error("Malformed MQTT device id: {0}")]
    BadMqttDevId(String),
    #[error("Malformed MQTT topic: {0}")]
    BadTopic(String),
}

// ----------------------------------------------------------------------------
// Top-Level Error
// ----------------------------------------------------------------------------

/// Core error type for the comms layer
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound message claims a transport its sender's address doesn't list
    #[error("Message for game {game_id} arrived on {arrived_on}, not in sender's address")]
    Misrouted { game_id: GameId, arrived_on: ConnType },

    /// Inbound envelope is for some other game
    #[error("Message for game {got} delivered to game {expected}")]
    WrongGame { expected: GameId, got: GameId },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CommsError {
    /// Create an invalid message error
    pub fn invalid_message<T: Into<String>>(message: T) -> Self {
        CommsError::InvalidMessage(message.into())
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CommsError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn unexpected_eof(needed: usize, remaining: usize) -> Self {
        CommsError::Stream(StreamError::UnexpectedEof { needed, remaining })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CommsError>;
pub type CommsResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_reports_its_type() {
        let err = TransportError::Unavailable {
            conn_type: ConnType::Bt,
        };
        assert_eq!(err.conn_type(), Some(ConnType::Bt));
        assert_eq!(
            TransportError::Shutdown {
                reason: "bye".into()
            }
            .conn_type(),
            None
        );
    }

    #[test]
    fn errors_convert_into_comms_error() {
        let err: CommsError = StreamError::VarintOverflow.into();
        assert!(matches!(err, CommsError::Stream(StreamError::VarintOverflow)));
        assert!(err.to_string().contains("32 bits"));
    }
}
