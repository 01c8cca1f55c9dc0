//! Error types for the chat system
//!
//! Defines the protocol-level and transport-level error taxonomy.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::protocol::MsgKind;

/// Violations of the length-prefixed text protocol
///
/// Any of these closes the offending connection; the event loop itself
/// keeps running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The text before the `##` delimiter is not a non-negative decimal number
    #[error("invalid length header {header:?}")]
    InvalidLengthHeader { header: String },

    /// The length header claims more than the safety cap allows
    #[error("declared payload length {length} exceeds the {max} byte cap")]
    PayloadTooLarge { length: usize, max: usize },

    /// Payload bytes are not valid UTF-8
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// The kind token maps to no known message kind
    #[error("unknown message kind {kind:?}")]
    UnknownKind { kind: String },

    /// A known kind arrived in the wrong direction
    /// (e.g. `BROADCAST` sent to the server)
    #[error("unexpected {kind} message")]
    UnexpectedKind { kind: MsgKind },
}

/// Top-level error for server and client operations
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed or misdirected traffic on a connection
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure: read/write error, lost connection, peer reset
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A send or disconnect was attempted before `connect`
    #[error("not connected")]
    NotConnected,

    /// `connect` was called on an already started connection
    #[error("connection already started")]
    AlreadyStarted,
}
