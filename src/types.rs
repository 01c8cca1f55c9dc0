//! Basic type definitions and transport constants
//!
//! Provides the `ConnId` newtype used to identify registered connections
//! and the tuning constants shared by server and client.

use mio::Token;

/// Default server port, used when no (or an invalid) port argument is given.
pub const DEFAULT_PORT: u16 = 8080;

/// Size of the scratch buffer for a single read syscall. Frames longer than
/// this are assembled across multiple read events.
pub const MAX_MSG_LENGTH: usize = 8192;

/// Number of conversation entries retained for replay to new joiners.
pub const HISTORY_CAPACITY: usize = 1000;

/// Per-connection cap on queued outbound bytes. A connection that falls this
/// far behind is disconnected instead of growing the queue without bound.
pub const MAX_OUTBOUND_BYTES: usize = 1024 * 1024;

/// Unique connection identifier (newtype pattern)
///
/// Wraps the selector registration token, so the id doubles as the key in
/// the reactor's registration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

impl ConnId {
    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0)
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
