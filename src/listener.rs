//! Communication listener callback surface
//!
//! The narrow interface through which [`ServerConnection`] notifies an
//! observer (typically an interactive view) about connection lifecycle and
//! incoming conversation entries.
//!
//! Callbacks are dispatched from a notifier thread, never from the I/O
//! thread, so a slow or blocking listener cannot stall communication. For
//! one connection the callbacks are serialized in event order: `connected`
//! happens before any `recvd_msg`, and `disconnected` is the last callback.
//!
//! [`ServerConnection`]: crate::client::ServerConnection

use std::net::SocketAddr;

/// Observer of one client connection.
pub trait CommunicationListener: Send {
    /// The connection to the server completed.
    fn connected(&self, addr: SocketAddr);

    /// The connection closed, orderly or not. No further callbacks follow.
    fn disconnected(&self);

    /// A conversation entry arrived from the server.
    fn recvd_msg(&self, body: String);
}
