//! Non-blocking broadcast chat over a length-prefixed text protocol
//!
//! A chat system consisting of a broadcast server and an embeddable client,
//! both built around a single-threaded, selector-driven event loop.
//!
//! # Features
//! - Length-prefixed text framing (`<len>##<KIND>$$<body>`) reassembled
//!   across arbitrary TCP segment boundaries
//! - Per-connection outbound queues with partial-write handling and
//!   interest-mask toggling
//! - Conversation replay for new joiners
//! - Thread-safe broadcast and send APIs that wake the selector
//! - Listener callbacks dispatched off the I/O thread
//!
//! # Architecture
//! Each endpoint runs one I/O thread that owns a `mio::Poll` together with
//! all of its connection state. Other threads never touch that state: they
//! push framed messages onto a mutex-guarded queue, raise an atomic flag and
//! wake the selector. The loop re-checks the flags at the top of every
//! iteration, so a wake-up is never lost.
//!
//! # Example
//! ```ignore
//! use chat_relay::{ChatServer, ServerConnection};
//!
//! // Server side: bind and serve on a dedicated thread.
//! let server = ChatServer::bind(8080)?;
//! let announcements = server.handle();
//! std::thread::spawn(move || server.run());
//! announcements.broadcast("server is up");
//!
//! // Client side: connect and chat.
//! let mut connection = ServerConnection::new();
//! connection.add_communication_listener(my_listener);
//! connection.connect("127.0.0.1", 8080)?;
//! connection.send_username("ann")?;
//! connection.send_chat_entry("hello everyone")?;
//! connection.disconnect()?;
//! ```

pub mod client;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod splitter;
pub mod types;

// Re-export main types for convenience
pub use client::ServerConnection;
pub use connection::Connection;
pub use conversation::Conversation;
pub use error::{ChatError, ProtocolError};
pub use listener::CommunicationListener;
pub use protocol::{body_of, encode_message, kind_of, prepend_length_header, MsgKind};
pub use server::{BroadcastHandle, ChatServer};
pub use splitter::Splitter;
pub use types::{ConnId, DEFAULT_PORT, HISTORY_CAPACITY, MAX_MSG_LENGTH};
