//! Per-connection state
//!
//! Holds everything the server reactor tracks for one accepted client: the
//! socket, the inbound reassembly splitter, the outbound queue of framed
//! messages with a cursor into the head for partial writes, the chosen
//! username and the currently registered interest mask.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::warn;

use crate::error::ChatError;
use crate::splitter::Splitter;
use crate::types::{MAX_MSG_LENGTH, MAX_OUTBOUND_BYTES};

/// Username assumed until the client's first `USER` message.
pub const DEFAULT_USERNAME: &str = "anonymous";

/// One registered client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    splitter: Splitter,
    /// Fully framed messages awaiting transmission. Only the head may be
    /// partially written; `head_written` is the cursor into it.
    outbound: VecDeque<Vec<u8>>,
    head_written: usize,
    queued_bytes: usize,
    username: String,
    interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer_addr,
            splitter: Splitter::new(),
            outbound: VecDeque::new(),
            head_written: 0,
            queued_bytes: 0,
            username: DEFAULT_USERNAME.to_string(),
            interest: Interest::WRITABLE,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: String) {
        self.username = username;
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Enqueues a framed message for transmission.
    ///
    /// Returns `false` when the queue would exceed the per-connection
    /// watermark; the caller should disconnect the peer instead of letting
    /// the queue grow without bound.
    pub fn queue_frame(&mut self, frame: Vec<u8>) -> bool {
        if self.queued_bytes + frame.len() > MAX_OUTBOUND_BYTES {
            return false;
        }
        self.queued_bytes += frame.len();
        self.outbound.push_back(frame);
        true
    }

    /// Writes queued frames head-first until the queue drains or the socket
    /// would block. Returns `Ok(true)` when the queue is empty.
    pub fn write_pending(&mut self) -> io::Result<bool> {
        loop {
            let Some(head) = self.outbound.front() else {
                return Ok(true);
            };
            match self.stream.write(&head[self.head_written..]) {
                Ok(0) => {
                    warn!("write to client returned zero bytes");
                    return Ok(false);
                }
                Ok(written) => {
                    self.head_written += written;
                    self.queued_bytes -= written;
                    if self.head_written == head.len() {
                        self.outbound.pop_front();
                        self.head_written = 0;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Drains readable bytes into the splitter until the socket would
    /// block. Returns `Ok(true)` on end of stream (the peer closed).
    pub fn read_ready(&mut self) -> Result<bool, ChatError> {
        let mut scratch = [0u8; MAX_MSG_LENGTH];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(received) => self.splitter.append(&scratch[..received])?,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Payloads decoded so far, in arrival order.
    pub fn drain_payloads(&mut self) -> Vec<String> {
        self.splitter.drain_payloads()
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.interest = interest;
        registry.register(&mut self.stream, token, interest)
    }

    /// Updates the interest mask, skipping the syscall when nothing changed.
    pub fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if self.interest == interest {
            return Ok(());
        }
        self.interest = interest;
        registry.reregister(&mut self.stream, token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}
