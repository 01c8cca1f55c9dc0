//! Chat server reactor
//!
//! A single-threaded, selector-driven event loop that owns every accepted
//! connection. The loop multiplexes accept, read and write readiness over
//! one `mio::Poll`; external threads never touch connection state directly,
//! they submit broadcasts through a [`BroadcastHandle`] and wake the
//! selector.
//!
//! Every decoded `USER`, `ENTRY` and `DISCONNECT` message turns into a
//! conversation entry that is fanned out to all live clients; new joiners
//! first receive a replay of the retained conversation.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::conversation::Conversation;
use crate::error::{ChatError, ProtocolError};
use crate::protocol::{self, MsgKind, TYPE_DELIMITER};
use crate::types::ConnId;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_ID: usize = 2;
const EVENTS_CAPACITY: usize = 256;

const JOIN_MESSAGE: &str = " joined conversation.";
const LEAVE_MESSAGE: &str = " left conversation.";
const USERNAME_DELIMITER: &str = ": ";

/// Broadcast submissions shared between producer threads and the loop.
#[derive(Debug)]
struct Pending {
    queue: Mutex<VecDeque<String>>,
    time_to_broadcast: AtomicBool,
}

impl Pending {
    /// Enqueues one body and wakes the selector. The flag is stored after
    /// the push (release), so the drain that observes it sees the entry.
    fn submit(&self, body: String, waker: &Waker) {
        self.queue
            .lock()
            .expect("broadcast queue poisoned")
            .push_back(body);
        self.time_to_broadcast.store(true, Ordering::Release);
        if let Err(err) = waker.wake() {
            warn!("failed to wake the selector: {}", err);
        }
    }
}

/// Thread-safe handle for submitting broadcasts from outside the loop.
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    pending: Arc<Pending>,
    waker: Arc<Waker>,
}

impl BroadcastHandle {
    /// Sends `body` to every connected client.
    ///
    /// May be called from any thread; the message is queued and delivered
    /// on the next loop turn.
    pub fn broadcast(&self, body: &str) {
        self.pending.submit(body.to_string(), &self.waker);
    }
}

/// The broadcast chat server.
///
/// [`bind`](ChatServer::bind) claims the listening socket, then
/// [`run`](ChatServer::run) serves forever on the calling thread.
#[derive(Debug)]
pub struct ChatServer {
    listener: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    connections: HashMap<ConnId, Connection>,
    conversation: Conversation,
    pending: Arc<Pending>,
    next_id: usize,
}

impl ChatServer {
    /// Binds the listening socket on all interfaces. Port 0 lets the OS
    /// pick a free port (see [`local_addr`](ChatServer::local_addr)).
    pub fn bind(port: u16) -> Result<Self, ChatError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            listener,
            poll,
            waker,
            connections: HashMap::new(),
            conversation: Conversation::new(),
            pending: Arc::new(Pending {
                queue: Mutex::new(VecDeque::new()),
                time_to_broadcast: AtomicBool::new(false),
            }),
            next_id: FIRST_CONNECTION_ID,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A cloneable handle for broadcasting from other threads.
    pub fn handle(&self) -> BroadcastHandle {
        BroadcastHandle {
            pending: Arc::clone(&self.pending),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop on the calling thread.
    ///
    /// Per-connection failures are contained: the offending client is
    /// removed and the loop keeps serving. Only a selector-level failure
    /// returns an error.
    pub fn run(mut self) -> Result<(), ChatError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if self.pending.time_to_broadcast.swap(false, Ordering::Acquire) {
                self.drain_broadcasts();
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for event in events.iter() {
                match event.token() {
                    // Flags are re-checked at the top of every iteration;
                    // the wake-up itself carries no data.
                    WAKER => {}
                    LISTENER => self.accept_clients()?,
                    token => {
                        let id = ConnId::from_token(token);
                        if !self.connections.contains_key(&id) {
                            // Removed earlier in this event batch.
                            continue;
                        }
                        if event.is_readable() {
                            self.recv_from_client(id);
                        }
                        if event.is_writable() && self.connections.contains_key(&id) {
                            self.send_to_client(id);
                        }
                    }
                }
            }
        }
    }

    /// Accepts every pending connection. New clients start write-interested
    /// with the conversation replay already queued, so the history flushes
    /// before they idle to read interest.
    fn accept_clients(&mut self) -> Result<(), ChatError> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("could not set TCP_NODELAY for {}: {}", addr, err);
                    }
                    let id = self.next_conn_id();
                    let mut conn = Connection::new(stream, Some(addr));
                    let mut replay_complete = true;
                    for payload in self.conversation.snapshot() {
                        let frame = protocol::prepend_length_header(&payload).into_bytes();
                        replay_complete &= conn.queue_frame(frame);
                    }
                    if !replay_complete {
                        warn!("replay for client {} truncated by the outbound cap", id);
                    }
                    match conn.register(self.poll.registry(), id.token(), Interest::WRITABLE) {
                        Ok(()) => {
                            info!("client {} connected from {}", id, addr);
                            self.connections.insert(id, conn);
                        }
                        Err(err) => error!("failed to register client {}: {}", id, err),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!("transient accept error: {}", err);
                }
                Err(err) => {
                    error!("error accepting connection: {}", err);
                    return Err(err.into());
                }
            }
        }
    }

    /// Drains readable bytes from one client and dispatches every decoded
    /// payload. Protocol violations, transport errors and end of stream all
    /// remove the client without disturbing the rest.
    fn recv_from_client(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let outcome = conn.read_ready();
        let payloads = conn.drain_payloads();

        for payload in payloads {
            if let Err(err) = self.dispatch_payload(id, &payload) {
                warn!("client {} sent corrupt message: {}", id, err);
                self.remove_client(id);
                return;
            }
            if !self.connections.contains_key(&id) {
                // The client said DISCONNECT mid-batch.
                return;
            }
        }

        match outcome {
            Ok(false) => {}
            Ok(true) => {
                debug!("client {} closed the connection", id);
                self.remove_client(id);
            }
            Err(err) => {
                warn!("failed to read from client {}: {}", id, err);
                self.remove_client(id);
            }
        }
    }

    fn dispatch_payload(&mut self, id: ConnId, payload: &str) -> Result<(), ProtocolError> {
        match protocol::kind_of(payload)? {
            MsgKind::User => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return Ok(());
                };
                conn.set_username(protocol::body_of(payload).to_string());
                let joined = format!("{}{}", conn.username(), JOIN_MESSAGE);
                self.broadcast(joined);
            }
            MsgKind::Entry => {
                let Some(conn) = self.connections.get(&id) else {
                    return Ok(());
                };
                let line = format!(
                    "{}{}{}",
                    conn.username(),
                    USERNAME_DELIMITER,
                    protocol::body_of(payload)
                );
                self.broadcast(line);
            }
            MsgKind::Disconnect => {
                let Some(conn) = self.connections.get(&id) else {
                    return Ok(());
                };
                let goodbye = format!("{}{}", conn.username(), LEAVE_MESSAGE);
                self.remove_client(id);
                self.broadcast(goodbye);
            }
            kind @ MsgKind::Broadcast => {
                return Err(ProtocolError::UnexpectedKind { kind });
            }
        }
        Ok(())
    }

    /// Flushes one client's outbound queue. When it drains, the connection
    /// drops back to read interest; a partial write keeps it
    /// write-interested for the next readiness event.
    fn send_to_client(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.write_pending() {
            Ok(true) => {
                if let Err(err) =
                    conn.set_interest(self.poll.registry(), id.token(), Interest::READABLE)
                {
                    warn!("failed to update interest for client {}: {}", id, err);
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!("failed to write to client {}: {}", id, err);
                self.remove_client(id);
            }
        }
    }

    /// Queues a broadcast exactly as an external producer would; the loop
    /// picks it up at the top of its next iteration.
    fn broadcast(&self, body: String) {
        self.pending.submit(body, &self.waker);
    }

    /// Moves the submitted bodies into every live connection's outbound
    /// queue (and into the conversation history), then flips all
    /// connections to write interest so the frames flush.
    fn drain_broadcasts(&mut self) {
        let bodies: Vec<String> = {
            let mut queue = self.pending.queue.lock().expect("broadcast queue poisoned");
            queue.drain(..).collect()
        };
        if bodies.is_empty() {
            return;
        }

        let mut overflowed = Vec::new();
        for body in bodies {
            let payload = format!("{}{}{}", MsgKind::Broadcast.as_str(), TYPE_DELIMITER, body);
            let frame = protocol::prepend_length_header(&payload).into_bytes();
            self.conversation.append(payload);
            for (&id, conn) in self.connections.iter_mut() {
                if !conn.queue_frame(frame.clone()) && !overflowed.contains(&id) {
                    overflowed.push(id);
                }
            }
        }

        for id in overflowed {
            warn!("client {} is too far behind, disconnecting", id);
            self.remove_client(id);
        }

        let registry = self.poll.registry();
        for (&id, conn) in self.connections.iter_mut() {
            if let Err(err) =
                conn.set_interest(registry, id.token(), Interest::READABLE | Interest::WRITABLE)
            {
                warn!("failed to update interest for client {}: {}", id, err);
            }
        }
    }

    /// Cancels the client's registration and closes its socket. A teardown
    /// failure is logged and the loop keeps serving the rest.
    fn remove_client(&mut self, id: ConnId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(err) = conn.deregister(self.poll.registry()) {
            error!("could not deregister client {}: {}", id, err);
        }
        info!("client {} disconnected", id);
        // Dropping the connection closes the socket.
    }

    fn next_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }
}
