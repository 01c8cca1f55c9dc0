//! Client connection to the chat server
//!
//! [`ServerConnection`] mirrors the server side: one selector-driven I/O
//! thread owns the socket, completes the non-blocking connect, decodes
//! `BROADCAST` frames through a splitter and drains an outbound queue with
//! partial-write handling. The send methods are thread-safe: they frame
//! the message, push it onto a mutex-guarded queue, raise the
//! `time_to_send` flag and wake the selector.
//!
//! Listener callbacks run on a dedicated notifier thread in payload
//! arrival order, never on the I/O thread.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::error::{ChatError, ProtocolError};
use crate::listener::CommunicationListener;
use crate::protocol::{self, MsgKind};
use crate::splitter::Splitter;
use crate::types::MAX_MSG_LENGTH;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);
const EVENTS_CAPACITY: usize = 64;

const FATAL_COMMUNICATION_MSG: &str = "lost connection to the server";
const FATAL_DISCONNECT_MSG: &str = "could not disconnect cleanly, leaving ungracefully";

/// Connection lifecycle, owned by the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// State shared between the public handle and the I/O thread.
#[derive(Debug)]
struct SharedState {
    /// Framed messages awaiting transmission, fed by any producer thread.
    outbound: Mutex<VecDeque<Vec<u8>>>,
    /// Raised after every enqueue; the loop flips to write interest.
    time_to_send: AtomicBool,
    /// Cleared by `disconnect`; the loop exits once the queue drains.
    connected: AtomicBool,
}

/// Events forwarded to the notifier thread for listener dispatch.
enum ListenerEvent {
    Connected(SocketAddr),
    MsgReceived(String),
    Disconnected,
}

type Listeners = Arc<Mutex<Vec<Box<dyn CommunicationListener>>>>;

/// Manages all communication with the server; all operations are
/// non-blocking.
///
/// The connection starts in an idle state; [`connect`] spawns the I/O
/// thread. Registered [`CommunicationListener`]s are notified of
/// connection, disconnection and every received conversation entry.
///
/// [`connect`]: ServerConnection::connect
pub struct ServerConnection {
    shared: Arc<SharedState>,
    listeners: Listeners,
    waker: Option<Arc<Waker>>,
    io_thread: Option<JoinHandle<()>>,
    notifier_thread: Option<JoinHandle<()>>,
}

impl ServerConnection {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedState {
                outbound: Mutex::new(VecDeque::new()),
                time_to_send: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            waker: None,
            io_thread: None,
            notifier_thread: None,
        }
    }

    /// The listener will be notified when connecting, disconnecting and
    /// receiving a message.
    pub fn add_communication_listener<L>(&self, listener: L)
    where
        L: CommunicationListener + 'static,
    {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(Box::new(listener));
    }

    /// Starts the communicating thread and connects to the server.
    ///
    /// Returns as soon as the non-blocking connect is initiated; listeners
    /// receive `connected` when it completes.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ChatError> {
        if self.io_thread.is_some() {
            return Err(ChatError::AlreadyStarted);
        }

        let server_addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved"))?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let mut stream = TcpStream::connect(server_addr)?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {}", err);
        }
        poll.registry()
            .register(&mut stream, SOCKET, Interest::WRITABLE)?;

        self.shared.connected.store(true, Ordering::Release);
        self.waker = Some(Arc::clone(&waker));

        let (notify_tx, notify_rx) = mpsc::channel();
        let listeners = Arc::clone(&self.listeners);
        self.notifier_thread = Some(thread::spawn(move || notifier_loop(notify_rx, listeners)));

        let driver = ConnectionDriver {
            poll,
            stream,
            shared: Arc::clone(&self.shared),
            notify: notify_tx,
            splitter: Splitter::new(),
            head_written: 0,
            state: ConnectionState::Connecting,
            server_addr,
        };
        self.io_thread = Some(thread::spawn(move || driver.run()));
        Ok(())
    }

    /// Sends the user's username to the server. The server prepends it to
    /// every entry originating from this client.
    pub fn send_username(&self, username: &str) -> Result<(), ChatError> {
        self.send_msg(MsgKind::User, Some(username))
    }

    /// Sends a chat entry; the server broadcasts it to all clients,
    /// including this one.
    pub fn send_chat_entry(&self, entry: &str) -> Result<(), ChatError> {
        self.send_msg(MsgKind::Entry, Some(entry))
    }

    /// Requests an orderly disconnect: a `DISCONNECT` message is queued so
    /// the server is informed, the loop drains the outbound queue, then the
    /// socket closes and listeners receive `disconnected`.
    pub fn disconnect(&self) -> Result<(), ChatError> {
        self.shared.connected.store(false, Ordering::Release);
        self.send_msg(MsgKind::Disconnect, None)
    }

    fn send_msg(&self, kind: MsgKind, body: Option<&str>) -> Result<(), ChatError> {
        let Some(waker) = &self.waker else {
            return Err(ChatError::NotConnected);
        };
        let frame = protocol::encode_message(kind, body).into_bytes();
        self.shared
            .outbound
            .lock()
            .expect("outbound queue poisoned")
            .push_back(frame);
        self.shared.time_to_send.store(true, Ordering::Release);
        waker.wake()?;
        Ok(())
    }
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if self.io_thread.is_some() && self.shared.connected.load(Ordering::Acquire) {
            let _ = self.disconnect();
        }
        if let Some(io_thread) = self.io_thread.take() {
            let _ = io_thread.join();
        }
        if let Some(notifier) = self.notifier_thread.take() {
            let _ = notifier.join();
        }
    }
}

/// The I/O thread: completes the connect, then pumps reads and writes
/// until disconnected.
struct ConnectionDriver {
    poll: Poll,
    stream: TcpStream,
    shared: Arc<SharedState>,
    notify: Sender<ListenerEvent>,
    splitter: Splitter,
    /// Cursor into the head of the outbound queue for partial writes.
    head_written: usize,
    state: ConnectionState,
    server_addr: SocketAddr,
}

impl ConnectionDriver {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut alive = true;

        while alive {
            if self.state == ConnectionState::Connected
                && self.shared.time_to_send.swap(false, Ordering::Acquire)
            {
                self.set_interest(Interest::READABLE | Interest::WRITABLE);
            }

            if !self.shared.connected.load(Ordering::Acquire) {
                if self.outbound_is_empty() {
                    break;
                }
                // Keep pumping until the goodbye flushes. A still-pending
                // connect completes first and transitions us here later.
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::Disconnecting;
                }
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("{}: {}", FATAL_COMMUNICATION_MSG, err);
                    break;
                }
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    SOCKET => {
                        if self.state == ConnectionState::Connecting {
                            if event.is_writable() && !self.complete_connection() {
                                alive = false;
                                break;
                            }
                            continue;
                        }
                        if event.is_readable() {
                            if let Err(err) = self.recv_from_server() {
                                debug!("{}: {}", FATAL_COMMUNICATION_MSG, err);
                                alive = false;
                                break;
                            }
                        }
                        if event.is_writable() {
                            if let Err(err) = self.send_to_server() {
                                debug!("{}: {}", FATAL_COMMUNICATION_MSG, err);
                                alive = false;
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.shutdown();
    }

    /// Finishes the non-blocking connect. Returns false when the attempt
    /// failed and the loop must stop.
    fn complete_connection(&mut self) -> bool {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                error!("failed to connect to the server: {}", err);
                return false;
            }
        }
        let addr = match self.stream.peer_addr() {
            Ok(addr) => addr,
            // Writable but not yet connected; wait for the next event.
            Err(err) if err.kind() == ErrorKind::NotConnected => return true,
            // Connected, but the remote address is unavailable; fall back
            // to the address we dialed.
            Err(_) => self.server_addr,
        };

        self.state = ConnectionState::Connected;
        self.set_interest(Interest::READABLE);
        self.emit(ListenerEvent::Connected(addr));
        debug!("connected to {}", addr);
        true
    }

    /// Drains readable bytes through the splitter and forwards every
    /// `BROADCAST` body to the listeners. Any other kind is a protocol
    /// violation, and end of stream means the server went away.
    fn recv_from_server(&mut self) -> Result<(), ChatError> {
        let mut scratch = [0u8; MAX_MSG_LENGTH];
        let mut eof = false;
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(received) => self.splitter.append(&scratch[..received])?,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        // Deliver what decoded before reporting the end of stream.
        while let Some(payload) = self.splitter.next_payload() {
            let kind = protocol::kind_of(&payload)?;
            if kind != MsgKind::Broadcast {
                return Err(ProtocolError::UnexpectedKind { kind }.into());
            }
            self.emit(ListenerEvent::MsgReceived(
                protocol::body_of(&payload).to_string(),
            ));
        }
        if eof {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    /// Writes queued frames head-first until drained or the socket would
    /// block; on drain the connection drops back to read interest.
    fn send_to_server(&mut self) -> Result<(), ChatError> {
        let mut queue = self.shared.outbound.lock().expect("outbound queue poisoned");
        loop {
            let Some(head) = queue.front() else {
                drop(queue);
                if self.state != ConnectionState::Disconnecting {
                    self.set_interest(Interest::READABLE);
                }
                return Ok(());
            };
            match self.stream.write(&head[self.head_written..]) {
                Ok(0) => return Ok(()),
                Ok(written) => {
                    self.head_written += written;
                    if self.head_written == head.len() {
                        queue.pop_front();
                        self.head_written = 0;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn outbound_is_empty(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .expect("outbound queue poisoned")
            .is_empty()
    }

    fn set_interest(&mut self, interest: Interest) {
        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut self.stream, SOCKET, interest)
        {
            warn!("failed to update interest: {}", err);
        }
    }

    fn emit(&self, event: ListenerEvent) {
        // The notifier thread outlives the driver; a send can only fail
        // during teardown.
        let _ = self.notify.send(event);
    }

    /// Orderly teardown: deregister, close, tell the listeners. Runs on
    /// every exit path.
    fn shutdown(mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.state = ConnectionState::Closed;
        if let Err(err) = self.poll.registry().deregister(&mut self.stream) {
            error!("{}: {}", FATAL_DISCONNECT_MSG, err);
        }
        self.emit(ListenerEvent::Disconnected);
        // Dropping the stream closes the socket.
    }
}

/// Delivers listener events in order, one at a time. A panicking listener
/// is logged and swallowed so it can never take down the I/O thread.
fn notifier_loop(events: Receiver<ListenerEvent>, listeners: Listeners) {
    while let Ok(event) = events.recv() {
        let guard = listeners.lock().expect("listener list poisoned");
        for listener in guard.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                ListenerEvent::Connected(addr) => listener.connected(*addr),
                ListenerEvent::MsgReceived(body) => listener.recvd_msg(body.clone()),
                ListenerEvent::Disconnected => listener.disconnected(),
            }));
            if outcome.is_err() {
                error!("communication listener panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_connect_fails() {
        let conn = ServerConnection::new();
        assert!(matches!(
            conn.send_username("ann"),
            Err(ChatError::NotConnected)
        ));
        assert!(matches!(
            conn.send_chat_entry("hi"),
            Err(ChatError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let mut conn = ServerConnection::new();
        conn.connect("127.0.0.1", port).unwrap();
        assert!(matches!(
            conn.connect("127.0.0.1", port),
            Err(ChatError::AlreadyStarted)
        ));
        conn.disconnect().unwrap();
    }
}
