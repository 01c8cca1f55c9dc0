//! ServerConnection behavior against a live server.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use chat_relay::{BroadcastHandle, ChatServer, CommunicationListener, ServerConnection};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Connected(SocketAddr),
    Msg(String),
    Disconnected,
}

/// Forwards every callback into a channel the test can assert on.
struct RecordingListener {
    events: Sender<Event>,
}

impl CommunicationListener for RecordingListener {
    fn connected(&self, addr: SocketAddr) {
        let _ = self.events.send(Event::Connected(addr));
    }

    fn disconnected(&self) {
        let _ = self.events.send(Event::Disconnected);
    }

    fn recvd_msg(&self, body: String) {
        let _ = self.events.send(Event::Msg(body));
    }
}

fn start_server() -> (SocketAddr, BroadcastHandle) {
    let server = ChatServer::bind(0).expect("bind server");
    let port = server.local_addr().expect("server address").port();
    let handle = server.handle();
    thread::spawn(move || {
        let _ = server.run();
    });
    (SocketAddr::from(([127, 0, 0, 1], port)), handle)
}

#[test]
fn test_lifecycle_callbacks_and_chat() {
    let (addr, _handle) = start_server();
    let (tx, rx) = mpsc::channel();

    let mut conn = ServerConnection::new();
    conn.add_communication_listener(RecordingListener { events: tx });
    conn.connect("127.0.0.1", addr.port()).expect("connect");

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Connected(addr));

    conn.send_username("carol").expect("send username");
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Msg("carol joined conversation.".to_string())
    );

    conn.send_chat_entry("hello there").expect("send entry");
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Msg("carol: hello there".to_string())
    );

    conn.disconnect().expect("disconnect");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnected);
}

#[test]
fn test_broadcasts_reach_the_listener() {
    let (addr, handle) = start_server();
    let (tx, rx) = mpsc::channel();

    let mut conn = ServerConnection::new();
    conn.add_communication_listener(RecordingListener { events: tx });
    conn.connect("127.0.0.1", addr.port()).expect("connect");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Connected(addr));

    handle.broadcast("welcome aboard");
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Msg("welcome aboard".to_string())
    );

    conn.disconnect().expect("disconnect");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnected);
}

#[test]
fn test_disconnected_is_the_last_callback() {
    let (addr, _handle) = start_server();
    let (tx, rx) = mpsc::channel();

    let mut conn = ServerConnection::new();
    conn.add_communication_listener(RecordingListener { events: tx });
    conn.connect("127.0.0.1", addr.port()).expect("connect");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Connected(addr));

    conn.send_username("dave").expect("send username");
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Event::Msg("dave joined conversation.".to_string())
    );

    conn.disconnect().expect("disconnect");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnected);
    // Nothing after the disconnect callback.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
