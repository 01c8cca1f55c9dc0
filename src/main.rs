//! Broadcast chat server - entry point
//!
//! Parses the port argument, initializes logging and serves forever.

use std::env;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatServer, DEFAULT_PORT};

fn main() {
    // Logging goes to stderr; RUST_LOG controls the level,
    // e.g. RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // One positional argument: the port number. Invalid input falls back
    // to the default with a warning.
    let port = match env::args().nth(1) {
        Some(arg) => arg.parse().unwrap_or_else(|_| {
            warn!("invalid port number {:?}, using default {}", arg, DEFAULT_PORT);
            DEFAULT_PORT
        }),
        None => DEFAULT_PORT,
    };

    let server = match ChatServer::bind(port) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to bind port {}: {}", port, err);
            std::process::exit(1);
        }
    };
    if let Ok(addr) = server.local_addr() {
        info!("chat server listening on {}", addr);
    }

    if let Err(err) = server.run() {
        error!("server failure: {}", err);
        std::process::exit(1);
    }
}
