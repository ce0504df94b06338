/*!
Socket demo: a server worker and a client worker exchange one greeting over loopback TCP.

The server reports back to the parent over an [`EventChannel`](crate::channel::EventChannel),
since it runs in a separate process:

1. `Ready` once it is bound and listening (the client is only spawned after this)
2. `Received` with the greeting it read, or `Failed` if binding, accepting or reading failed

The protocol itself is deliberately minimal: one plaintext message, no response, no framing
beyond a single read of up to [`RECV_BUFFER_LEN`] bytes.
**/

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod parent;
pub mod server;

pub use client::SocketClientChild;
pub use parent::{exchange_greeting, run_socket_demo, SocketExchange};
pub use server::SocketServerChild;

/// Largest greeting the server reads
pub const RECV_BUFFER_LEN: usize = 1024;

/// Greeting sent by the client with the given PID
#[must_use]
pub fn greeting(pid: u32) -> String {
    format!("Hello from socket client! (PID: {pid})")
}

/// Init message sent to the socket server over STDIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketServerInit {
    /// Address to bind
    pub bind_addr: SocketAddr,
    /// Name of the IPC server to report [`SocketEvent`]s to
    pub event_server_name: String,
    /// How long to wait for the client to connect
    pub accept_timeout_ms: u64,
    /// How long to wait for the greeting once connected
    pub read_timeout_ms: u64,
}

/// Init message sent to the socket client over STDIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketClientInit {
    /// Address the server reported as listening
    pub server_addr: SocketAddr,
    /// Total time allowed for connection attempts
    pub connect_timeout_ms: u64,
}

/// Stage at which the server failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketFailure {
    /// Binding the address failed (e.g. already in use)
    Bind,
    /// No client connected in time
    AcceptTimeout,
    /// Accepting or reading the greeting failed
    Io,
}

/// Event reported by the socket server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketEvent {
    /// The server is bound and listening on `addr`
    Ready {
        /// Address actually bound (resolves port 0)
        addr: SocketAddr,
    },
    /// The server read a greeting
    Received {
        /// Greeting as received
        text: String,
        /// OS PID of the server
        pid: u32,
    },
    /// The server gave up
    Failed {
        /// Human-readable reason
        reason: String,
        /// Stage that failed
        stage: SocketFailure,
    },
}
