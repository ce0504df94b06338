//! Socket server worker

use std::io::{ErrorKind, Read as _};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use bytes::BytesMut;
use tracing::debug;
use uuid::Uuid;

use crate::channel::EventSender;
use crate::socket::{SocketEvent, SocketFailure, SocketServerInit, RECV_BUFFER_LEN};
use crate::worker::read_init;
use crate::ChildProcess;

/// How often the server checks for an incoming connection
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker that binds, signals readiness, and reports the first greeting it reads
#[derive(Debug)]
pub struct SocketServerChild {
    /// UUID that should uniquely identify this process
    uuid: Uuid,
}

impl Default for SocketServerChild {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketServerChild {
    /// Create a new [`SocketServerChild`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: Uuid::now_v7(),
        }
    }
}

/// Report a failure to the parent, then fail the worker with the same reason
fn fail(events: &EventSender<SocketEvent>, stage: SocketFailure, reason: String) -> Result<()> {
    events.send(SocketEvent::Failed {
        reason: reason.clone(),
        stage,
    })?;
    bail!(reason)
}

impl ChildProcess for SocketServerChild {
    fn id(&self) -> String {
        self.uuid.to_string()
    }

    fn run(self) -> Result<()> {
        let SocketServerInit {
            bind_addr,
            event_server_name,
            accept_timeout_ms,
            read_timeout_ms,
        } = read_init()?;
        let events = EventSender::<SocketEvent>::connect(&event_server_name)?;

        debug!(%bind_addr, child_id = self.id(), "binding socket server");
        let listener = match TcpListener::bind(bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                return fail(
                    &events,
                    SocketFailure::Bind,
                    format!("failed to bind [{bind_addr}]: {e}"),
                )
            }
        };
        let addr = listener
            .local_addr()
            .context("failed to get listener address")?;
        events.send(SocketEvent::Ready { addr })?;

        listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;
        let deadline = Instant::now() + Duration::from_millis(accept_timeout_ms);
        let (mut stream, peer) = loop {
            match listener.accept() {
                Ok(conn) => break conn,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return fail(
                            &events,
                            SocketFailure::AcceptTimeout,
                            format!("no client connected within {accept_timeout_ms}ms"),
                        );
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    return fail(&events, SocketFailure::Io, format!("accept failed: {e}"));
                }
            }
        };
        debug!(%peer, "accepted client");

        stream
            .set_nonblocking(false)
            .context("failed to make stream blocking")?;
        stream
            .set_read_timeout(Some(Duration::from_millis(read_timeout_ms)))
            .context("failed to set read timeout")?;

        let mut buf = BytesMut::zeroed(RECV_BUFFER_LEN);
        let read = match stream.read(&mut buf[..]) {
            Ok(read) => read,
            Err(e) => {
                return fail(&events, SocketFailure::Io, format!("failed to read greeting: {e}"));
            }
        };
        buf.truncate(read);
        let text = String::from_utf8_lossy(&buf).into_owned();
        debug!(read, text, "read greeting");

        events.send(SocketEvent::Received {
            text,
            pid: std::process::id(),
        })
    }
}
