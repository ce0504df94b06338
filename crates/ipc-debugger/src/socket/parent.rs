//! Parent-side socket demo

use std::net::SocketAddr;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::channel::EventChannel;
use crate::config::millis;
use crate::registry::WorkerProcess;
use crate::sink::{ResultSink, Tag};
use crate::socket::{SocketClientInit, SocketEvent, SocketFailure, SocketServerInit};
use crate::{DemoError, HarnessConfig, ProcessRegistry, WorkerRole};

/// Outcome of a successful greeting exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketExchange {
    /// Address the server listened on
    pub server_addr: SocketAddr,
    /// Greeting as the server received it
    pub text: String,
    /// OS PID of the server
    pub server_pid: u32,
}

/// Run the socket demo, reporting exactly one [`Tag::Socket`] line to `sink`
pub fn run_socket_demo(config: &HarnessConfig, registry: &ProcessRegistry, sink: &dyn ResultSink) {
    match exchange_greeting(config, registry) {
        Ok(SocketExchange {
            text, server_pid, ..
        }) => sink.report(
            Tag::Socket,
            format!("Received: {text} (PID: {server_pid})"),
        ),
        Err(e) => {
            warn!(error = %e, "socket demo failed");
            sink.append(e.to_line(Tag::Socket));
        }
    }
}

/// Spawn a server and a client, and return what the server received
///
/// Returns once both workers have been joined (or terminated).
pub fn exchange_greeting(
    config: &HarnessConfig,
    registry: &ProcessRegistry,
) -> Result<SocketExchange, DemoError> {
    let mut events = EventChannel::<SocketEvent>::new("socket server events")?;
    let accept_timeout = config.connect_timeout + config.recv_timeout;
    let server = registry.spawn(
        WorkerRole::SocketServer,
        &SocketServerInit {
            bind_addr: config.socket_addr,
            event_server_name: events.server_name().to_string(),
            accept_timeout_ms: millis(accept_timeout),
            read_timeout_ms: millis(config.recv_timeout),
        },
    )?;

    let exchange = match converse(config, registry, &mut events) {
        Ok(exchange) => exchange,
        Err(e) => {
            registry.terminate(&server);
            return Err(e);
        }
    };

    let status = registry.join_or_terminate(&server, config.join_timeout)?;
    if !status.success() {
        return Err(DemoError::WorkerCrashed {
            role: server.role(),
            status: status.to_string(),
        });
    }
    debug!(addr = %exchange.server_addr, "socket exchange complete");
    Ok(exchange)
}

/// Wait for server readiness, run the client, then collect what the server read
fn converse(
    config: &HarnessConfig,
    registry: &ProcessRegistry,
    events: &mut EventChannel<SocketEvent>,
) -> Result<SocketExchange, DemoError> {
    let server_addr = match events.recv_timeout(config.recv_timeout)? {
        Some(SocketEvent::Ready { addr }) => addr,
        other => return Err(unexpected(config, other, "readiness")),
    };
    debug!(%server_addr, "socket server is listening, spawning client");

    let client: WorkerProcess = registry.spawn(
        WorkerRole::SocketClient,
        &SocketClientInit {
            server_addr,
            connect_timeout_ms: millis(config.connect_timeout),
        },
    )?;
    let status = registry.join_or_terminate(&client, config.connect_timeout + config.join_timeout)?;
    if !status.success() {
        return Err(DemoError::WorkerCrashed {
            role: client.role(),
            status: status.to_string(),
        });
    }

    match events.recv_timeout(config.recv_timeout)? {
        Some(SocketEvent::Received { text, pid }) => Ok(SocketExchange {
            server_addr,
            text,
            server_pid: pid,
        }),
        other => Err(unexpected(config, other, "a greeting")),
    }
}

/// Convert anything but the expected event into an error
fn unexpected(config: &HarnessConfig, event: Option<SocketEvent>, expected: &str) -> DemoError {
    match event {
        Some(SocketEvent::Failed {
            reason,
            stage: SocketFailure::Bind,
        }) => DemoError::Resource(reason),
        Some(SocketEvent::Failed {
            stage: SocketFailure::AcceptTimeout,
            ..
        }) => DemoError::timeout(
            "a client connection",
            config.connect_timeout + config.recv_timeout,
        ),
        Some(SocketEvent::Failed {
            reason,
            stage: SocketFailure::Io,
        }) => anyhow!("socket server failed: {reason}").into(),
        Some(event) => anyhow!("expected {expected} from socket server, got {event:?}").into(),
        None => DemoError::WorkerCrashed {
            role: WorkerRole::SocketServer,
            status: format!("disconnected before sending {expected}"),
        },
    }
}
