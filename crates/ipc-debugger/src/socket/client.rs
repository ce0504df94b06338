//! Socket client worker

use std::io::Write as _;
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use tracing::debug;
use uuid::Uuid;

use crate::socket::{greeting, SocketClientInit};
use crate::worker::read_init;
use crate::ChildProcess;

/// Delay before the first reconnect attempt, doubled after each failure
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Upper bound on the reconnect delay
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Worker that connects to the server and sends one greeting
#[derive(Debug)]
pub struct SocketClientChild {
    /// UUID that should uniquely identify this process
    uuid: Uuid,
}

impl Default for SocketClientChild {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketClientChild {
    /// Create a new [`SocketClientChild`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: Uuid::now_v7(),
        }
    }
}

impl ChildProcess for SocketClientChild {
    fn id(&self) -> String {
        self.uuid.to_string()
    }

    fn run(self) -> Result<()> {
        let SocketClientInit {
            server_addr,
            connect_timeout_ms,
        } = read_init()?;

        let deadline = Instant::now() + Duration::from_millis(connect_timeout_ms);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts: u32 = 0;
        let mut stream = loop {
            attempts += 1;
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            match TcpStream::connect_timeout(&server_addr, remaining) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() + backoff >= deadline {
                        bail!("failed to connect to [{server_addr}] after {attempts} attempts: {e}");
                    }
                    debug!(%server_addr, attempts, error = %e, ?backoff, "connect failed, retrying");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        };
        debug!(%server_addr, attempts, child_id = self.id(), "connected to server");

        stream
            .write_all(greeting(std::process::id()).as_bytes())
            .context("failed to send greeting")?;
        stream
            .shutdown(Shutdown::Write)
            .context("failed to close write side")?;
        Ok(())
    }
}
