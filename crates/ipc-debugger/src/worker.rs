//! Worker-side entrypoint shared by every role

use std::io::{stdin, BufRead as _};

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::pipe::PipeWriterChild;
use crate::semaphore::LockContenderChild;
use crate::socket::{SocketClientChild, SocketServerChild};
use crate::{ChildProcess as _, WorkerRole};

/// Read the one-line JSON init message the parent writes to STDIN
pub fn read_init<T: DeserializeOwned>() -> Result<T> {
    debug!("reading init message from STDIN");
    let mut line = String::new();
    stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from STDIN")?;
    serde_json::from_str(&line).context("failed to read init message from STDIN")
}

/// Run the given role in the current process
pub fn run_role(role: WorkerRole) -> Result<()> {
    debug!(%role, pid = std::process::id(), "worker starting");
    match role {
        WorkerRole::PipeWriter => PipeWriterChild::new().run(),
        WorkerRole::LockContender => LockContenderChild::new().run(),
        WorkerRole::SocketServer => SocketServerChild::new().run(),
        WorkerRole::SocketClient => SocketClientChild::new().run(),
    }
}
