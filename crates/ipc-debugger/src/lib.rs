//! This crate contains a diagnostic harness for inter-process communication.
//!
//! A run spawns short-lived worker processes (see [`WorkerRole`]) and exercises four
//! mechanisms against them, one after the other:
//!
//! - an anonymous, bidirectional pipe ([`pipe`])
//! - a named shared memory segment ([`shmem`])
//! - a process-shared lock guarding a critical section ([`semaphore`])
//! - a loopback TCP exchange between a server and a client worker ([`socket`])
//!
//! Every outcome, successful or not, becomes exactly one [`ResultLine`] in the ordered
//! [`Session`] owned by the [`Orchestrator`].

#![deny(
    missing_docs,
    clippy::missing_docs_in_private_items,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
    rustdoc::missing_crate_level_docs,
    rustdoc::invalid_codeblock_attributes,
    rustdoc::invalid_html_tags,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::bare_urls,
    rustdoc::unescaped_backticks,
    rustdoc::redundant_explicit_links
)]

use std::time::SystemTime;

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

pub mod channel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipe;
pub mod registry;
pub mod semaphore;
pub mod shmem;
pub mod sink;
pub mod socket;
pub mod worker;

pub use config::HarnessConfig;
pub use error::{DemoError, OrchestratorError};
pub use orchestrator::{DemoKind, Orchestrator, OrchestratorState};
pub use registry::{ProcessRegistry, WorkerProcess};
pub use sink::{ResultLine, ResultSink, Session, Tag, WriterSink};

/// Role played by a worker process.
///
/// The role is passed as the first argument to the worker binary, and decides which
/// init message the worker expects on STDIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    /// Writes a single message into its end of an anonymous pipe
    PipeWriter,
    /// Competes for the process-shared lock
    LockContender,
    /// Binds, listens and reports the first greeting it receives
    SocketServer,
    /// Connects to the server and sends a greeting
    SocketClient,
}

impl WorkerRole {
    /// Command line form of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipeWriter => "pipe-writer",
            Self::LockContender => "lock-contender",
            Self::SocketServer => "socket-server",
            Self::SocketClient => "socket-client",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pipe-writer" => Ok(Self::PipeWriter),
            "lock-contender" => Ok(Self::LockContender),
            "socket-server" => Ok(Self::SocketServer),
            "socket-client" => Ok(Self::SocketClient),
            _ => bail!("invalid WorkerRole value [{s}]"),
        }
    }
}

/// Worker process that executes one role of a demo
pub trait ChildProcess {
    /// ID of the child process
    ///
    /// Note that this is *not* the platform-specific PID
    fn id(&self) -> String;

    /// Execute as the running process.
    ///
    /// Unlike long-lived servers, workers perform a single protocol step and return.
    fn run(self) -> Result<()>;
}

/// Retrieve current system time as milliseconds since the UNIX epoch
pub fn get_system_time_millis() -> Result<u128> {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|v| v.as_millis())
        .context("failed to retrieve system time")
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn worker_role_parses_its_own_display_form() {
        for role in [
            WorkerRole::PipeWriter,
            WorkerRole::LockContender,
            WorkerRole::SocketServer,
            WorkerRole::SocketClient,
        ] {
            assert_eq!(WorkerRole::from_str(&role.to_string()).unwrap(), role);
        }
    }

    #[test]
    fn worker_role_rejects_unknown_names() {
        let err = WorkerRole::from_str("forker").unwrap_err();
        assert!(err.to_string().contains("forker"));
    }
}
