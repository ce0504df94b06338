//! Parent-side pipe demo

use std::io::{ErrorKind, Read as _};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Stdio;

use anyhow::Context as _;
use tracing::{debug, warn};

use crate::pipe::PipeWriterInit;
use crate::sink::{ResultSink, Tag};
use crate::{DemoError, HarnessConfig, ProcessRegistry, WorkerRole};

/// Run the pipe demo, reporting exactly one [`Tag::Pipe`] line to `sink`
pub fn run_pipe_demo(config: &HarnessConfig, registry: &ProcessRegistry, sink: &dyn ResultSink) {
    match receive_pipe_message(config, registry) {
        Ok(message) => sink.report(Tag::Pipe, format!("Received: {message}")),
        Err(e) => {
            warn!(error = %e, "pipe demo failed");
            sink.append(e.to_line(Tag::Pipe));
        }
    }
}

/// Spawn a pipe writer and return the message it wrote
///
/// The message is only returned once the writer has been joined.
pub fn receive_pipe_message(
    config: &HarnessConfig,
    registry: &ProcessRegistry,
) -> Result<String, DemoError> {
    let (mut parent_end, child_end) = UnixStream::pair().context("failed to create pipe")?;
    parent_end
        .set_read_timeout(Some(config.recv_timeout))
        .context("failed to set pipe read timeout")?;

    let init = PipeWriterInit {
        parent_id: format!("parent-{}", std::process::id()),
    };
    let worker = registry.spawn_with_stdout(
        WorkerRole::PipeWriter,
        &init,
        Stdio::from(OwnedFd::from(child_end)),
    )?;

    debug!(pid = worker.pid(), "reading message from pipe");
    let mut payload = Vec::new();
    let read = parent_end.read_to_end(&mut payload);
    drop(parent_end);

    if let Err(e) = read {
        registry.terminate(&worker);
        return Err(match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => DemoError::timeout(
                format!("message from [{}] (PID {})", worker.role(), worker.pid()),
                config.recv_timeout,
            ),
            _ => anyhow::Error::new(e)
                .context("failed to read from pipe")
                .into(),
        });
    }

    let status = registry.join_or_terminate(&worker, config.join_timeout)?;
    if !status.success() || payload.is_empty() {
        return Err(DemoError::WorkerCrashed {
            role: worker.role(),
            status: status.to_string(),
        });
    }
    debug!(len = payload.len(), %status, "received pipe message");

    String::from_utf8(payload)
        .context("pipe message is not valid UTF-8")
        .map_err(DemoError::from)
}
