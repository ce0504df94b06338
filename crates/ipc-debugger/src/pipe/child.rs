//! Pipe writer worker

use std::io::{stdout, Write as _};

use anyhow::{Context as _, Result};
use tracing::debug;
use uuid::Uuid;

use crate::pipe::{PipeWriterInit, PIPE_MESSAGE};
use crate::worker::read_init;
use crate::ChildProcess;

/// Worker that writes [`PIPE_MESSAGE`] into its STDOUT (the child end of the pipe)
#[derive(Debug)]
pub struct PipeWriterChild {
    /// UUID that should uniquely identify this process
    uuid: Uuid,
}

impl Default for PipeWriterChild {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeWriterChild {
    /// Create a new [`PipeWriterChild`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: Uuid::now_v7(),
        }
    }
}

impl ChildProcess for PipeWriterChild {
    fn id(&self) -> String {
        self.uuid.to_string()
    }

    fn run(self) -> Result<()> {
        let PipeWriterInit { parent_id } = read_init()?;
        debug!(parent_id, child_id = self.id(), "writing message into pipe");

        let mut pipe = stdout().lock();
        pipe.write_all(PIPE_MESSAGE.as_bytes())
            .context("failed to write message into pipe")?;
        pipe.flush().context("failed to flush pipe")?;
        Ok(())
    }
}
