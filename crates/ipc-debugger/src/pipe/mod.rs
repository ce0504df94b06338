/*!
Pipe demo: one worker writes a single message into its end of an anonymous channel, the parent
reads it.

The channel is a connected pair of unix stream sockets (bidirectional, unnamed, created fresh per
run). The worker's end becomes its STDOUT; the parent's end carries a read timeout so a worker
that dies or hangs before writing turns into a `TIMEOUT`/`FAILED` line instead of a stuck run.
*/

use serde::{Deserialize, Serialize};

pub mod child;
pub mod parent;

pub use child::PipeWriterChild;
pub use parent::{receive_pipe_message, run_pipe_demo};

/// Message the pipe writer sends
pub const PIPE_MESSAGE: &str = "Hello from child process through pipe";

/// Init message sent to a pipe writer over STDIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeWriterInit {
    /// ID of the parent process
    ///
    /// Note that this is *not* the platform-specific PID
    pub parent_id: String,
}
