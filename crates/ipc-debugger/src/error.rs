//! Error kinds surfaced at the demo and control boundaries

use std::time::Duration;

use crate::orchestrator::OrchestratorState;
use crate::sink::{ResultLine, Tag};
use crate::WorkerRole;

/// Failure of a single demo
///
/// Every variant converts into exactly one [`ResultLine`] via [`DemoError::to_line`].
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// A bounded wait ran out
    #[error("waited {limit:?} for {waiting_for}")]
    Timeout {
        /// What the parent was waiting on
        waiting_for: String,
        /// The bound that expired
        limit: Duration,
    },

    /// A resource was unavailable (address in use, segment name taken)
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// A worker exited without completing its protocol step
    #[error("worker [{role}] exited without completing its step ({status})")]
    WorkerCrashed {
        /// Role of the worker
        role: WorkerRole,
        /// Exit status (or a description of it)
        status: String,
    },

    /// A worker was terminated from outside (normally by a stop)
    #[error("worker [{role}] was terminated")]
    Terminated {
        /// Role of the worker
        role: WorkerRole,
    },

    /// Any other failure (I/O, serialization, OS calls)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DemoError {
    /// Build a [`DemoError::Timeout`]
    pub fn timeout(waiting_for: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
            limit,
        }
    }

    /// Whether this error is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Render this error as the single line reported for a failed demo
    #[must_use]
    pub fn to_line(&self, tag: Tag) -> ResultLine {
        match self {
            Self::Timeout { .. } => ResultLine::new(tag, format!("TIMEOUT: {self}")),
            Self::Other(e) => ResultLine::new(tag, format!("FAILED: {e:#}")),
            _ => ResultLine::new(tag, format!("FAILED: {self}")),
        }
    }
}

/// Invalid use of the control surface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// `run()` was invoked before the previous run returned (even if it was stopped)
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// `stop()` was invoked outside of a run
    #[error("no run in progress (state: {0:?})")]
    NotRunning(OrchestratorState),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timeouts_render_as_a_distinct_outcome() {
        let line = DemoError::timeout("pipe message", Duration::from_millis(250)).to_line(Tag::Pipe);
        assert_eq!(line.tag(), Tag::Pipe);
        assert_eq!(line.text(), "TIMEOUT: waited 250ms for pipe message");
    }

    #[test]
    fn other_failures_render_as_failed() {
        let line = DemoError::Resource("127.0.0.1:65432 in use".into()).to_line(Tag::Socket);
        assert_eq!(
            line.text(),
            "FAILED: resource unavailable: 127.0.0.1:65432 in use"
        );

        let line = DemoError::from(anyhow::anyhow!("inner").context("outer")).to_line(Tag::Shm);
        assert_eq!(line.text(), "FAILED: outer: inner");
    }
}
