//! Orchestrator, which runs the demos into one [`Session`].
//!
//! ```text
//! Idle ──run()──▶ Running ──▶ Completed
//!                    │
//!                  stop()
//!                    ▼
//!                 Stopped
//! ```
//!
//! `run()` is also accepted from `Completed` and `Stopped`, and starts a fresh session. A
//! stopped run keeps unwinding on its own thread for a moment after [`Orchestrator::stop`]
//! returns; until it has, new runs are refused with [`OrchestratorError::AlreadyRunning`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::pipe::run_pipe_demo;
use crate::semaphore::run_mutex_demo;
use crate::shmem::run_shared_memory_demo;
use crate::sink::{ResultSink, Session, SharedSink, Tag};
use crate::socket::run_socket_demo;
use crate::{HarnessConfig, ProcessRegistry};

/// Lifecycle state of an [`Orchestrator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Nothing has run yet
    Idle,
    /// Demos are executing
    Running,
    /// The last run finished every demo it was asked to run
    Completed,
    /// The last run was cut short by [`Orchestrator::stop`]
    Stopped,
}

/// One of the demos a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoKind {
    /// Anonymous pipe
    Pipe,
    /// Named shared memory segment
    SharedMemory,
    /// Process-shared lock
    Semaphore,
    /// Loopback TCP exchange
    Socket,
}

impl DemoKind {
    /// Every demo, in the order a full run executes them
    pub const ALL: [DemoKind; 4] = [
        Self::Pipe,
        Self::SharedMemory,
        Self::Semaphore,
        Self::Socket,
    ];

    /// Short name, as typed at the launcher
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::SharedMemory => "shm",
            Self::Semaphore => "semaphore",
            Self::Socket => "socket",
        }
    }

    /// Tag of the lines the demo reports
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Self::Pipe => Tag::Pipe,
            Self::SharedMemory => Tag::Shm,
            Self::Semaphore => Tag::Semaphore,
            Self::Socket => Tag::Socket,
        }
    }

    /// Execute the demo, reporting into `sink`
    fn execute(self, config: &HarnessConfig, registry: &ProcessRegistry, sink: &dyn ResultSink) {
        match self {
            Self::Pipe => run_pipe_demo(config, registry, sink),
            Self::SharedMemory => run_shared_memory_demo(registry, sink),
            Self::Semaphore => run_mutex_demo(config, registry, sink),
            Self::Socket => run_socket_demo(config, registry, sink),
        }
    }
}

impl std::fmt::Display for DemoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DemoKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pipe" => Ok(Self::Pipe),
            "shm" => Ok(Self::SharedMemory),
            "semaphore" => Ok(Self::Semaphore),
            "socket" => Ok(Self::Socket),
            _ => bail!("invalid DemoKind value [{s}]"),
        }
    }
}

/// Lifecycle bookkeeping, guarded as one unit
#[derive(Debug)]
struct Lifecycle {
    /// State reported to callers
    state: OrchestratorState,

    /// Whether some call to `run`/`run_demo` has not returned yet
    ///
    /// Stays set after a stop until the stopped run has unwound.
    active: bool,
}

/// Runs the demos and exposes the control surface (`run`, `run_demo`, `stop`, `clear`)
///
/// Every method takes `&self`, so an orchestrator can be shared (e.g. in an `Arc`) between
/// the thread executing [`Orchestrator::run`] and the one issuing [`Orchestrator::stop`].
#[derive(Debug)]
pub struct Orchestrator {
    /// Settings applied to every demo
    config: HarnessConfig,

    /// Workers spawned by the current run
    registry: ProcessRegistry,

    /// Lines produced by the current run
    session: Session,

    /// Lifecycle state
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    /// Create an idle [`Orchestrator`] whose session is only kept in memory
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_session(config, Session::new())
    }

    /// Create an idle [`Orchestrator`] that also forwards every session line to `sink`
    #[must_use]
    pub fn with_sink(config: HarnessConfig, sink: SharedSink) -> Self {
        Self::with_session(config, Session::with_downstream(sink))
    }

    /// Create an idle [`Orchestrator`] around an existing session
    fn with_session(config: HarnessConfig, session: Session) -> Self {
        Self {
            registry: ProcessRegistry::new(config.worker_bin.clone()),
            config,
            session,
            lifecycle: Mutex::new(Lifecycle {
                state: OrchestratorState::Idle,
                active: false,
            }),
        }
    }

    /// Lock the lifecycle, recovering it if a previous holder panicked
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.lock_lifecycle().state
    }

    /// Settings applied to every demo
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Registry tracking the workers of the current run
    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Handle to the session of the current (or last) run
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Execute every demo in sequence, blocking until the run completes or is stopped
    ///
    /// Returns the state the run ended in, either [`OrchestratorState::Completed`] or
    /// [`OrchestratorState::Stopped`].
    pub fn run(&self) -> Result<OrchestratorState, OrchestratorError> {
        self.begin(true)?;

        let pid = std::process::id();
        info!(pid, "starting IPC debugger run");
        self.session
            .report(Tag::Debugger, format!("---- IPC Debugger (PID: {pid}) ----"));

        for demo in DemoKind::ALL {
            if self.state() != OrchestratorState::Running {
                info!(%demo, "run stopped, skipping remaining demos");
                break;
            }
            info!(%demo, "running demo");
            demo.execute(&self.config, &self.registry, &self.session);
        }

        Ok(self.finish(Some("IPC Monitoring Completed!")))
    }

    /// Execute a single demo, blocking until it completes or is stopped
    ///
    /// Unlike [`Orchestrator::run`], the demo's line is appended to the current session
    /// without banners. A session closed by a stop is started afresh.
    pub fn run_demo(&self, demo: DemoKind) -> Result<OrchestratorState, OrchestratorError> {
        self.begin(false)?;
        info!(%demo, "running single demo");
        demo.execute(&self.config, &self.registry, &self.session);
        Ok(self.finish(None))
    }

    /// Claim the orchestrator for a run, and prepare the registry and session
    fn begin(&self, fresh_session: bool) -> Result<(), OrchestratorError> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.active || lifecycle.state == OrchestratorState::Running {
            return Err(OrchestratorError::AlreadyRunning);
        }
        lifecycle.state = OrchestratorState::Running;
        lifecycle.active = true;
        self.registry.reset();
        if fresh_session || self.session.is_closed() {
            self.session.open();
        }
        Ok(())
    }

    /// Release the orchestrator at the end of a run, emitting `banner` unless it was stopped
    fn finish(&self, banner: Option<&str>) -> OrchestratorState {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state == OrchestratorState::Running {
            if let Some(banner) = banner {
                self.session.report(Tag::Debugger, banner.to_string());
            }
            lifecycle.state = OrchestratorState::Completed;
        }
        lifecycle.active = false;
        info!(state = ?lifecycle.state, "run finished");
        lifecycle.state
    }

    /// Forcefully terminate the current run
    ///
    /// The session is closed first, so nothing the interrupted demo reports afterwards can
    /// land after the single STOPPED line. Returns how many live workers were killed.
    pub fn stop(&self) -> Result<usize, OrchestratorError> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != OrchestratorState::Running {
            warn!(state = ?lifecycle.state, "stop requested outside of a run");
            return Err(OrchestratorError::NotRunning(lifecycle.state));
        }
        self.session.close();
        let killed = self.registry.stop_all(&self.session);
        lifecycle.state = OrchestratorState::Stopped;
        Ok(killed)
    }

    /// Discard the lines of the current session, in any state
    pub fn clear(&self) {
        self.session.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sink::ResultLine;

    /// Config whose "worker" exits immediately, with short bounds everywhere
    fn crashing_config() -> HarnessConfig {
        let mut config = HarnessConfig::new("false");
        config.recv_timeout = Duration::from_millis(200);
        config.join_timeout = Duration::from_millis(500);
        config.lock_timeout = Duration::from_millis(100);
        config.connect_timeout = Duration::from_millis(100);
        config.lock_hold = Duration::from_millis(50);
        config
    }

    #[test]
    fn stop_is_rejected_outside_a_run() {
        let orchestrator = Orchestrator::new(crashing_config());
        assert_eq!(
            orchestrator.stop(),
            Err(OrchestratorError::NotRunning(OrchestratorState::Idle))
        );
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert!(orchestrator.session().is_empty());
    }

    #[test]
    fn failing_workers_still_yield_one_line_per_demo() {
        let orchestrator = Orchestrator::new(crashing_config());
        assert_eq!(orchestrator.run(), Ok(OrchestratorState::Completed));

        let lines = orchestrator.session().lines();
        let tags: Vec<_> = lines.iter().map(ResultLine::tag).collect();
        assert_eq!(
            tags,
            vec![
                Tag::Debugger,
                Tag::Pipe,
                Tag::Shm,
                Tag::Semaphore,
                Tag::Socket,
                Tag::Debugger,
            ]
        );
        assert!(lines[1].text().starts_with("FAILED: "));
        assert!(lines[2].text().starts_with("Written: Shared Memory Data"));
        assert_eq!(lines[5].text(), "IPC Monitoring Completed!");
        assert_eq!(orchestrator.registry().alive_count(), 0);
    }

    #[test]
    fn clear_keeps_the_state() {
        let orchestrator = Orchestrator::new(crashing_config());
        orchestrator.clear();
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);

        orchestrator.run().unwrap();
        assert!(!orchestrator.session().is_empty());
        orchestrator.clear();
        assert!(orchestrator.session().is_empty());
        assert_eq!(orchestrator.state(), OrchestratorState::Completed);
    }

    #[test]
    fn demo_kinds_parse_their_own_names() {
        for demo in DemoKind::ALL {
            assert_eq!(demo.as_str().parse::<DemoKind>().unwrap(), demo);
        }
        assert!("sockets".parse::<DemoKind>().is_err());
    }

    #[test]
    fn single_demos_append_without_banners() {
        let orchestrator = Orchestrator::new(crashing_config());
        assert_eq!(
            orchestrator.run_demo(DemoKind::SharedMemory),
            Ok(OrchestratorState::Completed)
        );
        assert_eq!(
            orchestrator.run_demo(DemoKind::Pipe),
            Ok(OrchestratorState::Completed)
        );

        let tags: Vec<_> = orchestrator.session().lines().iter().map(ResultLine::tag).collect();
        assert_eq!(tags, vec![Tag::Shm, Tag::Pipe]);
        assert_eq!(orchestrator.registry().alive_count(), 0);
    }

    #[test]
    fn a_completed_run_can_run_again() {
        let orchestrator = Orchestrator::new(crashing_config());
        orchestrator.run().unwrap();
        let first = orchestrator.session().len();
        orchestrator.run().unwrap();
        assert_eq!(orchestrator.session().len(), first);
    }
}
