//! Process registry, which tracks every worker spawned by any demo so they can be
//! force-terminated as a group.
//!
//! A registry is owned by the [`Orchestrator`](crate::Orchestrator) and handed to each
//! demo explicitly. Workers are registered *before* [`ProcessRegistry::spawn`] returns,
//! so a later [`ProcessRegistry::stop_all`] can always reach them.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DemoError;
use crate::sink::{ResultSink, Tag};
use crate::WorkerRole;

/// How often [`ProcessRegistry::join`] polls a worker for its exit status
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a spawned worker process
///
/// The OS-level [`Child`] stays inside the registry; this handle only identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    /// Registry-assigned identifier
    id: Uuid,
    /// Role the worker runs
    role: WorkerRole,
    /// Platform-specific PID
    pid: u32,
}

impl WorkerProcess {
    /// Retrieve the registry-assigned ID of the worker
    ///
    /// Note this is *not* the platform-specific PID
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Retrieve the role the worker runs
    #[must_use]
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Retrieve the OS PID of the worker
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Identifies a cleanup action registered with [`ProcessRegistry::register_cleanup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupId(u64);

/// Action run by [`ProcessRegistry::stop_all`] to release a resource left behind by a stop
type CleanupAction = Box<dyn FnOnce() + Send>;

/// A worker the registry is tracking
struct TrackedWorker {
    /// Identity of the worker
    handle: WorkerProcess,
    /// OS process handle
    child: Child,
}

/// Mutable registry state
#[derive(Default)]
struct RegistryState {
    /// Workers spawned and not yet joined or reaped
    workers: Vec<TrackedWorker>,

    /// Pending cleanup actions, by ID and label
    cleanups: Vec<(CleanupId, String, CleanupAction)>,

    /// Next cleanup ID to hand out
    next_cleanup_id: u64,

    /// Whether a stop has fired since the last [`ProcessRegistry::reset`]
    stopped: bool,
}

/// Tracks worker processes and pending cleanups for one orchestrator
///
/// Cloning produces another handle to the same registry.
#[derive(Clone)]
pub struct ProcessRegistry {
    /// Binary every worker is spawned from
    worker_bin: PathBuf,

    /// Shared state, mutated by the run thread and by stop requests
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ProcessRegistry")
            .field("worker_bin", &self.worker_bin)
            .field("tracked", &state.workers.len())
            .field("pending_cleanups", &state.cleanups.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl ProcessRegistry {
    /// Create a [`ProcessRegistry`] that spawns workers from `worker_bin`
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            state: Arc::default(),
        }
    }

    /// Retrieve the binary workers are spawned from
    #[must_use]
    pub fn worker_bin(&self) -> &Path {
        &self.worker_bin
    }

    /// Lock the state, recovering it if a previous holder panicked
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow spawning again after a stop
    pub fn reset(&self) {
        self.lock().stopped = false;
    }

    /// Spawn a worker for `role`, sending it `init` as a JSON line over STDIN
    pub fn spawn<I: Serialize>(&self, role: WorkerRole, init: &I) -> Result<WorkerProcess> {
        self.spawn_with_stdout(role, init, Stdio::null())
    }

    /// Spawn a worker for `role` with a specific STDOUT (e.g. one end of a pipe)
    ///
    /// Any child-side descriptor passed in `stdout` is closed in this process before
    /// returning, so the worker holds the only copy.
    pub fn spawn_with_stdout<I: Serialize>(
        &self,
        role: WorkerRole,
        init: &I,
        stdout: Stdio,
    ) -> Result<WorkerProcess> {
        let init_bytes = serde_json::to_vec(init).context("failed to serialize init msg")?;

        let (handle, stdin) = {
            let mut state = self.lock();
            if state.stopped {
                bail!("refusing to spawn worker [{role}] after stop");
            }

            debug!(%role, bin = %self.worker_bin.display(), "spawning worker");
            let mut cmd = Command::new(&self.worker_bin);
            cmd.arg(role.as_str())
                .stdin(Stdio::piped())
                .stdout(stdout)
                .stderr(Stdio::inherit());
            let mut child = cmd
                .spawn()
                .with_context(|| format!("failed to spawn worker [{role}]"))?;
            // Dropping the command closes our copy of the child's STDOUT
            drop(cmd);

            let stdin = child.stdin.take();
            let handle = WorkerProcess {
                id: Uuid::now_v7(),
                role,
                pid: child.id(),
            };
            state.workers.push(TrackedWorker {
                handle: handle.clone(),
                child,
            });
            (handle, stdin)
        };

        let written = (|| {
            let mut stdin = stdin.context("failed to get worker STDIN")?;
            stdin.write_all(&init_bytes).context("failed to write init msg")?;
            stdin.write_all(b"\n").context("failed to write new line")?;
            stdin.flush().context("failed to flush worker STDIN")
        })();
        if let Err(e) = written {
            // The worker stays registered, joining it reports how it exited
            warn!(%role, pid = handle.pid, error = ?e, "failed to deliver init msg");
        }

        debug!(%role, pid = handle.pid, "worker spawned & registered");
        Ok(handle)
    }

    /// Wait (bounded by `timeout`) for a worker to exit, then stop tracking it
    pub fn join(&self, worker: &WorkerProcess, timeout: Duration) -> Result<ExitStatus, DemoError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                let Some(pos) = state
                    .workers
                    .iter()
                    .position(|w| w.handle.id == worker.id)
                else {
                    return Err(DemoError::Terminated { role: worker.role });
                };
                let exit = state.workers[pos]
                    .child
                    .try_wait()
                    .with_context(|| format!("failed to poll worker [{}]", worker.role))?;
                if let Some(status) = exit {
                    state.workers.remove(pos);
                    debug!(role = %worker.role, pid = worker.pid, %status, "joined worker");
                    return Ok(status);
                }
            }

            if Instant::now() >= deadline {
                return Err(DemoError::timeout(
                    format!("worker [{}] (PID {}) to exit", worker.role, worker.pid),
                    timeout,
                ));
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    /// Wait for a worker like [`ProcessRegistry::join`], terminating it if the wait times out
    pub fn join_or_terminate(
        &self,
        worker: &WorkerProcess,
        timeout: Duration,
    ) -> Result<ExitStatus, DemoError> {
        let joined = self.join(worker, timeout);
        if joined.as_ref().is_err_and(DemoError::is_timeout) {
            warn!(role = %worker.role, pid = worker.pid, "worker outlived its join timeout");
            self.terminate(worker);
        }
        joined
    }

    /// Forcefully terminate and reap a single worker
    ///
    /// Returns whether the worker was still alive.
    pub fn terminate(&self, worker: &WorkerProcess) -> bool {
        let tracked = {
            let mut state = self.lock();
            let pos = state
                .workers
                .iter()
                .position(|w| w.handle.id == worker.id);
            pos.map(|pos| state.workers.remove(pos))
        };
        tracked.is_some_and(|mut w| kill_and_reap(&mut w))
    }

    /// Forcefully terminate every tracked worker and release registered resources
    ///
    /// Emits one [`Tag::Stopped`] line to `sink` and returns how many live workers were
    /// killed. Safe to call repeatedly, and with nothing tracked.
    pub fn stop_all(&self, sink: &dyn ResultSink) -> usize {
        let (workers, cleanups) = {
            let mut state = self.lock();
            state.stopped = true;
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.cleanups),
            )
        };

        let terminated = workers
            .into_iter()
            .map(|mut w| kill_and_reap(&mut w))
            .filter(|alive| *alive)
            .count();
        for (_, label, action) in cleanups {
            debug!(label, "running cleanup for stopped run");
            action();
        }

        info!(terminated, "stopped all workers");
        sink.report(
            Tag::Stopped,
            format!("All IPC processes terminated ({terminated} killed)"),
        );
        terminated
    }

    /// Whether the registry still tracks `worker`, i.e. it was neither joined nor terminated
    #[must_use]
    pub fn is_tracked(&self, worker: &WorkerProcess) -> bool {
        self.lock().workers.iter().any(|w| w.handle.id == worker.id)
    }

    /// Number of tracked workers that are still running
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.lock()
            .workers
            .iter_mut()
            .filter_map(|w| w.child.try_wait().ok())
            .filter(Option::is_none)
            .count()
    }

    /// Register an action that [`ProcessRegistry::stop_all`] runs if a stop fires before
    /// the owner calls [`ProcessRegistry::release_cleanup`]
    pub fn register_cleanup(
        &self,
        label: impl Into<String>,
        action: impl FnOnce() + Send + 'static,
    ) -> CleanupId {
        let mut state = self.lock();
        let id = CleanupId(state.next_cleanup_id);
        state.next_cleanup_id += 1;
        state.cleanups.push((id, label.into(), Box::new(action)));
        id
    }

    /// Drop a registered cleanup without running it
    ///
    /// Returns `false` if the action already ran (or never existed).
    pub fn release_cleanup(&self, id: CleanupId) -> bool {
        let mut state = self.lock();
        let before = state.cleanups.len();
        state.cleanups.retain(|(cid, _, _)| *cid != id);
        state.cleanups.len() != before
    }
}

/// Kill a worker if it is still alive, then reap it
///
/// Returns whether the worker was alive.
fn kill_and_reap(tracked: &mut TrackedWorker) -> bool {
    let TrackedWorker { handle, child } = tracked;
    let alive = matches!(child.try_wait(), Ok(None));
    if alive {
        debug!(role = %handle.role, pid = handle.pid, "killing worker");
        if let Err(e) = child.kill() {
            warn!(role = %handle.role, pid = handle.pid, error = %e, "failed to kill worker");
        }
    }
    if let Err(e) = child.wait() {
        warn!(role = %handle.role, pid = handle.pid, error = %e, "failed to reap worker");
    }
    alive
}
