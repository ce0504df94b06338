/*!
Worker-to-parent result channels over [`ipc-channel`][0].

Workers run in their own address space, so they never touch the session directly. Instead the
parent creates an [`EventChannel`], hands its one-shot server name to the worker in the init
message, and the worker connects an [`EventSender`] to report events back.

Every wait on the parent side is bounded: the one-shot `accept()` runs on a helper thread whose
result is awaited with a timeout, and later messages use `try_recv_timeout`.

[0]: <https://crates.io/crates/ipc-channel>
*/

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use ipc_channel::ipc::{IpcError, IpcOneShotServer, IpcReceiver, IpcSender, TryRecvError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::DemoError;
use crate::registry::{ProcessRegistry, WorkerProcess};

/// Longest single wait in [`EventChannel::drain_from`] before checking on the worker
const WORKER_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of the one-shot accept, as handed back from the accept thread
type Accepted<E> = std::result::Result<(IpcReceiver<E>, E), String>;

/// Connection progress of an [`EventChannel`]
enum ChannelState<E> {
    /// Waiting for the worker to connect and send its first event
    Accepting(mpsc::Receiver<Accepted<E>>),
    /// Worker connected, further events arrive on the receiver
    Connected(IpcReceiver<E>),
    /// Worker disconnected (or accepting failed)
    Closed,
}

/// Parent side of a worker result channel
pub struct EventChannel<E> {
    /// What the channel carries, used in timeout messages
    label: String,

    /// Name of the one-shot server that workers connect to
    server_name: String,

    /// Connection progress
    state: ChannelState<E>,
}

impl<E> std::fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ChannelState::Accepting(_) => "accepting",
            ChannelState::Connected(_) => "connected",
            ChannelState::Closed => "closed",
        };
        f.debug_struct("EventChannel")
            .field("label", &self.label)
            .field("server_name", &self.server_name)
            .field("state", &state)
            .finish()
    }
}

impl<E> EventChannel<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a new [`EventChannel`] and start accepting a worker connection
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        debug!(label, "creating server for IPC oneshot setup (worker->parent)...");
        let (server, server_name) =
            IpcOneShotServer::<E>::new().context("failed to build IPC server")?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("accept-{label}"))
            .spawn(move || {
                let accepted = server.accept().map_err(|e| e.to_string());
                // The channel may have been dropped already, nobody is left to tell
                let _ = tx.send(accepted);
            })
            .context("failed to spawn accept thread")?;

        Ok(Self {
            label,
            server_name,
            state: ChannelState::Accepting(rx),
        })
    }

    /// Name of the IPC server that the worker should connect to
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Receive the next event, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` once the worker has disconnected.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<E>, DemoError> {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Accepting(rx) => match rx.recv_timeout(timeout) {
                Ok(Ok((receiver, first))) => {
                    debug!(label = self.label, "worker connected to result channel");
                    self.state = ChannelState::Connected(receiver);
                    Ok(Some(first))
                }
                Ok(Err(e)) => Err(anyhow!("failed to accept worker on [{}]: {e}", self.label).into()),
                Err(RecvTimeoutError::Timeout) => {
                    self.state = ChannelState::Accepting(rx);
                    Err(DemoError::timeout(format!("first {}", self.label), timeout))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Err(anyhow!("accept thread for [{}] exited", self.label).into())
                }
            },
            ChannelState::Connected(receiver) => match receiver.try_recv_timeout(timeout) {
                Ok(event) => {
                    self.state = ChannelState::Connected(receiver);
                    Ok(Some(event))
                }
                Err(TryRecvError::Empty) => {
                    self.state = ChannelState::Connected(receiver);
                    Err(DemoError::timeout(self.label.clone(), timeout))
                }
                Err(TryRecvError::IpcError(IpcError::Disconnected)) => {
                    debug!(label = self.label, "worker disconnected from result channel");
                    Ok(None)
                }
                Err(TryRecvError::IpcError(e)) => {
                    Err(anyhow!("failed to receive on [{}]: {e:?}", self.label).into())
                }
            },
            ChannelState::Closed => Ok(None),
        }
    }

    /// Receive every remaining event until the worker disconnects
    ///
    /// Each wait is bounded by `timeout`, and the drain gives up as soon as `registry` stops
    /// tracking `worker` (a worker killed before connecting would never disconnect).
    pub fn drain_from(
        &mut self,
        registry: &ProcessRegistry,
        worker: &WorkerProcess,
        timeout: Duration,
    ) -> Result<Vec<E>, DemoError> {
        let mut events = Vec::new();
        let mut deadline = Instant::now() + timeout;
        loop {
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(WORKER_CHECK_INTERVAL);
            match self.recv_timeout(slice) {
                Ok(Some(event)) => {
                    events.push(event);
                    deadline = Instant::now() + timeout;
                }
                Ok(None) => return Ok(events),
                Err(e) if e.is_timeout() => {
                    if !registry.is_tracked(worker) {
                        return Err(DemoError::Terminated {
                            role: worker.role(),
                        });
                    }
                    if Instant::now() >= deadline {
                        return Err(DemoError::timeout(self.label.clone(), timeout));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<E> Drop for EventChannel<E> {
    fn drop(&mut self) {
        if let ChannelState::Accepting(_) = self.state {
            // Wake the accept thread so it does not outlive the channel
            if let Ok(sender) = IpcSender::<Vec<u8>>::connect(self.server_name.clone()) {
                let _ = sender.send(Vec::new());
            }
        }
    }
}

/// Worker side of a result channel
#[derive(Debug)]
pub struct EventSender<E> {
    /// Connected IPC sender
    sender: IpcSender<E>,
}

impl<E> EventSender<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Connect to the parent's [`EventChannel`] by server name
    pub fn connect(server_name: &str) -> Result<Self> {
        let sender = IpcSender::<E>::connect(server_name.to_string())
            .with_context(|| format!("failed to connect to parent IPC server [{server_name}]"))?;
        Ok(Self { sender })
    }

    /// Send an event to the parent
    pub fn send(&self, event: E) -> Result<()> {
        self.sender
            .send(event)
            .context("failed to send event to parent")
    }
}
