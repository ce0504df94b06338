//! Configuration for a harness run.
//!
//! The core only ever takes a [`HarnessConfig`]. Reading it from the environment is the
//! launcher's business, via [`HarnessConfig::from_env`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

/// ENV variable that points at the worker binary
pub const ENV_VAR_WORKER_BIN_PATH: &str = "IPC_DEBUGGER_WORKER_BIN_PATH";

/// ENV variable for the host the socket server binds
pub const ENV_VAR_SOCKET_HOST: &str = "IPC_DEBUGGER_SOCKET_HOST";

/// ENV variable for the port the socket server binds
pub const ENV_VAR_SOCKET_PORT: &str = "IPC_DEBUGGER_SOCKET_PORT";

/// ENV variable for the receive timeout (milliseconds)
pub const ENV_VAR_RECV_TIMEOUT_MS: &str = "IPC_DEBUGGER_RECV_TIMEOUT_MS";

/// ENV variable for the join timeout (milliseconds)
pub const ENV_VAR_JOIN_TIMEOUT_MS: &str = "IPC_DEBUGGER_JOIN_TIMEOUT_MS";

/// ENV variable for the lock acquisition timeout (milliseconds)
pub const ENV_VAR_LOCK_TIMEOUT_MS: &str = "IPC_DEBUGGER_LOCK_TIMEOUT_MS";

/// ENV variable for the socket connect timeout (milliseconds)
pub const ENV_VAR_CONNECT_TIMEOUT_MS: &str = "IPC_DEBUGGER_CONNECT_TIMEOUT_MS";

/// ENV variable for how long a contender holds the lock (milliseconds)
pub const ENV_VAR_LOCK_HOLD_MS: &str = "IPC_DEBUGGER_LOCK_HOLD_MS";

/// File name of the worker binary, expected next to the launcher
pub const WORKER_BIN_NAME: &str = "ipc-debugger-worker";

/// Default loopback port for the socket demo
pub const DEFAULT_SOCKET_PORT: u16 = 65432;

/// Default bound on any single receive
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for a worker to exit
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for the lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the client reaching the server
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a contender spends in its critical section
const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(2);

/// Settings shared by every demo of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Path to the `ipc-debugger-worker` binary
    pub worker_bin: PathBuf,

    /// Address the socket server binds and the client connects to
    pub socket_addr: SocketAddr,

    /// Bound on a single receive (pipe read, result channel message)
    pub recv_timeout: Duration,

    /// Bound on waiting for a worker to exit
    pub join_timeout: Duration,

    /// Bound on a contender waiting for the lock
    pub lock_timeout: Duration,

    /// Bound on the socket client reaching the server
    pub connect_timeout: Duration,

    /// How long each contender holds the lock
    pub lock_hold: Duration,
}

impl HarnessConfig {
    /// Create a [`HarnessConfig`] with default settings for the given worker binary
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            socket_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SOCKET_PORT),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            lock_hold: DEFAULT_LOCK_HOLD,
        }
    }

    /// Build a [`HarnessConfig`] from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a [`HarnessConfig`] from a set of `(key, value)` pairs
    ///
    /// Missing values fall back to defaults, the worker binary defaults to
    /// [`WORKER_BIN_NAME`] next to the current executable.
    pub fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        let vars: std::collections::HashMap<String, String> = vars.collect();

        let worker_bin = match vars.get(ENV_VAR_WORKER_BIN_PATH) {
            Some(v) => PathBuf::from(v),
            None => std::env::current_exe()
                .context("failed to resolve current executable")?
                .with_file_name(WORKER_BIN_NAME),
        };
        ensure_worker_bin(&worker_bin)?;

        let mut config = Self::new(worker_bin);
        if let Some(host) = vars.get(ENV_VAR_SOCKET_HOST) {
            config.socket_addr.set_ip(
                host.parse()
                    .with_context(|| format!("invalid {ENV_VAR_SOCKET_HOST} value [{host}]"))?,
            );
        }
        if let Some(port) = vars.get(ENV_VAR_SOCKET_PORT) {
            config.socket_addr.set_port(
                port.parse()
                    .with_context(|| format!("invalid {ENV_VAR_SOCKET_PORT} value [{port}]"))?,
            );
        }

        for (key, slot) in [
            (ENV_VAR_RECV_TIMEOUT_MS, &mut config.recv_timeout),
            (ENV_VAR_JOIN_TIMEOUT_MS, &mut config.join_timeout),
            (ENV_VAR_LOCK_TIMEOUT_MS, &mut config.lock_timeout),
            (ENV_VAR_CONNECT_TIMEOUT_MS, &mut config.connect_timeout),
            (ENV_VAR_LOCK_HOLD_MS, &mut config.lock_hold),
        ] {
            if let Some(v) = vars.get(key) {
                let ms = v
                    .parse::<u64>()
                    .with_context(|| format!("invalid {key} value [{v}]"))?;
                *slot = Duration::from_millis(ms);
            }
        }

        Ok(config)
    }
}

/// Convert a duration into whole milliseconds, as carried in worker init messages
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Check that the worker binary exists and is a file
fn ensure_worker_bin(bin_path: &Path) -> Result<()> {
    if !bin_path.exists() {
        bail!("missing worker binary at path [{}]", bin_path.display());
    }
    if !bin_path.metadata().is_ok_and(|m| m.is_file()) {
        bail!("invalid non-binary file at path [{}]", bin_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Build vars with a worker binary that is guaranteed to exist
    fn vars_with(extra: &[(&str, &str)]) -> (tempfile::NamedTempFile, Vec<(String, String)>) {
        let bin = tempfile::NamedTempFile::new().unwrap();
        let mut vars = vec![(
            ENV_VAR_WORKER_BIN_PATH.to_string(),
            bin.path().display().to_string(),
        )];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        (bin, vars)
    }

    #[test]
    fn defaults_apply_when_only_the_binary_is_set() {
        let (bin, vars) = vars_with(&[]);
        let config = HarnessConfig::from_vars(vars.into_iter()).unwrap();
        assert_eq!(config, HarnessConfig::new(bin.path()));
        assert_eq!(config.socket_addr.to_string(), "127.0.0.1:65432");
    }

    #[test]
    fn overrides_are_read_from_vars() {
        let (_bin, vars) = vars_with(&[
            (ENV_VAR_SOCKET_PORT, "40001"),
            (ENV_VAR_LOCK_HOLD_MS, "150"),
            (ENV_VAR_RECV_TIMEOUT_MS, "750"),
        ]);
        let config = HarnessConfig::from_vars(vars.into_iter()).unwrap();
        assert_eq!(config.socket_addr.port(), 40001);
        assert_eq!(config.lock_hold, Duration::from_millis(150));
        assert_eq!(config.recv_timeout, Duration::from_millis(750));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let (_bin, vars) = vars_with(&[(ENV_VAR_JOIN_TIMEOUT_MS, "soon")]);
        let err = HarnessConfig::from_vars(vars.into_iter()).unwrap_err();
        assert!(err.to_string().contains(ENV_VAR_JOIN_TIMEOUT_MS));
    }

    #[test]
    fn missing_worker_binary_is_rejected() {
        let vars = vec![(
            ENV_VAR_WORKER_BIN_PATH.to_string(),
            "/definitely/not/here/ipc-debugger-worker".to_string(),
        )];
        assert!(HarnessConfig::from_vars(vars.into_iter()).is_err());
    }
}
