//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ipc_debugger::{HarnessConfig, ResultLine, Session, Tag};

/// Config that spawns the real worker binary, on a port nobody else is using
pub fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::new(env!("CARGO_BIN_EXE_ipc-debugger-worker"));
    config.socket_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, free_port()));
    config.recv_timeout = Duration::from_secs(5);
    config.join_timeout = Duration::from_secs(5);
    config.lock_timeout = Duration::from_secs(5);
    config.connect_timeout = Duration::from_secs(5);
    config.lock_hold = Duration::from_millis(100);
    config
}

/// A loopback port that was free a moment ago
pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .expect("failed to find a free port")
        .port()
}

/// Write an executable shell script that stands in for the worker binary
pub fn fake_worker(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write fake worker");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to make fake worker executable");
    path
}

/// Tags of every line in the session, in order
pub fn tags(session: &Session) -> Vec<Tag> {
    session.lines().iter().map(ResultLine::tag).collect()
}

/// Poll until `done` holds, panicking after `limit`
pub fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
