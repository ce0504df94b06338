mod common;

use std::io::Write as _;
use std::process::{Command, Stdio};

use pretty_assertions::assert_eq;

use ipc_debugger::config::{ENV_VAR_SOCKET_PORT, ENV_VAR_WORKER_BIN_PATH};

use common::free_port;

/// Feed `commands` to the launcher, close its STDIN, and return the result lines it printed
fn launch(commands: &str) -> Vec<String> {
    let mut launcher = Command::new(env!("CARGO_BIN_EXE_ipc-debugger"))
        .env(ENV_VAR_WORKER_BIN_PATH, env!("CARGO_BIN_EXE_ipc-debugger-worker"))
        .env(ENV_VAR_SOCKET_PORT, free_port().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    launcher
        .stdin
        .take()
        .unwrap()
        .write_all(commands.as_bytes())
        .unwrap();

    let output = launcher.wait_with_output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn individual_demo_commands_run_one_demo_each() {
    let lines = launch("shm\n");
    assert_eq!(lines.len(), 1, "{lines:?}");
    assert!(
        lines[0].contains("[SHM] Written: Shared Memory Data (PID: "),
        "{}",
        lines[0]
    );
}

#[test]
fn unknown_commands_print_nothing_to_the_session() {
    let lines = launch("sockets\nclear\n");
    assert!(lines.is_empty(), "{lines:?}");
}
