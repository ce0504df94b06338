mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use ipc_debugger::{
    DemoKind, HarnessConfig, Orchestrator, OrchestratorError, OrchestratorState, Session, Tag,
};

use common::{fake_worker, tags, test_config, wait_until};

#[test]
fn a_full_run_reports_every_demo_in_order() {
    let downstream = Arc::new(Session::new());
    let orchestrator = Orchestrator::with_sink(test_config(), downstream.clone());

    assert_eq!(orchestrator.run(), Ok(OrchestratorState::Completed));

    let expected = vec![
        Tag::Debugger,
        Tag::Pipe,
        Tag::Shm,
        Tag::Semaphore,
        Tag::Semaphore,
        Tag::Semaphore,
        Tag::Semaphore,
        Tag::Socket,
        Tag::Debugger,
    ];
    assert_eq!(tags(orchestrator.session()), expected);
    assert_eq!(tags(&downstream), expected);

    let lines = orchestrator.session().lines();
    assert_eq!(
        lines[0].text(),
        format!("---- IPC Debugger (PID: {}) ----", std::process::id())
    );
    assert_eq!(
        lines[1].text(),
        "Received: Hello from child process through pipe"
    );
    assert!(lines[2].text().starts_with("Written: Shared Memory Data (PID: "));
    assert!(lines[7].text().starts_with("Received: Hello from socket client! (PID: "));
    assert_eq!(lines[8].text(), "IPC Monitoring Completed!");
    assert_eq!(orchestrator.registry().alive_count(), 0);
}

#[test]
fn runs_can_repeat() {
    let orchestrator = Orchestrator::new(test_config());
    for _ in 0..2 {
        assert_eq!(orchestrator.run(), Ok(OrchestratorState::Completed));
        assert!(orchestrator.session().lines().iter().all(|l| {
            !l.text().starts_with("FAILED") && !l.text().starts_with("TIMEOUT")
        }));
    }
}

#[test]
fn stop_mid_run_leaves_one_stopped_line_last_and_no_workers() {
    let mut config = test_config();
    // Keep the mutual exclusion demo busy long enough to stop it
    config.lock_hold = Duration::from_secs(3);
    let orchestrator = Arc::new(Orchestrator::new(config));

    let running = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.run())
    };
    wait_until(Duration::from_secs(20), || {
        tags(orchestrator.session()).contains(&Tag::Shm)
    });

    orchestrator.stop().unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(orchestrator.registry().alive_count(), 0);

    assert_eq!(running.join().unwrap(), Ok(OrchestratorState::Stopped));

    let tags = tags(orchestrator.session());
    assert_eq!(tags.iter().filter(|t| **t == Tag::Stopped).count(), 1);
    assert_eq!(tags.last(), Some(&Tag::Stopped));
    assert!(!tags.contains(&Tag::Socket));
    assert_eq!(&tags[..3], &[Tag::Debugger, Tag::Pipe, Tag::Shm]);
    assert_eq!(orchestrator.registry().alive_count(), 0);
}

#[test]
fn stop_and_run_are_rejected_in_the_wrong_state() {
    let mut config = test_config();
    config.lock_hold = Duration::from_secs(1);
    let orchestrator = Arc::new(Orchestrator::new(config));
    assert_eq!(
        orchestrator.stop(),
        Err(OrchestratorError::NotRunning(OrchestratorState::Idle))
    );

    let running = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.run())
    };
    wait_until(Duration::from_secs(20), || {
        orchestrator.state() == OrchestratorState::Running
    });
    assert_eq!(orchestrator.run(), Err(OrchestratorError::AlreadyRunning));

    assert_eq!(running.join().unwrap(), Ok(OrchestratorState::Completed));
    assert_eq!(
        orchestrator.stop(),
        Err(OrchestratorError::NotRunning(OrchestratorState::Completed))
    );
}

#[test]
fn clear_empties_the_session_in_every_state() {
    let mut config = test_config();
    // Long enough that the mutual exclusion demo is still in flight when we clear
    config.lock_hold = Duration::from_secs(2);
    let orchestrator = Arc::new(Orchestrator::new(config));

    orchestrator.clear();
    assert!(orchestrator.session().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);

    orchestrator.run_demo(DemoKind::SharedMemory).unwrap();
    orchestrator.clear();
    assert!(orchestrator.session().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::Completed);

    let running = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.run())
    };
    wait_until(Duration::from_secs(20), || {
        tags(orchestrator.session()).contains(&Tag::Shm)
    });
    // Semaphore lines only arrive once both contenders are joined, seconds from now
    orchestrator.clear();
    assert!(orchestrator.session().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::Running);

    orchestrator.stop().unwrap();
    running.join().unwrap().unwrap();
    orchestrator.clear();
    assert!(orchestrator.session().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
}

#[test]
fn a_stopped_run_must_unwind_before_the_next_run_starts() {
    let dir = tempfile::tempdir().unwrap();
    // The backgrounded sleep keeps the pipe open after the worker itself is killed, so the
    // stopped run keeps reading until its receive timeout
    let mut config = HarnessConfig::new(fake_worker(&dir, "lingering-worker", "sleep 30 &\nwait"));
    config.socket_addr = test_config().socket_addr;
    config.recv_timeout = Duration::from_secs(2);
    config.join_timeout = Duration::from_secs(1);
    config.lock_timeout = Duration::from_millis(200);
    config.connect_timeout = Duration::from_millis(200);
    config.lock_hold = Duration::from_millis(50);
    let orchestrator = Arc::new(Orchestrator::new(config));

    let first = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.run())
    };
    wait_until(Duration::from_secs(5), || {
        orchestrator.state() == OrchestratorState::Running
            && orchestrator.registry().alive_count() == 1
    });
    orchestrator.stop().unwrap();

    assert_eq!(orchestrator.run(), Err(OrchestratorError::AlreadyRunning));
    assert_eq!(
        orchestrator.run_demo(DemoKind::Pipe),
        Err(OrchestratorError::AlreadyRunning)
    );
    assert_eq!(first.join().unwrap(), Ok(OrchestratorState::Stopped));

    let stopped = tags(orchestrator.session());
    assert_eq!(stopped, vec![Tag::Debugger, Tag::Stopped]);

    assert_eq!(orchestrator.run(), Ok(OrchestratorState::Completed));
    let tags = tags(orchestrator.session());
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
}

#[test]
fn single_demos_share_the_session_and_registry() {
    let orchestrator = Orchestrator::new(test_config());

    assert_eq!(
        orchestrator.run_demo(DemoKind::Socket),
        Ok(OrchestratorState::Completed)
    );
    assert_eq!(
        orchestrator.run_demo(DemoKind::Semaphore),
        Ok(OrchestratorState::Completed)
    );

    let lines = orchestrator.session().lines();
    assert_eq!(
        tags(orchestrator.session()),
        vec![
            Tag::Socket,
            Tag::Semaphore,
            Tag::Semaphore,
            Tag::Semaphore,
            Tag::Semaphore,
        ]
    );
    assert!(lines[0].text().starts_with("Received: Hello from socket client! (PID: "));
    assert_eq!(orchestrator.registry().alive_count(), 0);
}

#[test]
fn stopping_a_single_demo_reports_stopped_last() {
    let mut config = test_config();
    config.lock_hold = Duration::from_secs(3);
    let orchestrator = Arc::new(Orchestrator::new(config));

    let running = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.run_demo(DemoKind::Semaphore))
    };
    wait_until(Duration::from_secs(10), || {
        orchestrator.registry().alive_count() == 2
    });
    assert_eq!(orchestrator.stop(), Ok(2));
    assert_eq!(running.join().unwrap(), Ok(OrchestratorState::Stopped));
    assert_eq!(tags(orchestrator.session()), vec![Tag::Stopped]);
    assert_eq!(orchestrator.registry().alive_count(), 0);
}
