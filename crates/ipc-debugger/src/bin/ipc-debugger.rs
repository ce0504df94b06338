use std::io::{stdin, BufRead as _};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context as _, Result};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use ipc_debugger::{DemoKind, HarnessConfig, Orchestrator, OrchestratorError, WriterSink};

const USAGE: &str = "commands: run | pipe | shm | semaphore | socket | stop | clear | quit";

fn main() -> Result<()> {
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to build tracing")?;

    let config = HarnessConfig::from_env().context("failed to load configuration")?;
    info!(worker_bin = %config.worker_bin.display(), socket_addr = %config.socket_addr, "loaded configuration");

    let orchestrator = Arc::new(Orchestrator::with_sink(
        config,
        Arc::new(WriterSink::stdout()),
    ));
    let mut run_thread: Option<JoinHandle<()>> = None;

    eprintln!("{USAGE}");
    for line in stdin().lock().lines() {
        let line = line.context("failed to read command from STDIN")?;
        match line.trim() {
            "" => {}
            "run" => start_run(&orchestrator, &mut run_thread, None)?,
            "stop" => match orchestrator.stop() {
                Ok(killed) => info!(killed, "stopped run"),
                Err(e) => eprintln!("{e}"),
            },
            "clear" => orchestrator.clear(),
            "quit" => {
                if orchestrator.stop().is_ok() {
                    info!("stopped run before quitting");
                }
                break;
            }
            other => match other.parse::<DemoKind>() {
                Ok(demo) => start_run(&orchestrator, &mut run_thread, Some(demo))?,
                Err(_) => eprintln!("unknown command [{other}], {USAGE}"),
            },
        }
    }

    // Let a run started before EOF (or quit) finish on its own
    if let Some(running) = run_thread.take() {
        join_run(running)?;
    }
    Ok(())
}

/// Start every demo (or only `demo`) on a background thread, unless a run is still going
fn start_run(
    orchestrator: &Arc<Orchestrator>,
    run_thread: &mut Option<JoinHandle<()>>,
    demo: Option<DemoKind>,
) -> Result<()> {
    if run_thread.as_ref().is_some_and(|t| !t.is_finished()) {
        eprintln!("{}", OrchestratorError::AlreadyRunning);
        return Ok(());
    }
    if let Some(finished) = run_thread.take() {
        join_run(finished)?;
    }

    let orchestrator = orchestrator.clone();
    let handle = std::thread::Builder::new()
        .name("ipc-debugger-run".into())
        .spawn(move || {
            let outcome = match demo {
                Some(demo) => orchestrator.run_demo(demo),
                None => orchestrator.run(),
            };
            match outcome {
                Ok(state) => info!(?state, ?demo, "run ended"),
                Err(e) => warn!(error = %e, "run refused"),
            }
        })
        .context("failed to spawn run thread")?;
    *run_thread = Some(handle);
    Ok(())
}

/// Wait for the run thread to exit
fn join_run(handle: JoinHandle<()>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("failed to join run thread"))
}
