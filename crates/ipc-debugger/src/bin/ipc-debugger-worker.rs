use anyhow::{Context as _, Result};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use ipc_debugger::worker::run_role;
use ipc_debugger::WorkerRole;

fn main() -> Result<()> {
    // STDOUT may be the pipe back to the parent, so logs go to STDERR
    tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to build tracing")?;

    let role: WorkerRole = std::env::args()
        .nth(1)
        .context("missing worker role argument")?
        .parse()?;

    run_role(role)
}
