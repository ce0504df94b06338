//! Parent-side mutual exclusion demo

use anyhow::{anyhow, Context as _};
use tracing::{debug, warn};

use crate::channel::EventChannel;
use crate::config::millis;
use crate::registry::WorkerProcess;
use crate::semaphore::{
    lock_at, LockContenderInit, LockEvent, CONTENDERS, LOCK_DATA_OFFSET, LOCK_REGION_SIZE_BYTES,
};
use crate::shmem::{unique_segment_name, unlink_segment, SharedSegment};
use crate::sink::{ResultSink, Tag};
use crate::{DemoError, HarnessConfig, ProcessRegistry, WorkerRole};

/// What the contenders reported
#[derive(Debug)]
pub struct LockContention {
    /// Events from every contender, in lock order
    pub events: Vec<LockEvent>,
    /// First failure observed, if any
    pub failure: Option<DemoError>,
}

/// Run the mutual exclusion demo, reporting to `sink` once both contenders are joined
pub fn run_mutex_demo(config: &HarnessConfig, registry: &ProcessRegistry, sink: &dyn ResultSink) {
    let LockContention { events, failure } = match contend_for_lock(config, registry) {
        Ok(contention) => contention,
        Err(e) => LockContention {
            events: Vec::new(),
            failure: Some(e),
        },
    };

    for event in events.iter().filter(|e| !matches!(e, LockEvent::Failed { .. })) {
        sink.report(Tag::Semaphore, event.describe());
    }
    if let Some(e) = failure {
        warn!(error = %e, "mutual exclusion demo failed");
        sink.append(e.to_line(Tag::Semaphore));
    }
}

/// Have every contender in [`CONTENDERS`] acquire, hold and release the shared lock
///
/// Returns once every contender has been joined (or terminated).
pub fn contend_for_lock(
    config: &HarnessConfig,
    registry: &ProcessRegistry,
) -> Result<LockContention, DemoError> {
    let os_id = unique_segment_name("lock");
    let cleanup_id = {
        let os_id = os_id.clone();
        registry.register_cleanup(format!("lock segment [{os_id}]"), move || {
            unlink_segment(&os_id)
        })
    };
    let contention = contend_in_segment(config, registry, &os_id);
    registry.release_cleanup(cleanup_id);
    contention
}

/// Body of [`contend_for_lock`], with the segment name already reserved
fn contend_in_segment(
    config: &HarnessConfig,
    registry: &ProcessRegistry,
    os_id: &str,
) -> Result<LockContention, DemoError> {
    let segment = SharedSegment::create(os_id, LOCK_REGION_SIZE_BYTES)?;
    // SAFETY: the segment is LOCK_REGION_SIZE_BYTES long, and outlives the lock (dropped below)
    let lock = unsafe { lock_at(segment.as_ptr(), true)? };
    {
        let guard = lock
            .lock()
            .map_err(|e| anyhow!("failed to take lock for initialization: {e}"))?;
        // SAFETY: the guard points at LOCK_DATA_OFFSET, which is 8-byte aligned in a page-aligned mapping
        unsafe { (*guard).cast::<u64>().write(0) };
    }
    debug!(os_id, offset = LOCK_DATA_OFFSET, "initialized process-shared lock");

    let mut contenders: Vec<(WorkerProcess, EventChannel<LockEvent>)> = Vec::new();
    let mut failure = None;
    for holder in CONTENDERS {
        let spawned = (|| {
            let channel = EventChannel::<LockEvent>::new(format!("lock events from {holder}"))?;
            let init = LockContenderInit {
                holder: holder.to_string(),
                os_id: os_id.to_string(),
                event_server_name: channel.server_name().to_string(),
                lock_timeout_ms: millis(config.lock_timeout),
                hold_ms: millis(config.lock_hold),
            };
            let worker = registry
                .spawn(WorkerRole::LockContender, &init)
                .with_context(|| format!("failed to spawn contender [{holder}]"))?;
            Ok::<_, anyhow::Error>((worker, channel))
        })();
        match spawned {
            Ok(contender) => contenders.push(contender),
            Err(e) => {
                failure = Some(DemoError::from(e));
                break;
            }
        }
    }

    // A single wait may span the other contender's hold on the lock
    let wait = config.lock_timeout + config.lock_hold + config.recv_timeout;
    let mut events = Vec::new();
    for (worker, channel) in &mut contenders {
        match channel.drain_from(registry, worker, wait) {
            Ok(received) => events.extend(received),
            Err(e) => {
                registry.terminate(worker);
                failure.get_or_insert(e);
            }
        }
    }
    for (worker, _) in &contenders {
        match registry.join_or_terminate(worker, config.join_timeout) {
            Ok(status) if !status.success() => {
                failure.get_or_insert(DemoError::WorkerCrashed {
                    role: worker.role(),
                    status: status.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    // Every contender is gone, release the lock and then the segment
    drop(lock);
    drop(segment);

    events.sort_by_key(LockEvent::seq);
    let reported = events.iter().find_map(|event| match event {
        LockEvent::Failed {
            holder,
            reason,
            timed_out,
        } => Some(if *timed_out {
            DemoError::timeout(format!("{holder} to acquire the lock"), config.lock_timeout)
        } else {
            anyhow!("{holder} failed: {reason}").into()
        }),
        _ => None,
    });

    Ok(LockContention {
        events,
        failure: reported.or(failure),
    })
}
