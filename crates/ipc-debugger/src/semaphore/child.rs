//! Lock contender worker

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use raw_sync::Timeout;
use shared_memory::ShmemConf;
use tracing::debug;
use uuid::Uuid;

use crate::channel::EventSender;
use crate::semaphore::{lock_at, LockContenderInit, LockEvent};
use crate::worker::read_init;
use crate::{get_system_time_millis, ChildProcess};

/// Worker that acquires the shared lock, holds it for a while, then releases it
#[derive(Debug)]
pub struct LockContenderChild {
    /// UUID that should uniquely identify this process
    uuid: Uuid,
}

impl Default for LockContenderChild {
    fn default() -> Self {
        Self::new()
    }
}

impl LockContenderChild {
    /// Create a new [`LockContenderChild`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            uuid: Uuid::now_v7(),
        }
    }
}

/// Current time in milliseconds since the UNIX epoch, as sent in events
fn now_ms() -> Result<u64> {
    u64::try_from(get_system_time_millis()?).context("system time does not fit in u64")
}

impl ChildProcess for LockContenderChild {
    fn id(&self) -> String {
        self.uuid.to_string()
    }

    fn run(self) -> Result<()> {
        let LockContenderInit {
            holder,
            os_id,
            event_server_name,
            lock_timeout_ms,
            hold_ms,
        } = read_init()?;
        let pid = std::process::id();
        let events = EventSender::<LockEvent>::connect(&event_server_name)?;

        let shmem = ShmemConf::new()
            .os_id(&os_id)
            .open()
            .map_err(|e| anyhow!("failed to open shared memory with OS ID [{os_id}]: {e}"))?;
        // SAFETY: the parent sized the segment for the lock, and `shmem` outlives `lock`
        let lock = unsafe { lock_at(shmem.as_ptr(), false)? };

        debug!(holder, child_id = self.id(), lock_timeout_ms, "waiting for lock");
        let lock_timeout = Duration::from_millis(lock_timeout_ms);
        let started = Instant::now();
        let guard = match lock.try_lock(Timeout::Val(lock_timeout)) {
            Ok(guard) => guard,
            Err(e) => {
                let timed_out = started.elapsed() >= lock_timeout;
                events.send(LockEvent::Failed {
                    holder: holder.clone(),
                    reason: e.to_string(),
                    timed_out,
                })?;
                return Err(anyhow!("[{holder}] failed to acquire lock: {e}"));
            }
        };

        // SAFETY: the guard points at the parent-initialized u64 counter, and we hold the lock
        let counter = unsafe { &mut *(*guard).cast::<u64>() };

        *counter += 1;
        events.send(LockEvent::Acquired {
            holder: holder.clone(),
            pid,
            seq: *counter,
            at_ms: now_ms()?,
        })?;

        std::thread::sleep(Duration::from_millis(hold_ms));

        *counter += 1;
        events.send(LockEvent::Releasing {
            holder: holder.clone(),
            pid,
            seq: *counter,
            at_ms: now_ms()?,
        })?;

        drop(guard);
        debug!(holder, "released lock");
        Ok(())
    }
}
