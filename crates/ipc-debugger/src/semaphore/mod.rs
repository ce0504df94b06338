/*!
Mutual exclusion demo: two worker processes contend for one binary lock.

The lock is a process-shared mutex built with [`raw_sync`][0] inside a [`shared_memory`][1]
segment that the parent creates. It guards a `u64` sequence counter: a contender bumps the
counter when it acquires and again right before it releases, so every [`LockEvent`] carries its
position in lock order. The parent appends events sorted by that sequence, and at most one
contender is ever inside its critical section.

[0]: <https://crates.io/crates/raw_sync>
[1]: <https://crates.io/crates/shared_memory>
**/

use anyhow::{anyhow, Result};
use raw_sync::locks::{LockImpl, LockInit as _, Mutex};
use serde::{Deserialize, Serialize};

pub mod child;
pub mod parent;

pub use child::LockContenderChild;
pub use parent::{contend_for_lock, run_mutex_demo, LockContention};

/// Names of the contending workers
pub const CONTENDERS: [&str; 2] = ["Process A", "Process B"];

/// Size of the segment holding the lock and its counter
const LOCK_REGION_SIZE_BYTES: usize = 4096;

/// Offset of the protected counter within the segment
///
/// NOTE: the lock itself lives at offset 0, and must fit before this offset
const LOCK_DATA_OFFSET: usize = 2048;

/// Init message sent to a lock contender over STDIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContenderInit {
    /// Human-friendly name of the contender (e.g. "Process A")
    pub holder: String,
    /// OS ID of the segment holding the lock
    pub os_id: String,
    /// Name of the IPC server to report [`LockEvent`]s to
    pub event_server_name: String,
    /// How long to wait for the lock before giving up
    pub lock_timeout_ms: u64,
    /// How long to hold the lock once acquired
    pub hold_ms: u64,
}

/// Event reported by a contender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockEvent {
    /// The contender entered its critical section
    Acquired {
        /// Name of the contender
        holder: String,
        /// OS PID of the contender
        pid: u32,
        /// Position in lock order
        seq: u64,
        /// Time of the event, in milliseconds since the UNIX epoch
        at_ms: u64,
    },
    /// The contender is about to leave its critical section
    Releasing {
        /// Name of the contender
        holder: String,
        /// OS PID of the contender
        pid: u32,
        /// Position in lock order
        seq: u64,
        /// Time of the event, in milliseconds since the UNIX epoch
        at_ms: u64,
    },
    /// The contender could not complete its critical section
    Failed {
        /// Name of the contender
        holder: String,
        /// Why it failed
        reason: String,
        /// Whether the failure was the lock wait running out
        timed_out: bool,
    },
}

impl LockEvent {
    /// Name of the contender that reported the event
    #[must_use]
    pub fn holder(&self) -> &str {
        match self {
            Self::Acquired { holder, .. }
            | Self::Releasing { holder, .. }
            | Self::Failed { holder, .. } => holder,
        }
    }

    /// Position of the event in lock order (failures sort last)
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::Acquired { seq, .. } | Self::Releasing { seq, .. } => *seq,
            Self::Failed { .. } => u64::MAX,
        }
    }

    /// Text of the result line for this event
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Acquired { holder, pid, .. } => format!("{holder} acquired lock (PID: {pid})"),
            Self::Releasing { holder, pid, .. } => format!("{holder} releasing lock (PID: {pid})"),
            Self::Failed { holder, reason, .. } => format!("{holder} failed: {reason}"),
        }
    }
}

/// Build the process-shared lock at the start of `base`, or attach to the existing one
///
/// # Safety
///
/// `base` must point to a mapping of at least [`LOCK_REGION_SIZE_BYTES`] bytes that outlives
/// the returned lock.
unsafe fn lock_at(base: *mut u8, create: bool) -> Result<Box<dyn LockImpl>> {
    let data = base.add(LOCK_DATA_OFFSET);
    let built = if create {
        Mutex::new(base, data)
    } else {
        Mutex::from_existing(base, data)
    };
    let (lock, lock_size) = built.map_err(|e| anyhow!("failed to build process-shared lock: {e}"))?;
    if lock_size > LOCK_DATA_OFFSET {
        return Err(anyhow!(
            "lock of size [{lock_size}] overlaps protected data at offset [{LOCK_DATA_OFFSET}]"
        ));
    }
    Ok(lock)
}
