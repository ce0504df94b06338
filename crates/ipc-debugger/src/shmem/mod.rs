/*!
Shared memory demo, using OS-managed named segments via [`shared_memory`][0].

A segment sized exactly to [`SHM_PAYLOAD`] is created under a name unique to this invocation,
written, read back, then detached and unlinked. The release happens in [`SharedSegment`]'s
`Drop`, so it runs on every exit path. In case a stop fires mid-demo, the unlink is also
registered as a cleanup with the [`ProcessRegistry`].

This demo exercises a same-process round trip; no second process attaches to the segment.

[0]: <https://crates.io/crates/shared_memory>
**/

use anyhow::{anyhow, ensure, Context as _, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sink::{ResultSink, Tag};
use crate::{DemoError, ProcessRegistry};

/// Bytes written into (and read back from) the segment
pub const SHM_PAYLOAD: &[u8] = b"Shared Memory Data";

/// Prefix of every segment name created by this crate
const SEGMENT_NAME_PREFIX: &str = "ipcd";

/// A named shared memory segment owned by this process
///
/// Dropping the segment drops the owning [`Shmem`] mapping, which unmaps the region and
/// then unlinks the name (`shm_unlink`).
pub struct SharedSegment {
    /// OS-level name of the segment
    os_id: String,
    /// Mapping of the segment (owner, so it unlinks on drop)
    shmem: Shmem,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("os_id", &self.os_id)
            .field("len", &self.len())
            .finish()
    }
}

impl SharedSegment {
    /// Create a new segment of `size_bytes` under `os_id`
    ///
    /// An existing segment with the same name is reported as [`DemoError::Resource`].
    pub fn create(os_id: &str, size_bytes: usize) -> Result<Self, DemoError> {
        let shmem = ShmemConf::new()
            .size(size_bytes)
            .os_id(os_id)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists | ShmemError::LinkExists => {
                    DemoError::Resource(format!("shared memory segment [{os_id}] already exists"))
                }
                e => anyhow!("failed to create shared memory [{os_id}]: {e}").into(),
            })?;
        debug!(os_id, size_bytes, "created shared memory segment");
        Ok(Self {
            os_id: os_id.to_string(),
            shmem,
        })
    }

    /// Get the OS ID of the segment
    #[must_use]
    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    /// Size of the segment in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    /// Whether the segment has no usable bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base pointer of the mapping
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Copy `bytes` to the start of the segment
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() <= self.len(),
            "payload of len [{}] does not fit segment of len [{}]",
            bytes.len(),
            self.len()
        );
        // SAFETY: no other process attaches to this segment, and we hold it mutably
        let region = unsafe { self.shmem.as_slice_mut() };
        region[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes from the start of the segment
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        ensure!(len <= self.len(), "read of [{len}] bytes overflows segment");
        // SAFETY: see `write`
        let region = unsafe { self.shmem.as_slice() };
        Ok(region[..len].to_vec())
    }
}

/// Build a segment name unique to this process and invocation
#[must_use]
pub fn unique_segment_name(kind: &str) -> String {
    let uuid = Uuid::now_v7().simple().to_string();
    // The trailing hex digits of a v7 UUID are random, the leading ones are a timestamp
    format!(
        "/{SEGMENT_NAME_PREFIX}-{kind}-{}-{}",
        std::process::id(),
        &uuid[uuid.len() - 12..]
    )
}

/// Whether a segment with this name can currently be opened
#[must_use]
pub fn segment_exists(os_id: &str) -> bool {
    ShmemConf::new().os_id(os_id).open().is_ok()
}

/// Unlink a segment by name, if it still exists
pub fn unlink_segment(os_id: &str) {
    match ShmemConf::new().os_id(os_id).open() {
        Ok(mut shmem) => {
            shmem.set_owner(true);
            debug!(os_id, "unlinking leftover shared memory segment");
        }
        Err(e) => debug!(os_id, error = %e, "no shared memory segment left to unlink"),
    }
}

/// Outcome of a shared memory round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmRoundtrip {
    /// Name of the (now unlinked) segment
    pub os_id: String,
    /// Bytes read back from the segment
    pub read_back: Vec<u8>,
}

/// Create a segment, write [`SHM_PAYLOAD`], read it back, then release the segment
pub fn roundtrip_shared_memory(registry: &ProcessRegistry) -> Result<ShmRoundtrip, DemoError> {
    let os_id = unique_segment_name("shm");
    let cleanup_id = {
        let os_id = os_id.clone();
        registry.register_cleanup(format!("shared memory [{os_id}]"), move || {
            unlink_segment(&os_id)
        })
    };

    let read_back = (|| {
        let mut segment = SharedSegment::create(&os_id, SHM_PAYLOAD.len())?;
        segment
            .write(SHM_PAYLOAD)
            .context("failed to write payload into segment")?;
        let read_back = segment
            .read(SHM_PAYLOAD.len())
            .context("failed to read payload from segment")?;
        Ok::<_, DemoError>(read_back)
    })();
    registry.release_cleanup(cleanup_id);

    Ok(ShmRoundtrip {
        os_id,
        read_back: read_back?,
    })
}

/// Run the shared memory demo, reporting exactly one [`Tag::Shm`] line to `sink`
pub fn run_shared_memory_demo(registry: &ProcessRegistry, sink: &dyn ResultSink) {
    let outcome = roundtrip_shared_memory(registry).and_then(|ShmRoundtrip { read_back, .. }| {
        String::from_utf8(read_back)
            .context("segment contents are not valid UTF-8")
            .map_err(DemoError::from)
    });
    match outcome {
        Ok(text) => sink.report(
            Tag::Shm,
            format!("Written: {text} (PID: {})", std::process::id()),
        ),
        Err(e) => {
            warn!(error = %e, "shared memory demo failed");
            sink.append(e.to_line(Tag::Shm));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_a_segment_unlinks_its_name() {
        let os_id = unique_segment_name("test");
        let mut segment = SharedSegment::create(&os_id, SHM_PAYLOAD.len()).unwrap();
        segment.write(SHM_PAYLOAD).unwrap();
        assert!(segment_exists(&os_id));

        drop(segment);
        assert!(!segment_exists(&os_id));
    }

    #[test]
    fn taken_names_are_a_resource_error() {
        let os_id = unique_segment_name("test");
        let _first = SharedSegment::create(&os_id, 64).unwrap();
        let second = SharedSegment::create(&os_id, 64).unwrap_err();
        assert!(matches!(second, DemoError::Resource(_)), "{second:?}");
    }
}
