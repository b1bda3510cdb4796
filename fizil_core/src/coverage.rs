//! Shared-memory coverage channel between the fuzzer and the instrumented
//! target.
//!
//! A region is a named, memory-mapped file under the system temp
//! directory. The instrumented target resolves the name it finds in
//! [`SHARED_MEMORY_ENV_VAR`] to the same path and writes edge hits into
//! the mapping while it runs; the fuzzer only ever snapshots the bytes and
//! hashes them. The region size is fixed by the instrumentation contract
//! and opaque here.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Environment variable the instrumented target reads to locate its
/// coverage region.
pub const SHARED_MEMORY_ENV_VAR: &str = "FIZIL_SHARED_MEMORY";

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("failed to create coverage region '{name}': {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },
    #[error("failed to map coverage region '{name}': {source}")]
    Map {
        name: String,
        source: std::io::Error,
    },
}

/// One coverage region, exclusively owned by its creator. Dropping the map
/// releases the mapping and removes the backing file.
pub struct CoverageMap {
    name: String,
    path: PathBuf,
    map: MmapMut,
}

impl CoverageMap {
    /// Returns a region name no other region of this process will use.
    pub fn unique_name() -> String {
        let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        format!("fizil-cov-{}-{}", std::process::id(), id)
    }

    /// Where a region by this name lives on disk. Instrumented targets
    /// resolve published names the same way.
    pub fn backing_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    /// Allocates and zero-fills a region of `size` bytes.
    pub fn create(name: &str, size: usize) -> Result<Self, CoverageError> {
        let path = Self::backing_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| CoverageError::Create {
                name: name.to_string(),
                source,
            })?;
        file.set_len(size as u64)
            .map_err(|source| CoverageError::Create {
                name: name.to_string(),
                source,
            })?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| CoverageError::Map {
            name: name.to_string(),
            source,
        })?;
        map.fill(0);
        Ok(Self {
            name: name.to_string(),
            path,
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Zeroes the region in place, ready for the next execution.
    pub fn clear(&mut self) {
        self.map.fill(0);
    }

    /// Copies the current contents out of the mapping.
    pub fn snapshot(&self) -> Vec<u8> {
        self.map.to_vec()
    }
}

impl Drop for CoverageMap {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch the process-global region environment
    /// variable.
    pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
