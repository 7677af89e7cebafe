//! Process-level resources shared by every context.
//!
//! Two things are needed once per process rather than once per context: a
//! scratch file that shutdown targets with its zero-length sentinel write,
//! and the block of zeroes used to initialize journal files. Both live in an
//! [`Environment`] that callers create once and pass by reference, so tests
//! can build their own instead of sharing hidden global state.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tempfile::NamedTempFile;

use crate::buffer::AlignedBuffer;
use crate::error::{AioError, Result};

/// Size of the shared zero block used by [`crate::file::fill_with_zeroes`].
pub const ZERO_BLOCK_LEN: usize = 1024 * 1024;

/// Shared, once-initialized engine resources.
#[derive(Debug)]
pub struct Environment {
    scratch: File,
    scratch_path: Mutex<Option<PathBuf>>,
    zero_block: Mutex<Option<AlignedBuffer>>,
}

impl Environment {
    /// Create an environment with its scratch file in the system temp dir.
    pub fn new() -> Result<Arc<Self>> {
        Self::in_dir(std::env::temp_dir())
    }

    /// Create an environment with its scratch file in `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Arc<Self>> {
        let named = tempfile::Builder::new()
            .prefix("safer-aio-sentinel-")
            .tempfile_in(dir)?;
        let (scratch, path) = Self::keep(named)?;
        crate::aio_debug!("environment", "scratch file {}", path.display());

        Ok(Arc::new(Self {
            scratch,
            scratch_path: Mutex::new(Some(path)),
            zero_block: Mutex::new(None),
        }))
    }

    fn keep(named: NamedTempFile) -> Result<(File, PathBuf)> {
        named.keep().map_err(|e| AioError::Io(e.error))
    }

    /// Process-wide default environment, created on first use.
    ///
    /// It lives in a `static` and is never dropped, so its scratch file is
    /// unlinked as soon as it is created; only the open descriptor is kept
    /// and [`scratch_path`](Self::scratch_path) returns `None`.
    pub fn shared() -> Result<Arc<Self>> {
        static SHARED: OnceLock<Arc<Environment>> = OnceLock::new();
        if let Some(env) = SHARED.get() {
            return Ok(Arc::clone(env));
        }
        let env = Self::new()?;
        env.close_scratch()?;
        Ok(Arc::clone(SHARED.get_or_init(|| env)))
    }

    /// Descriptor the shutdown sentinel writes to.
    pub fn scratch_fd(&self) -> RawFd {
        self.scratch.as_raw_fd()
    }

    /// Path of the scratch file, until [`close_scratch`](Self::close_scratch).
    pub fn scratch_path(&self) -> Option<PathBuf> {
        self.scratch_path.lock().ok().and_then(|p| p.clone())
    }

    /// Remove the scratch file from the filesystem.
    ///
    /// The descriptor stays open, so contexts can still shut down.
    pub fn close_scratch(&self) -> Result<()> {
        let path = self
            .scratch_path
            .lock()
            .map_err(|_| AioError::PoolPoisoned)?
            .take();
        if let Some(path) = path {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// The shared zero block, allocated on first use with `alignment`.
    ///
    /// The block is allocated once; later callers asking for a stricter
    /// alignment than the first one get a freshly aligned replacement.
    pub(crate) fn zero_block(&self, alignment: usize) -> Result<MutexGuard<'_, Option<AlignedBuffer>>> {
        let mut guard = self.zero_block.lock().map_err(|_| AioError::PoolPoisoned)?;
        let fits = guard
            .as_ref()
            .is_some_and(|block| block.alignment() >= alignment);
        if !fits {
            *guard = Some(AlignedBuffer::new(ZERO_BLOCK_LEN, alignment)?);
        }
        Ok(guard)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close_scratch() {
            crate::aio_warn!("environment", "failed to remove scratch file: {}", e);
        }
    }
}
