//! Kernel queue abstraction.
//!
//! An [`IoContext`](crate::IoContext) talks to the kernel only through the
//! [`Backend`] trait: submit one control block, wait for completion events,
//! and optionally expose the completion ring for the user-space fast path.
//!
//! # Backends
//!
//! - [`LinuxAio`]: the real `io_setup`/`io_submit`/`io_getevents` syscalls.
//! - [`SimulatedAio`]: an in-process stand-in that performs the I/O
//!   synchronously at submission and publishes completions through an
//!   [`OwnedRing`](crate::ring::OwnedRing). It supports fault injection and
//!   runs anywhere, including kernels or sandboxes without AIO.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::{AioError, Result};
use crate::ring::CompletionRing;
use crate::sys::{Iocb, IoEvent};

mod linux;
mod simulated;

pub use linux::{is_aio_available, LinuxAio};
pub use simulated::SimulatedAio;

/// A kernel asynchronous I/O queue.
pub trait Backend: Send + Sync {
    /// Submit exactly one prepared control block.
    ///
    /// # Safety
    ///
    /// `iocb` and the buffer it describes must stay valid, and the buffer
    /// untouched by the caller, until the matching completion event has been
    /// harvested through [`get_events`](Self::get_events) or the ring.
    ///
    /// # Errors
    ///
    /// Returns [`AioError::Os`] carrying the kernel's error code if the
    /// request was not queued. Nothing is in flight in that case.
    unsafe fn submit(&self, iocb: NonNull<Iocb>) -> Result<()>;

    /// Wait for completions through the kernel.
    ///
    /// Copies between `min` and `events.len()` events. A `timeout` of `None`
    /// waits until `min` are available; `Some(Duration::ZERO)` returns
    /// immediately with whatever is ready. An interrupted wait surfaces as
    /// [`AioError::Os`] with `EINTR`.
    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// The completion ring, if this backend exposes one to user space.
    ///
    /// The returned view is valid for as long as the backend is alive.
    fn completion_ring(&self) -> Option<CompletionRing>;

    /// Flush a file's data to stable storage.
    fn sync_data(&self, fd: RawFd) -> Result<()> {
        // SAFETY: fdatasync has no memory-safety preconditions.
        if unsafe { libc::fdatasync(fd) } < 0 {
            return Err(AioError::last_os_error("Error syncing file data"));
        }
        Ok(())
    }

    /// Give the kernel queue back.
    ///
    /// Called once the context has drained. Afterwards `submit` and
    /// `get_events` fail with [`AioError::ContextClosed`] and
    /// `completion_ring` returns `None`. Calling it again does nothing.
    fn close(&self) {}

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    unsafe fn submit(&self, iocb: NonNull<Iocb>) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { (**self).submit(iocb) }
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        (**self).get_events(min, events, timeout)
    }

    fn completion_ring(&self) -> Option<CompletionRing> {
        (**self).completion_ring()
    }

    fn sync_data(&self, fd: RawFd) -> Result<()> {
        (**self).sync_data(fd)
    }

    fn close(&self) {
        (**self).close()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
