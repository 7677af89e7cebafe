//! Linux kernel AIO backend.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{AioError, Result};
use crate::ring::CompletionRing;
use crate::sys::{AioContextId, Iocb, IoEvent, RingHeader};

/// Kernel AIO context created with `io_setup`.
///
/// The context id is swapped to 0 when the queue is destroyed.
#[derive(Debug)]
pub struct LinuxAio {
    ctx: AtomicU64,
    nr_events: u32,
}

impl LinuxAio {
    /// Create a kernel queue able to hold `nr_events` in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns [`AioError::Os`] if `io_setup` fails, e.g. `EAGAIN` when the
    /// system-wide `aio-max-nr` limit would be exceeded or `ENOSYS` on
    /// kernels built without AIO.
    pub fn new(nr_events: u32) -> Result<Self> {
        if nr_events == 0 {
            return Err(AioError::InvalidArgument(
                "queue depth must be greater than zero".to_string(),
            ));
        }

        let mut ctx: AioContextId = 0;
        // SAFETY: `ctx` is a valid out-pointer and must be zero on entry.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                nr_events as libc::c_long,
                &mut ctx as *mut AioContextId,
            )
        };
        if ret < 0 {
            return Err(AioError::last_os_error("Cannot initialize queue"));
        }

        Ok(Self {
            ctx: AtomicU64::new(ctx as u64),
            nr_events,
        })
    }

    /// Queue depth requested at setup.
    pub fn nr_events(&self) -> u32 {
        self.nr_events
    }

    /// Whether `io_destroy` has run.
    pub fn is_closed(&self) -> bool {
        self.ctx.load(Ordering::Acquire) == 0
    }

    fn live_ctx(&self) -> Result<AioContextId> {
        match self.ctx.load(Ordering::Acquire) {
            0 => Err(AioError::ContextClosed),
            ctx => Ok(ctx as AioContextId),
        }
    }
}

impl Backend for LinuxAio {
    unsafe fn submit(&self, iocb: NonNull<Iocb>) -> Result<()> {
        let ctx = self.live_ctx()?;
        let mut list = [iocb.as_ptr()];
        // SAFETY: `list` holds one control block whose validity until
        // completion the caller guarantees.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                ctx,
                1 as libc::c_long,
                list.as_mut_ptr(),
            )
        };
        match ret {
            r if r < 0 => Err(AioError::last_os_error("Error while submitting IO")),
            0 => Err(AioError::os(libc::EAGAIN, "Error while submitting IO")),
            _ => Ok(()),
        }
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let ctx = self.live_ctx()?;
        let mut ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_mut()
            .map_or(ptr::null_mut(), |t| t as *mut libc::timespec);

        // SAFETY: `events` is writable for `events.len()` entries and the
        // timespec, when present, lives across the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                ctx,
                min as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                ts_ptr,
            )
        };
        if ret < 0 {
            return Err(AioError::last_os_error("Error while calling io_getevents"));
        }
        Ok(ret as usize)
    }

    fn completion_ring(&self) -> Option<CompletionRing> {
        // The context id is the address of the ring the kernel mapped into
        // this process; it stays mapped until io_destroy.
        let header = NonNull::new(self.ctx.load(Ordering::Acquire) as *mut RingHeader)?;
        // SAFETY: see above.
        Some(unsafe { CompletionRing::from_raw(header) })
    }

    fn close(&self) {
        let ctx = self.ctx.swap(0, Ordering::AcqRel);
        if ctx == 0 {
            return;
        }
        // SAFETY: `ctx` came from a successful io_setup, and the swap above
        // hands it to exactly one caller.
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, ctx as AioContextId) };
        if ret < 0 {
            crate::aio_warn!(
                "backend",
                "io_destroy failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            crate::aio_debug!("backend", "kernel queue of {} events released", self.nr_events);
        }
    }

    fn name(&self) -> &'static str {
        "linux-aio"
    }
}

impl Drop for LinuxAio {
    fn drop(&mut self) {
        self.close();
    }
}

/// Probe whether kernel AIO can be set up in this process.
pub fn is_aio_available() -> bool {
    LinuxAio::new(1).is_ok()
}
