//! In-process stand-in for the kernel queue.
//!
//! Requests are executed synchronously with `pread`/`pwrite` when submitted,
//! and their completions are published through an [`OwnedRing`] exactly as
//! the kernel publishes them through the AIO ring. Both harvest paths see the
//! same backlog: the user-space reader consumes the ring directly, and
//! [`get_events`](Backend::get_events) consumes it on the "kernel" side.
//!
//! The handle is cheap to clone so a test can keep one while the context
//! owns another, and drive faults from outside:
//!
//! - [`fail_next_submit`](SimulatedAio::fail_next_submit): reject a submission with an errno
//! - [`interrupt_next_wait`](SimulatedAio::interrupt_next_wait): make a wait return `EINTR`
//! - [`fail_next_wait`](SimulatedAio::fail_next_wait): make a wait fail with any errno
//! - [`hold_completions`](SimulatedAio::hold_completions): keep finished requests unpublished
//! - [`set_fast_path`](SimulatedAio::set_fast_path): invalidate the ring header

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::error::{AioError, Result};
use crate::ring::{CompletionRing, OwnedRing};
use crate::sys::{Iocb, IoEvent, AIO_RING_MAGIC, IOCB_CMD_PREAD, IOCB_CMD_PWRITE};

#[derive(Debug, Default)]
struct SimState {
    submit_failures: VecDeque<i32>,
    wait_failures: VecDeque<i32>,
    holding: bool,
    held: Vec<IoEvent>,
    submitted: u64,
    syscall_waits: u64,
    syncs: Vec<RawFd>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    ring: OwnedRing,
    state: Mutex<SimState>,
    published: Condvar,
}

/// Simulated kernel AIO queue with fault injection.
#[derive(Debug, Clone)]
pub struct SimulatedAio {
    inner: Arc<Inner>,
}

impl SimulatedAio {
    /// Create a queue whose ring can hold `queue_depth` unconsumed events.
    pub fn new(queue_depth: usize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                ring: OwnedRing::new(queue_depth)?,
                state: Mutex::new(SimState::default()),
                published: Condvar::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the others.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject the next submission with `errno`. Calls queue up.
    pub fn fail_next_submit(&self, errno: i32) {
        self.lock().submit_failures.push_back(errno);
    }

    /// Make the next kernel wait, or the one currently blocked, return `EINTR`.
    pub fn interrupt_next_wait(&self) {
        self.fail_next_wait(libc::EINTR);
    }

    /// Make the next kernel wait, or the one currently blocked, fail with
    /// `errno`. Calls queue up.
    pub fn fail_next_wait(&self, errno: i32) {
        self.lock().wait_failures.push_back(errno);
        self.inner.published.notify_all();
    }

    /// Injected wait failures not yet delivered.
    pub fn pending_wait_failures(&self) -> usize {
        self.lock().wait_failures.len()
    }

    /// While holding, completed requests are kept back instead of published.
    /// Turning holding off publishes everything held so far that fits in the
    /// ring; the rest follows as the ring drains.
    pub fn hold_completions(&self, hold: bool) {
        let mut state = self.lock();
        state.holding = hold;
        if !hold {
            self.publish_held(&mut state);
        }
    }

    /// Publish only the oldest held completion. Returns whether one was
    /// published; `false` if nothing is held or the ring is full.
    pub fn release_one(&self) -> bool {
        let mut state = self.lock();
        let Some(&event) = state.held.first() else {
            return false;
        };
        if !self.inner.ring.push(event) {
            return false;
        }
        state.held.remove(0);
        self.inner.published.notify_all();
        true
    }

    /// Whether [`Backend::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Move held completions into the ring in order, stopping when it fills.
    fn publish_held(&self, state: &mut SimState) {
        let mut published = 0;
        for event in &state.held {
            if !self.inner.ring.push(*event) {
                break;
            }
            published += 1;
        }
        if published > 0 {
            state.held.drain(..published);
            self.inner.published.notify_all();
        }
    }

    /// Enable or disable the user-space fast path by rewriting the ring magic.
    pub fn set_fast_path(&self, enabled: bool) {
        self.inner
            .ring
            .set_magic(if enabled { AIO_RING_MAGIC } else { 0 });
    }

    /// Completions finished but not yet harvested, held ones included.
    pub fn pending_events(&self) -> usize {
        let state = self.lock();
        state.held.len() + self.inner.ring.len()
    }

    /// Requests accepted so far.
    pub fn submitted(&self) -> u64 {
        self.lock().submitted
    }

    /// Calls to the kernel wait primitive so far.
    pub fn syscall_waits(&self) -> u64 {
        self.lock().syscall_waits
    }

    /// File descriptors passed to [`Backend::sync_data`], in call order.
    pub fn syncs(&self) -> Vec<RawFd> {
        self.lock().syncs.clone()
    }

    fn execute(iocb: &Iocb) -> i64 {
        let fd = iocb.fd();
        let len = iocb.aio_nbytes as usize;
        let buf = iocb.aio_buf as *mut libc::c_void;
        let offset = iocb.aio_offset as libc::off_t;

        if len == 0 {
            return 0;
        }

        // SAFETY: the submitter guarantees the buffer is valid for `len` bytes.
        let ret = unsafe {
            match iocb.aio_lio_opcode {
                IOCB_CMD_PREAD => libc::pread(fd, buf, len, offset),
                IOCB_CMD_PWRITE => libc::pwrite(fd, buf, len, offset),
                _ => return -(libc::EINVAL as i64),
            }
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return -(errno as i64);
        }
        ret as i64
    }

    fn take(&self, events: &mut [IoEvent]) -> usize {
        self.inner.ring.pop_into(events)
    }
}

impl Backend for SimulatedAio {
    unsafe fn submit(&self, iocb: NonNull<Iocb>) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(AioError::ContextClosed);
        }

        if let Some(errno) = state.submit_failures.pop_front() {
            return Err(AioError::os(errno, "Error while submitting IO"));
        }

        // SAFETY: the caller guarantees the control block is valid.
        let request = unsafe { *iocb.as_ptr() };
        let event = IoEvent {
            data: request.aio_data,
            obj: iocb.as_ptr() as u64,
            res: Self::execute(&request),
            res2: 0,
        };
        state.submitted += 1;

        state.held.push(event);
        if !state.holding {
            self.publish_held(&mut state);
        }
        Ok(())
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        state.syscall_waits += 1;

        loop {
            if state.closed {
                return Err(AioError::ContextClosed);
            }
            if let Some(errno) = state.wait_failures.pop_front() {
                return Err(AioError::os(errno, "Error while calling io_getevents"));
            }
            if !state.holding {
                self.publish_held(&mut state);
            }

            let ready = self.inner.ring.len();
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if ready >= min || expired {
                return Ok(self.take(events));
            }

            state = match deadline {
                None => self
                    .inner
                    .published
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    self.inner
                        .published
                        .wait_timeout(state, left)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    fn completion_ring(&self) -> Option<CompletionRing> {
        if self.lock().closed {
            return None;
        }
        // SAFETY: the ring lives inside `self.inner`, which the backend keeps
        // alive for as long as any caller holds the backend.
        Some(unsafe { CompletionRing::from_raw(self.inner.ring.header()) })
    }

    fn sync_data(&self, fd: RawFd) -> Result<()> {
        self.lock().syncs.push(fd);
        Ok(())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.inner.published.notify_all();
    }

    fn name(&self) -> &'static str {
        "simulated-aio"
    }
}
