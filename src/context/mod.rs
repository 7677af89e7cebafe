//! The I/O context: submission, polling and shutdown.
//!
//! An [`IoContext`] owns a kernel queue, a [`DescriptorPool`] of the same
//! depth and the buffer completions are harvested into. Any number of
//! threads may submit concurrently. At most one thread polls at a time: the
//! poll lock guards the completion buffer and the ring's head, so a second
//! poller blocks until the first is done.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use safer_aio::{AlignedBuffer, CompletionSink, Environment, IoContext};
//!
//! struct Flushed;
//!
//! impl CompletionSink for Flushed {
//!     fn on_error(&self, code: i32, message: &str) {
//!         eprintln!("write failed: {code} {message}");
//!     }
//!     fn done(&self) {}
//! }
//!
//! # fn main() -> safer_aio::Result<()> {
//! let ctx = Arc::new(IoContext::new(128, Environment::new()?)?);
//! let poller = {
//!     let ctx = Arc::clone(&ctx);
//!     std::thread::spawn(move || ctx.blocking_poll(true))
//! };
//!
//! let file = safer_aio::file::open("/var/tmp/journal.dat", true)?;
//! let mut buffer = AlignedBuffer::new(4096, 512)?;
//! buffer.as_mut_slice()[..5].copy_from_slice(b"hello");
//! // SAFETY: `buffer` outlives the operation; shutdown drains it below.
//! unsafe {
//!     use std::os::unix::io::AsRawFd;
//!     ctx.submit_write(file.as_raw_fd(), 0, buffer.as_ptr(), buffer.len(), Arc::new(Flushed))?;
//! }
//!
//! ctx.shutdown()?;
//! poller.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::backend::{Backend, LinuxAio};
use crate::buffer::AlignedBuffer;
use crate::completion::{CompletionRef, DirectDispatch, Dispatcher, InFlight};
use crate::config::{AioConfig, ContextConfig, FileConfig, MAX_QUEUE_DEPTH};
use crate::environment::Environment;
use crate::error::{AioError, Result};
use crate::poller::{timed, Delivery, PollCounters, PollStats, Poller};
use crate::pool::{DescriptorId, DescriptorPool, PoolStats};
use crate::sys::IoEvent;

/// Upper bound on one wait while shutdown drains outstanding operations.
const DRAIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

/// Statistics for a context.
#[derive(Debug, Clone, Copy)]
pub struct ContextStats {
    /// Backend name
    pub backend: &'static str,
    /// Descriptor pool occupancy
    pub pool: PoolStats,
    /// Harvest counters
    pub poll: PollStats,
}

/// Asynchronous direct-I/O context.
pub struct IoContext {
    backend: Box<dyn Backend>,
    pool: DescriptorPool,
    events: Mutex<Vec<IoEvent>>,
    env: Arc<Environment>,
    dispatcher: Box<dyn Dispatcher>,
    file_config: FileConfig,
    use_fdatasync: bool,
    closed: AtomicBool,
    counters: PollCounters,
}

static_assertions::assert_impl_all!(IoContext: Send, Sync);

impl IoContext {
    /// Create a context on kernel AIO with `queue_depth` slots.
    ///
    /// # Errors
    ///
    /// [`AioError::InvalidArgument`] for a zero depth, [`AioError::Os`] if
    /// the kernel refuses the queue.
    pub fn new(queue_depth: u32, env: Arc<Environment>) -> Result<Self> {
        ContextBuilder::new()
            .queue_depth(queue_depth)
            .environment(env)
            .build()
    }

    /// Create a context on an arbitrary backend.
    pub fn with_backend<B: Backend + 'static>(
        backend: B,
        queue_depth: u32,
        env: Arc<Environment>,
    ) -> Result<Self> {
        ContextBuilder::new()
            .queue_depth(queue_depth)
            .environment(env)
            .backend(backend)
            .build()
    }

    /// Create a context on kernel AIO from a validated configuration.
    ///
    /// Installs the process logger first when `config.logging.enabled`.
    pub fn from_config(config: &AioConfig, env: Arc<Environment>) -> Result<Self> {
        ContextBuilder::from_config(config)?.environment(env).build()
    }

    /// Start a [`ContextBuilder`].
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Maximum number of operations in flight.
    pub fn queue_depth(&self) -> usize {
        self.pool.capacity()
    }

    /// Operations currently in flight.
    pub fn used(&self) -> Result<usize> {
        self.pool.used()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The environment this context was built with.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// File settings this context was built with.
    pub fn file_config(&self) -> &FileConfig {
        &self.file_config
    }

    /// Snapshot of pool and poll counters.
    pub fn stats(&self) -> Result<ContextStats> {
        Ok(ContextStats {
            backend: self.backend.name(),
            pool: self.pool.stats()?,
            poll: self.counters.snapshot(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AioError::ContextClosed);
        }
        Ok(())
    }

    fn poller(&self) -> Poller<'_> {
        Poller {
            backend: &*self.backend,
            pool: &self.pool,
            counters: &self.counters,
        }
    }

    fn lock_events(&self) -> Result<MutexGuard<'_, Vec<IoEvent>>> {
        self.events.lock().map_err(|_| AioError::PoolPoisoned)
    }

    /// Queue an asynchronous write of `len` bytes from `buf` at `offset`.
    ///
    /// Never waits for capacity: with `queue_depth` operations already in
    /// flight this fails with [`AioError::ResourceExhausted`] and the caller
    /// retries after a completion. On any error nothing is in flight and the
    /// context holds no reference to `completion`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `len` bytes and must not be modified until
    /// `completion` has been delivered. With `O_DIRECT`, `buf`, `len` and
    /// `offset` must satisfy the device's alignment.
    pub unsafe fn submit_write(
        &self,
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: usize,
        completion: CompletionRef,
    ) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.submit(Op::Write, fd, offset, buf.cast_mut(), len, completion) }
    }

    /// Queue an asynchronous read of `len` bytes into `buf` from `offset`.
    ///
    /// Same contract as [`submit_write`](Self::submit_write).
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes and must not be read or
    /// written by the caller until `completion` has been delivered.
    pub unsafe fn submit_read(
        &self,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
        completion: CompletionRef,
    ) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.submit(Op::Read, fd, offset, buf, len, completion) }
    }

    unsafe fn submit(
        &self,
        op: Op,
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
        completion: CompletionRef,
    ) -> Result<()> {
        self.ensure_open()?;
        if buf.is_null() && len > 0 {
            return Err(AioError::InvalidArgument("Null buffer".to_string()));
        }

        let id = self.pool.acquire()?.ok_or(AioError::ResourceExhausted {
            capacity: self.pool.capacity(),
        })?;
        // Shutdown may have started since the first check. Past this point
        // its drain sees the descriptor as outstanding and waits for it.
        if self.is_closed() {
            self.pool.release(id)?;
            return Err(AioError::ContextClosed);
        }

        // SAFETY: `id` was just acquired, so nobody else owns it and the
        // kernel does not hold it.
        let iocb = unsafe {
            let descriptor = self.pool.descriptor_mut(id);
            match op {
                Op::Read => descriptor.iocb.prep_pread(fd, buf, len, offset),
                Op::Write => descriptor.iocb.prep_pwrite(fd, buf.cast_const(), len, offset),
            }
            descriptor.in_flight = Some(InFlight::User(completion));
            NonNull::from(&mut descriptor.iocb)
        };

        // SAFETY: the control block lives in the pool for the context's
        // lifetime; buffer validity is the caller's contract.
        if let Err(e) = unsafe { self.backend.submit(iocb) } {
            crate::aio_warn!("context", "submit of {:?} on fd {} failed: {}", op, fd, e);
            self.abandon(id);
            return Err(e);
        }
        Ok(())
    }

    /// Undo an acquisition whose submission the kernel rejected.
    fn abandon(&self, id: DescriptorId) {
        // SAFETY: the kernel never accepted the request, so we still own it.
        drop(unsafe { self.pool.descriptor_mut(id) }.in_flight.take());
        if let Err(e) = self.pool.release(id) {
            crate::aio_error!("context", "releasing descriptor {}: {}", id.index(), e);
        }
    }

    /// Harvest completions, waiting until at least `min` are available.
    ///
    /// Up to `max` events are processed; each finished operation's reference
    /// is pushed onto `out` after its descriptor is back in the pool, and a
    /// failed operation gets `on_error` first. With `min == 0` this never
    /// blocks. Returns the number of events processed.
    pub fn poll(&self, out: &mut Vec<CompletionRef>, min: usize, max: usize) -> Result<usize> {
        self.poll_timeout(out, min, max, None)
    }

    /// Harvest whatever has completed, without waiting.
    pub fn try_poll(&self, out: &mut Vec<CompletionRef>, max: usize) -> Result<usize> {
        self.poll_timeout(out, 0, max, Some(Duration::ZERO))
    }

    /// [`poll`](Self::poll) with a bound on the wait.
    ///
    /// A zero `timeout` is the non-blocking mode: fewer than `min` events,
    /// possibly none, may be returned.
    pub fn poll_timeout(
        &self,
        out: &mut Vec<CompletionRef>,
        min: usize,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.ensure_open()?;
        if min > max {
            return Err(AioError::InvalidArgument(format!(
                "min {min} exceeds max {max}"
            )));
        }

        let mut events = self.lock_events()?;
        let max = max.min(events.len());
        if max == 0 {
            return Ok(0);
        }
        let min = min.min(max);

        let poller = self.poller();
        timed("poll", || {
            let n = poller.get_events(min, &mut events[..max], timeout)?;
            poller.process(&events[..n], false, &mut Delivery::Collect(out));
            Ok(n)
        })
    }

    /// Run the dedicated completion loop until shutdown.
    ///
    /// Every finished operation is handed to the context's dispatcher. With
    /// `use_fdatasync`, each run of completions for the same file within a
    /// harvested batch is preceded by one data sync of that file. Interrupted
    /// waits are retried. Returns `Ok(())` once the shutdown sentinel has
    /// been seen, or immediately if the context is already shut down.
    ///
    /// # Errors
    ///
    /// Any wait failure other than `EINTR` ends the loop with
    /// [`AioError::Os`].
    pub fn blocking_poll(&self, use_fdatasync: bool) -> Result<()> {
        let mut events = self.lock_events()?;
        if self.is_closed() {
            return Ok(());
        }
        crate::aio_debug!("context", "blocking poll started");

        let poller = self.poller();
        let mut delivery = Delivery::Dispatch(&*self.dispatcher);
        loop {
            let n = match poller.get_events(1, &mut events[..], None) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    crate::aio_error!("context", "blocking poll stopped: {}", e);
                    return Err(e);
                }
            };

            let batch = timed("blocking_poll", || {
                poller.process(&events[..n], use_fdatasync, &mut delivery)
            });
            if batch.sentinel {
                crate::aio_debug!("context", "blocking poll finished");
                return Ok(());
            }
        }
    }

    /// [`blocking_poll`](Self::blocking_poll) with the durability mode this
    /// context was configured with.
    pub fn run(&self) -> Result<()> {
        self.blocking_poll(self.use_fdatasync)
    }

    /// Stop the context.
    ///
    /// Submits the zero-length sentinel write that wakes a thread blocked in
    /// [`blocking_poll`](Self::blocking_poll), waits for that thread to
    /// leave the loop, then drains every operation still in flight,
    /// delivering each through the dispatcher, and gives the kernel queue
    /// back. When this returns `Ok` the pool is empty. Later calls return `Ok` immediately; every other
    /// operation fails with [`AioError::ContextClosed`].
    pub fn shutdown(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.submit_sentinel() {
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }

        // A running blocking poll holds this until it sees the sentinel.
        let mut events = self.lock_events()?;
        self.drain(&mut events[..])?;
        self.backend.close();
        drop(events);

        crate::aio_info!("context", "context closed ({})", self.backend.name());
        Ok(())
    }

    fn submit_sentinel(&self) -> Result<()> {
        let id = loop {
            if let Some(id) = self.pool.acquire()? {
                break id;
            }
            // Every slot is in flight. Harvest ourselves if nobody is
            // polling, otherwise wait for the poller to free one.
            match self.events.try_lock() {
                Ok(mut events) => {
                    let poller = self.poller();
                    match poller.get_events(1, &mut events[..], Some(DRAIN_WAIT)) {
                        Ok(n) => {
                            poller.process(
                                &events[..n],
                                false,
                                &mut Delivery::Dispatch(&*self.dispatcher),
                            );
                        }
                        Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
                Err(TryLockError::Poisoned(_)) => return Err(AioError::PoolPoisoned),
            }
        };

        // SAFETY: `id` was just acquired.
        let iocb = unsafe {
            let descriptor = self.pool.descriptor_mut(id);
            descriptor
                .iocb
                .prep_pwrite(self.env.scratch_fd(), ptr::null(), 0, 0);
            descriptor.in_flight = Some(InFlight::Sentinel);
            NonNull::from(&mut descriptor.iocb)
        };

        // SAFETY: zero-length write from a pool-owned control block.
        if let Err(e) = unsafe { self.backend.submit(iocb) } {
            crate::aio_error!("context", "shutdown sentinel rejected: {}", e);
            self.abandon(id);
            return Err(e);
        }
        Ok(())
    }

    fn drain(&self, events: &mut [IoEvent]) -> Result<()> {
        let poller = self.poller();
        let mut delivery = Delivery::Dispatch(&*self.dispatcher);
        let mut immediate = true;

        while self.pool.used()? > 0 {
            let (min, timeout) = if immediate {
                (0, Some(Duration::ZERO))
            } else {
                (1, Some(DRAIN_WAIT))
            };
            immediate = false;

            let n = match poller.get_events(min, events, timeout) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    crate::aio_error!("context", "drain during shutdown failed: {}", e);
                    return Err(e);
                }
            };
            poller.process(&events[..n], false, &mut delivery);
        }
        Ok(())
    }

    /// Open `path` with this context's direct I/O setting.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<File> {
        crate::file::open(path, self.file_config.direct_io)
    }

    /// Allocate a buffer with this context's alignment.
    pub fn alloc_buffer(&self, size: usize) -> Result<AlignedBuffer> {
        AlignedBuffer::new(size, self.file_config.alignment)
    }

    /// Zero-fill the first `size` bytes of `fd` with this context's
    /// alignment and fill chunk.
    pub fn fill_with_zeroes(&self, fd: RawFd, size: u64) -> Result<()> {
        crate::file::fill_with_zeroes_in_chunks(
            &self.env,
            fd,
            self.file_config.alignment,
            size,
            self.file_config.fill_chunk,
        )
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.shutdown() {
            crate::aio_error!("context", "shutdown on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("backend", &self.backend.name())
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Step-by-step construction of an [`IoContext`].
pub struct ContextBuilder {
    queue_depth: u32,
    max_events: u32,
    use_fdatasync: bool,
    file_config: FileConfig,
    backend: Option<Box<dyn Backend>>,
    env: Option<Arc<Environment>>,
    dispatcher: Box<dyn Dispatcher>,
}

impl ContextBuilder {
    /// Defaults: depth 4096, direct dispatch, kernel AIO.
    pub fn new() -> Self {
        Self {
            queue_depth: 4096,
            max_events: 0,
            use_fdatasync: false,
            file_config: FileConfig::default(),
            backend: None,
            env: None,
            dispatcher: Box::new(DirectDispatch),
        }
    }

    /// Seed from a configuration, validating it and applying its logging
    /// section.
    pub fn from_config(config: &AioConfig) -> Result<Self> {
        config.validate()?;
        config.logging.apply()?;
        Ok(Self {
            queue_depth: config.context.queue_depth,
            max_events: config.context.max_events_per_poll,
            use_fdatasync: config.context.use_fdatasync,
            file_config: config.file.clone(),
            ..Self::new()
        })
    }

    /// Maximum operations in flight.
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Events harvested per poll; 0 means the queue depth.
    pub fn max_events_per_poll(mut self, max: u32) -> Self {
        self.max_events = max;
        self
    }

    /// Durability mode used by [`IoContext::run`].
    pub fn use_fdatasync(mut self, enabled: bool) -> Self {
        self.use_fdatasync = enabled;
        self
    }

    /// File settings.
    pub fn file_config(mut self, file: FileConfig) -> Self {
        self.file_config = file;
        self
    }

    /// Use `backend` instead of kernel AIO.
    pub fn backend<B: Backend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Use `env` instead of the process-wide environment.
    pub fn environment(mut self, env: Arc<Environment>) -> Self {
        self.env = Some(env);
        self
    }

    /// Deliver blocking-loop completions through `dispatcher`.
    pub fn dispatcher<D: Dispatcher + 'static>(mut self, dispatcher: D) -> Self {
        self.dispatcher = Box::new(dispatcher);
        self
    }

    /// Create the context.
    pub fn build(self) -> Result<IoContext> {
        let depth = self.queue_depth;
        if depth == 0 || depth > MAX_QUEUE_DEPTH {
            return Err(AioError::InvalidArgument(format!(
                "queue depth {depth} must be between 1 and {MAX_QUEUE_DEPTH}"
            )));
        }
        if self.max_events > depth {
            return Err(AioError::InvalidArgument(format!(
                "max events per poll {} exceeds queue depth {depth}",
                self.max_events
            )));
        }
        let max_events = ContextConfig {
            queue_depth: depth,
            use_fdatasync: self.use_fdatasync,
            max_events_per_poll: self.max_events,
        }
        .effective_max_events();

        let pool = DescriptorPool::new(depth as usize)?;

        let mut events = Vec::new();
        events
            .try_reserve_exact(max_events)
            .map_err(|_| AioError::OutOfMemory {
                size: max_events * std::mem::size_of::<IoEvent>(),
            })?;
        events.resize(max_events, IoEvent::default());

        let env = match self.env {
            Some(env) => env,
            None => Environment::shared()?,
        };

        let backend = match self.backend {
            Some(backend) => backend,
            None => Box::new(LinuxAio::new(depth)?),
        };

        crate::aio_info!(
            "context",
            "context created: depth={}, backend={}",
            depth,
            backend.name()
        );

        Ok(IoContext {
            backend,
            pool,
            events: Mutex::new(events),
            env,
            dispatcher: self.dispatcher,
            file_config: self.file_config,
            use_fdatasync: self.use_fdatasync,
            closed: AtomicBool::new(false),
            counters: PollCounters::default(),
        })
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("queue_depth", &self.queue_depth)
            .field("max_events", &self.max_events)
            .field("use_fdatasync", &self.use_fdatasync)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}
