//! Completion harvesting.
//!
//! [`Poller::get_events`] tries the user-space ring first and falls back to
//! the kernel wait only when the ring is unusable or holds fewer than the
//! requested minimum. [`Poller::process`] then runs the per-event protocol
//! shared by the bounded poll, the blocking loop and the shutdown drain:
//!
//! 1. map the event back to its descriptor and take what it carried
//! 2. a sentinel is released and remembered, nothing else
//! 3. in group durability mode, sync when the file changes within the batch
//! 4. a negative result goes to the sink's `on_error`
//! 5. release the descriptor, then deliver the reference
//!
//! The reference is delivered after the descriptor is back in the pool, so a
//! sink that resubmits from `done` never sees a spurious exhaustion.
//!
//! Callers must hold the context's poll lock for the whole get/process
//! sequence.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::completion::{CompletionRef, Dispatcher, InFlight};
use crate::error::{describe_errno, Result};
use crate::pool::{DescriptorId, DescriptorPool};
use crate::ring::RingRead;
use crate::sys::IoEvent;

/// Where completed references go.
pub(crate) enum Delivery<'a> {
    /// Bounded poll: hand references back to the caller.
    Collect(&'a mut Vec<CompletionRef>),
    /// Blocking loop and shutdown drain: deliver through the dispatcher.
    Dispatch(&'a dyn Dispatcher),
}

impl Delivery<'_> {
    fn deliver(&mut self, completion: CompletionRef) {
        match self {
            Delivery::Collect(out) => out.push(completion),
            Delivery::Dispatch(dispatcher) => dispatcher.dispatch(completion),
        }
    }
}

/// Result of processing one batch of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Batch {
    /// Events whose descriptor went back to the pool
    pub handled: usize,
    /// Whether the shutdown sentinel was among them
    pub sentinel: bool,
}

/// Lock-free poll counters owned by a context.
#[derive(Debug, Default)]
pub(crate) struct PollCounters {
    fast_path: AtomicU64,
    fallbacks: AtomicU64,
    events: AtomicU64,
    failed: AtomicU64,
    syncs: AtomicU64,
    sync_failures: AtomicU64,
}

impl PollCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PollStats {
        PollStats {
            fast_path_hits: self.fast_path.load(Ordering::Relaxed),
            syscall_fallbacks: self.fallbacks.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            failed_operations: self.failed.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time poll counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Harvests served from the user-space ring
    pub fast_path_hits: u64,
    /// Harvests that went through the kernel wait
    pub syscall_fallbacks: u64,
    /// Completion events processed, sentinels included
    pub events: u64,
    /// Events that carried a negative result
    pub failed_operations: u64,
    /// Data syncs issued in group durability mode
    pub syncs: u64,
    /// Data syncs that failed and were logged
    pub sync_failures: u64,
}

impl PollStats {
    /// Share of harvests served without a syscall, in percent.
    pub fn fast_path_percent(&self) -> f64 {
        let total = self.fast_path_hits + self.syscall_fallbacks;
        if total == 0 {
            0.0
        } else {
            self.fast_path_hits as f64 / total as f64 * 100.0
        }
    }
}

/// Borrowed view over the pieces of a context a poll needs.
pub(crate) struct Poller<'a> {
    pub(crate) backend: &'a dyn Backend,
    pub(crate) pool: &'a DescriptorPool,
    pub(crate) counters: &'a PollCounters,
}

impl Poller<'_> {
    /// Harvest between `min` and `events.len()` completions.
    ///
    /// A `timeout` of `Some(Duration::ZERO)` is the non-blocking mode: the
    /// ring is drained of whatever it holds, even fewer than `min`, without
    /// a syscall.
    pub(crate) fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if let Some(ring) = self.backend.completion_ring() {
            let immediate = timeout == Some(Duration::ZERO);
            match ring.reap(min, events, immediate) {
                RingRead::Copied(n) => {
                    PollCounters::bump(&self.counters.fast_path, 1);
                    return Ok(n);
                }
                RingRead::Unusable => {
                    crate::aio_trace!("poller", "ring unusable, using {}", self.backend.name());
                }
                RingRead::Insufficient { available } => {
                    crate::aio_trace!(
                        "poller",
                        "ring holds {} of {} wanted, waiting in kernel",
                        available,
                        min
                    );
                }
            }
        }

        PollCounters::bump(&self.counters.fallbacks, 1);
        self.backend.get_events(min, events, timeout)
    }

    /// Run the per-event protocol over a harvested batch.
    ///
    /// With `sync_data`, a data sync is issued each time the file changes
    /// within this batch. A failed sync is logged and the batch goes on.
    /// Processing never stops early: events after a sentinel in the same
    /// batch are still handled, so nothing harvested is dropped.
    pub(crate) fn process(
        &self,
        events: &[IoEvent],
        sync_data: bool,
        delivery: &mut Delivery<'_>,
    ) -> Batch {
        let mut batch = Batch::default();
        let mut last_fd: Option<RawFd> = None;
        PollCounters::bump(&self.counters.events, events.len() as u64);

        for event in events {
            let id = DescriptorId::from_event_data(event.data);
            if !self.pool.contains(id) {
                crate::aio_error!("poller", "completion for unknown descriptor {}", event.data);
                continue;
            }

            // SAFETY: the kernel handed this id back, so the request is no
            // longer in flight and the poll lock makes us its only owner
            // until it is released below.
            let (fd, in_flight) = unsafe {
                let descriptor = self.pool.descriptor_mut(id);
                (descriptor.iocb.fd(), descriptor.in_flight.take())
            };

            let completion = match in_flight {
                Some(InFlight::Sentinel) => {
                    crate::aio_debug!("poller", "shutdown sentinel arrived");
                    self.release(id);
                    batch.handled += 1;
                    batch.sentinel = true;
                    continue;
                }
                Some(InFlight::User(completion)) => Some(completion),
                None => None,
            };

            if sync_data && last_fd != Some(fd) {
                last_fd = Some(fd);
                PollCounters::bump(&self.counters.syncs, 1);
                if let Err(e) = self.backend.sync_data(fd) {
                    PollCounters::bump(&self.counters.sync_failures, 1);
                    crate::aio_warn!("poller", "fdatasync on fd {} failed: {}", fd, e);
                }
            }

            if event.res < 0 {
                PollCounters::bump(&self.counters.failed, 1);
                let code = (-event.res) as i32;
                if crate::logging::enabled(crate::logging::LogLevel::Trace) {
                    crate::logging::log_slot(
                        crate::logging::LogLevel::Trace,
                        "poller",
                        id.index(),
                        Some(fd),
                        &format!("operation failed with errno {code}"),
                    );
                }
                if let Some(completion) = &completion {
                    completion.on_error(code, &describe_errno(code));
                }
            }

            self.release(id);
            batch.handled += 1;

            if let Some(completion) = completion {
                delivery.deliver(completion);
            }
        }

        batch
    }

    fn release(&self, id: DescriptorId) {
        if let Err(e) = self.pool.release(id) {
            crate::aio_error!("poller", "releasing descriptor {}: {}", id.index(), e);
        }
    }
}

/// Measure `f` when timings are being collected.
pub(crate) fn timed<T>(operation: &str, f: impl FnOnce() -> T) -> T {
    if !crate::logging::timing_wanted() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    crate::logging::log_timing("poller", operation, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedAio;
    use crate::completion::CompletionSink;
    use std::os::unix::io::AsRawFd;
    use std::ptr::NonNull;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        errors: Mutex<Vec<(i32, String)>>,
        done: AtomicUsize,
    }

    impl CompletionSink for Recorder {
        fn on_error(&self, code: i32, message: &str) {
            self.errors.lock().unwrap().push((code, message.to_string()));
        }

        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        sim: SimulatedAio,
        pool: DescriptorPool,
        counters: PollCounters,
    }

    impl Fixture {
        fn new(depth: usize) -> Self {
            Self {
                sim: SimulatedAio::new(depth).unwrap(),
                pool: DescriptorPool::new(depth).unwrap(),
                counters: PollCounters::default(),
            }
        }

        fn poller(&self) -> Poller<'_> {
            Poller {
                backend: &self.sim,
                pool: &self.pool,
                counters: &self.counters,
            }
        }

        fn submit_write(&self, fd: RawFd, data: &[u8], in_flight: InFlight) -> DescriptorId {
            let id = self.pool.acquire().unwrap().unwrap();
            let iocb = unsafe {
                let d = self.pool.descriptor_mut(id);
                d.iocb.prep_pwrite(fd, data.as_ptr(), data.len(), 0);
                d.in_flight = Some(in_flight);
                NonNull::from(&mut d.iocb)
            };
            unsafe { self.sim.submit(iocb).unwrap() };
            id
        }
    }

    #[test]
    fn fast_path_is_preferred() {
        let fx = Fixture::new(4);
        let file = tempfile::tempfile().unwrap();
        let sink = Arc::new(Recorder::default());
        fx.submit_write(file.as_raw_fd(), b"abc", InFlight::User(sink.clone()));

        let mut events = [IoEvent::default(); 4];
        let n = fx.poller().get_events(1, &mut events, None).unwrap();
        assert_eq!(n, 1);

        let stats = fx.counters.snapshot();
        assert_eq!(stats.fast_path_hits, 1);
        assert_eq!(stats.syscall_fallbacks, 0);
        assert_eq!(fx.sim.syscall_waits(), 0);
    }

    #[test]
    fn unusable_ring_falls_back() {
        let fx = Fixture::new(4);
        fx.sim.set_fast_path(false);
        let file = tempfile::tempfile().unwrap();
        fx.submit_write(file.as_raw_fd(), b"abc", InFlight::User(Arc::new(Recorder::default())));

        let mut events = [IoEvent::default(); 4];
        assert_eq!(fx.poller().get_events(1, &mut events, None).unwrap(), 1);
        assert_eq!(fx.counters.snapshot().syscall_fallbacks, 1);
        assert_eq!(fx.sim.syscall_waits(), 1);
    }

    #[test]
    fn zero_timeout_never_waits() {
        let fx = Fixture::new(4);
        let mut events = [IoEvent::default(); 4];
        let n = fx
            .poller()
            .get_events(3, &mut events, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(fx.counters.snapshot().fast_path_hits, 1);
        assert_eq!(fx.sim.syscall_waits(), 0);
    }

    #[test]
    fn errors_reach_sink_and_descriptor_is_released() {
        let fx = Fixture::new(4);
        let sink = Arc::new(Recorder::default());
        // Writing through a read-only descriptor fails with EBADF
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro");
        std::fs::write(&path, b"").unwrap();
        let ro = std::fs::File::open(&path).unwrap();
        fx.submit_write(ro.as_raw_fd(), b"abc", InFlight::User(sink.clone()));
        assert_eq!(fx.pool.used().unwrap(), 1);

        let mut events = [IoEvent::default(); 4];
        let n = fx.poller().get_events(1, &mut events, None).unwrap();
        let mut out = Vec::new();
        let batch = fx
            .poller()
            .process(&events[..n], false, &mut Delivery::Collect(&mut out));

        assert_eq!(batch.handled, 1);
        assert!(!batch.sentinel);
        assert_eq!(fx.pool.used().unwrap(), 0);
        assert_eq!(out.len(), 1);
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, libc::EBADF);
        assert_eq!(errors[0].1, describe_errno(libc::EBADF));
        assert_eq!(fx.counters.snapshot().failed_operations, 1);
    }

    #[test]
    fn sentinel_is_released_not_delivered() {
        let fx = Fixture::new(4);
        let file = tempfile::tempfile().unwrap();
        let sink = Arc::new(Recorder::default());
        fx.submit_write(file.as_raw_fd(), b"", InFlight::Sentinel);
        fx.submit_write(file.as_raw_fd(), b"x", InFlight::User(sink.clone()));

        let mut events = [IoEvent::default(); 4];
        let n = fx.poller().get_events(2, &mut events, None).unwrap();
        let batch = fx
            .poller()
            .process(&events[..n], false, &mut Delivery::Dispatch(&crate::completion::DirectDispatch));

        assert_eq!(batch, Batch { handled: 2, sentinel: true });
        assert_eq!(sink.done.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pool.used().unwrap(), 0);
    }

    #[test]
    fn group_sync_once_per_file_run() {
        let fx = Fixture::new(8);
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        for fd in [a.as_raw_fd(), a.as_raw_fd(), b.as_raw_fd(), a.as_raw_fd()] {
            fx.submit_write(fd, b"z", InFlight::User(Arc::new(Recorder::default())));
        }

        let mut events = [IoEvent::default(); 8];
        let n = fx.poller().get_events(4, &mut events, None).unwrap();
        assert_eq!(n, 4);
        fx.poller()
            .process(&events[..n], true, &mut Delivery::Dispatch(&crate::completion::DirectDispatch));

        assert_eq!(fx.sim.syncs(), vec![a.as_raw_fd(), b.as_raw_fd(), a.as_raw_fd()]);
        assert_eq!(fx.counters.snapshot().syncs, 3);
    }

    #[test]
    fn sync_skipped_when_disabled() {
        let fx = Fixture::new(2);
        let a = tempfile::tempfile().unwrap();
        fx.submit_write(a.as_raw_fd(), b"z", InFlight::User(Arc::new(Recorder::default())));

        let mut events = [IoEvent::default(); 2];
        let n = fx.poller().get_events(1, &mut events, None).unwrap();
        let mut out = Vec::new();
        fx.poller()
            .process(&events[..n], false, &mut Delivery::Collect(&mut out));
        assert!(fx.sim.syncs().is_empty());
    }

    #[test]
    fn unknown_descriptor_is_skipped() {
        let fx = Fixture::new(2);
        let bogus = [IoEvent {
            data: 99,
            ..IoEvent::default()
        }];
        let mut out = Vec::new();
        let batch = fx
            .poller()
            .process(&bogus, false, &mut Delivery::Collect(&mut out));
        assert_eq!(batch.handled, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn fast_path_percent() {
        let stats = PollStats {
            fast_path_hits: 3,
            syscall_fallbacks: 1,
            ..PollStats::default()
        };
        assert_eq!(stats.fast_path_percent(), 75.0);
        assert_eq!(PollStats::default().fast_path_percent(), 0.0);
    }
}
