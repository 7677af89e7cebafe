//! Engine behaviour under injected kernel faults, using the simulated backend.

use safer_aio::{AioError, CompletionSink, Environment, IoContext, SimulatedAio};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Outcome {
    errors: Mutex<Vec<i32>>,
    done: AtomicUsize,
}

impl CompletionSink for Outcome {
    fn on_error(&self, code: i32, _message: &str) {
        self.errors.lock().unwrap().push(code);
    }

    fn done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    ctx: Arc<IoContext>,
    sim: SimulatedAio,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(depth: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::in_dir(dir.path()).unwrap();
        let sim = SimulatedAio::new(depth as usize).unwrap();
        let ctx = Arc::new(IoContext::with_backend(sim.clone(), depth, env).unwrap());
        Self { ctx, sim, dir }
    }

    fn file(&self, name: &str) -> File {
        safer_aio::file::open(self.dir.path().join(name), false).unwrap()
    }

    fn write(&self, fd: RawFd, data: &'static [u8], sink: &Arc<Outcome>) -> safer_aio::Result<()> {
        unsafe { self.ctx.submit_write(fd, 0, data.as_ptr(), data.len(), sink.clone()) }
    }

    fn spawn_poller(&self, use_fdatasync: bool) -> thread::JoinHandle<safer_aio::Result<()>> {
        let ctx = Arc::clone(&self.ctx);
        thread::spawn(move || ctx.blocking_poll(use_fdatasync))
    }

    /// Wait until the poller has entered the kernel wait `n` times.
    fn await_waits(&self, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.sim.syscall_waits() < n {
            assert!(Instant::now() < deadline, "poller never waited");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[test]
fn every_admitted_submission_completes_exactly_once() {
    const OPS: usize = 120;
    let h = Harness::new(8);
    let file = h.file("liveness");
    let sink = Arc::new(Outcome::default());

    let mut admitted = 0;
    let mut rejected = 0;
    let mut out = Vec::new();
    for i in 0..OPS {
        if i % 3 == 0 {
            h.sim.fail_next_submit(libc::EAGAIN);
        }
        match h.write(file.as_raw_fd(), b"entry", &sink) {
            Ok(()) => admitted += 1,
            Err(e) => {
                assert_eq!(e.raw_os_error(), Some(libc::EAGAIN));
                rejected += 1;
            }
        }
        // Keep the pool from filling
        h.ctx.try_poll(&mut out, 8).unwrap();
        for completion in out.drain(..) {
            completion.done();
        }
    }
    h.ctx.shutdown().unwrap();

    assert_eq!(rejected, OPS / 3);
    assert_eq!(admitted, OPS - OPS / 3);
    assert_eq!(sink.done.load(Ordering::SeqCst), admitted);
    assert_eq!(h.ctx.used().unwrap(), 0);
    assert_eq!(Arc::strong_count(&sink), 1);
    let stats = h.ctx.stats().unwrap();
    assert_eq!(stats.pool.in_use, 0);
}

#[test]
fn failed_operation_reports_error_then_done() {
    let h = Harness::new(4);
    let path = h.dir.path().join("readonly");
    std::fs::write(&path, b"").unwrap();
    let readonly = File::open(&path).unwrap();
    let sink = Arc::new(Outcome::default());

    let poller = h.spawn_poller(false);
    h.write(readonly.as_raw_fd(), b"nope", &sink).unwrap();
    h.ctx.shutdown().unwrap();
    poller.join().unwrap().unwrap();

    assert_eq!(*sink.errors.lock().unwrap(), vec![libc::EBADF]);
    assert_eq!(sink.done.load(Ordering::SeqCst), 1);
}

#[test]
fn interrupted_waits_do_not_stop_the_loop() {
    let h = Harness::new(4);
    let file = h.file("signals");
    let sink = Arc::new(Outcome::default());
    h.sim.hold_completions(true);

    let poller = h.spawn_poller(false);
    for _ in 0..3 {
        h.write(file.as_raw_fd(), b"abc", &sink).unwrap();
    }

    h.await_waits(1);
    h.sim.interrupt_next_wait();
    h.await_waits(2);
    h.sim.interrupt_next_wait();
    h.await_waits(3);
    assert_eq!(h.sim.pending_wait_failures(), 0);
    assert!(!poller.is_finished());

    h.sim.hold_completions(false);
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.done.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "completions were dropped");
        thread::sleep(Duration::from_millis(1));
    }

    h.ctx.shutdown().unwrap();
    poller.join().unwrap().unwrap();
    assert_eq!(sink.done.load(Ordering::SeqCst), 3);
    assert_eq!(h.ctx.used().unwrap(), 0);
}

#[test]
fn fatal_wait_error_ends_the_loop() {
    let h = Harness::new(4);
    let poller = h.spawn_poller(false);
    h.await_waits(1);
    h.sim.fail_next_wait(libc::EINVAL);

    let err = poller.join().unwrap().unwrap_err();
    assert!(matches!(err, AioError::Os { code, .. } if code == libc::EINVAL));

    // The poll lock was released, so shutdown can still drain
    h.ctx.shutdown().unwrap();
}

#[test]
fn backpressure_then_retry_after_one_completion() {
    let h = Harness::new(4);
    let file = h.file("backpressure");
    let sink = Arc::new(Outcome::default());
    h.sim.hold_completions(true);

    for _ in 0..4 {
        h.write(file.as_raw_fd(), b"data", &sink).unwrap();
    }
    let err = h.write(file.as_raw_fd(), b"data", &sink).unwrap_err();
    assert!(err.is_exhausted());

    assert!(h.sim.release_one());
    let mut out = Vec::new();
    assert_eq!(h.ctx.poll(&mut out, 1, 4).unwrap(), 1);
    h.write(file.as_raw_fd(), b"data", &sink).unwrap();
    assert_eq!(h.ctx.used().unwrap(), 4);

    h.sim.hold_completions(false);
    h.ctx.shutdown().unwrap();
    assert_eq!(h.ctx.used().unwrap(), 0);
}

#[test]
fn group_durability_syncs_once_per_file_run() {
    let h = Harness::new(8);
    let a = h.file("a");
    let b = h.file("b");
    let sink = Arc::new(Outcome::default());
    h.sim.hold_completions(true);

    let poller = h.spawn_poller(true);
    for fd in [a.as_raw_fd(), a.as_raw_fd(), b.as_raw_fd(), b.as_raw_fd(), a.as_raw_fd()] {
        h.write(fd, b"x", &sink).unwrap();
    }
    h.await_waits(1);
    h.sim.hold_completions(false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.done.load(Ordering::SeqCst) < 5 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    h.ctx.shutdown().unwrap();
    poller.join().unwrap().unwrap();

    assert_eq!(h.sim.syncs(), vec![a.as_raw_fd(), b.as_raw_fd(), a.as_raw_fd()]);
}

#[test]
fn shutdown_drains_every_in_flight_operation() {
    const IN_FLIGHT: usize = 8;
    let h = Harness::new(16);
    let file = h.file("drain");
    let sink = Arc::new(Outcome::default());
    h.sim.hold_completions(true);

    let poller = h.spawn_poller(false);
    for _ in 0..IN_FLIGHT {
        h.write(file.as_raw_fd(), b"pending", &sink).unwrap();
    }
    h.await_waits(1);

    let releaser = {
        let sim = h.sim.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sim.hold_completions(false);
        })
    };

    h.ctx.shutdown().unwrap();
    assert_eq!(h.ctx.used().unwrap(), 0);
    assert_eq!(sink.done.load(Ordering::SeqCst), IN_FLIGHT);

    releaser.join().unwrap();
    poller.join().unwrap().unwrap();
    assert!(h.ctx.is_closed());
}

#[test]
fn second_poller_waits_for_the_first() {
    let h = Harness::new(4);
    let file = h.file("exclusive");
    let sink = Arc::new(Outcome::default());
    h.sim.hold_completions(true);
    h.write(file.as_raw_fd(), b"one", &sink).unwrap();

    let first = {
        let ctx = Arc::clone(&h.ctx);
        thread::spawn(move || {
            let mut out = Vec::new();
            ctx.poll(&mut out, 1, 4).map(|n| (n, out.len()))
        })
    };
    h.await_waits(1);

    let second = {
        let ctx = Arc::clone(&h.ctx);
        thread::spawn(move || {
            let mut out = Vec::new();
            ctx.try_poll(&mut out, 4)
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!second.is_finished());

    h.sim.hold_completions(false);
    assert_eq!(first.join().unwrap().unwrap(), (1, 1));
    assert_eq!(second.join().unwrap().unwrap(), 0);
}

#[test]
fn submissions_racing_shutdown_are_all_delivered() {
    for _ in 0..20 {
        let h = Harness::new(8);
        let file = Arc::new(h.file("race"));
        let sink = Arc::new(Outcome::default());

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&h.ctx);
                let file = Arc::clone(&file);
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let mut admitted = 0usize;
                    loop {
                        let result = unsafe {
                            ctx.submit_write(file.as_raw_fd(), 0, b"r".as_ptr(), 1, sink.clone())
                        };
                        match result {
                            Ok(()) => admitted += 1,
                            Err(AioError::ContextClosed) => return admitted,
                            Err(e) if e.is_exhausted() => thread::yield_now(),
                            Err(e) => panic!("unexpected submit error: {e}"),
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        h.ctx.shutdown().unwrap();
        let admitted: usize = submitters.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(sink.done.load(Ordering::SeqCst), admitted);
        assert_eq!(h.ctx.used().unwrap(), 0);
        assert!(h.sim.is_closed());
    }
}
