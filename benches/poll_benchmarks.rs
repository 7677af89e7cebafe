use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use safer_aio::ring::{CompletionRing, OwnedRing, RingRead};
use safer_aio::sys::IoEvent;
use safer_aio::{CompletionSink, DescriptorPool, Environment, IoContext, SimulatedAio};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

struct Noop;

impl CompletionSink for Noop {
    fn on_error(&self, _code: i32, _message: &str) {}
    fn done(&self) {}
}

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("descriptor_pool");

    for capacity in [64usize, 4096].iter() {
        group.bench_with_input(
            BenchmarkId::new("acquire_release", capacity),
            capacity,
            |b, &capacity| {
                let pool = DescriptorPool::new(capacity).unwrap();
                b.iter(|| {
                    let id = pool.acquire().unwrap().unwrap();
                    pool.release(black_box(id)).unwrap();
                })
            },
        );

        group.bench_with_input(BenchmarkId::new("fill_drain", capacity), capacity, |b, &capacity| {
            let pool = DescriptorPool::new(capacity).unwrap();
            let mut ids = Vec::with_capacity(capacity);
            b.iter(|| {
                while let Some(id) = pool.acquire().unwrap() {
                    ids.push(id);
                }
                for id in ids.drain(..) {
                    pool.release(id).unwrap();
                }
            })
        });
    }

    group.finish();
}

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("completion_ring");

    for batch in [1usize, 16, 128].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("push_reap", batch), batch, |b, &batch| {
            let ring = OwnedRing::new(256).unwrap();
            let reader = unsafe { CompletionRing::from_raw(ring.header()) };
            let mut events = vec![IoEvent::default(); batch];
            b.iter(|| {
                for seq in 0..batch as u64 {
                    ring.push(IoEvent {
                        data: seq,
                        ..IoEvent::default()
                    });
                }
                match reader.reap(batch, &mut events, false) {
                    RingRead::Copied(n) => black_box(n),
                    other => panic!("unexpected {other:?}"),
                };
            })
        });
    }

    group.finish();
}

fn bench_context(c: &mut Criterion) {
    let mut group = c.benchmark_group("context_submit_poll");
    group.measurement_time(Duration::from_secs(5));

    let dir = tempfile::tempdir().unwrap();
    let file = safer_aio::file::open(dir.path().join("bench"), false).unwrap();
    let data = [0u8; 512];

    for fast_path in [true, false] {
        let name = if fast_path { "ring" } else { "syscall" };
        group.bench_function(BenchmarkId::new(name, 32), |b| {
            let env = Environment::in_dir(dir.path()).unwrap();
            let sim = SimulatedAio::new(64).unwrap();
            sim.set_fast_path(fast_path);
            let ctx = IoContext::with_backend(sim, 64, env).unwrap();
            let sink: Arc<Noop> = Arc::new(Noop);
            let mut out = Vec::with_capacity(64);

            b.iter(|| {
                for _ in 0..32 {
                    unsafe {
                        ctx.submit_write(file.as_raw_fd(), 0, data.as_ptr(), data.len(), sink.clone())
                            .unwrap();
                    }
                }
                let mut harvested = 0;
                while harvested < 32 {
                    harvested += ctx.poll(&mut out, 1, 64).unwrap();
                }
                out.clear();
            });
            ctx.shutdown().unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool, bench_ring, bench_context);
criterion_main!(benches);
