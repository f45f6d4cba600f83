//! Condition variable and mutex benchmarks.
//!
//! Measures the uncontended fast paths and a two-CPU ping-pong where every
//! round trip is a pair of mutex handoffs.

mod common;

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use common::BenchStats;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quiesce_core::{Condvar, Machine, Mutex};

struct PingPong {
    cv: Condvar,
    mutex: Mutex,
    turn: AtomicU64,
    stop: AtomicBool,
}

/// Run `rounds` round trips against a partner on CPU 1.
fn ping_pong(machine: &Machine, rounds: u64) -> Duration {
    let shared = Arc::new(PingPong {
        cv: Condvar::new(),
        mutex: Mutex::new(),
        turn: AtomicU64::new(0),
        stop: AtomicBool::new(false),
    });
    let partner = {
        let s = Arc::clone(&shared);
        machine
            .spawn(1, "pong", move || {
                s.mutex.lock();
                loop {
                    s.cv.wait_until(&s.mutex, || {
                        s.turn.load(Ordering::Relaxed) % 2 == 1 || s.stop.load(Ordering::Relaxed)
                    });
                    if s.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    s.turn.fetch_add(1, Ordering::Relaxed);
                    s.cv.wake_one();
                }
                s.mutex.unlock();
            })
            .expect("spawn pong")
    };

    let s = &shared;
    let start = Instant::now();
    s.mutex.lock();
    for _ in 0..rounds {
        s.turn.fetch_add(1, Ordering::Relaxed);
        s.cv.wake_one();
        s.cv.wait_until(&s.mutex, || s.turn.load(Ordering::Relaxed) % 2 == 0);
    }
    let elapsed = start.elapsed();
    s.stop.store(true, Ordering::Relaxed);
    s.cv.wake_one();
    s.mutex.unlock();
    partner.join().expect("pong panicked");
    elapsed
}

fn bench_condvar(c: &mut Criterion) {
    let machine = Machine::new(2);
    let mut group = c.benchmark_group("condvar");
    group.throughput(Throughput::Elements(1));

    {
        let mutex = Mutex::new();
        let stats = RefCell::new(BenchStats::default());
        group.bench_function("mutex_lock_unlock", |b| {
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    mutex.lock();
                    black_box(&mutex);
                    mutex.unlock();
                }
                let dur = start.elapsed().max(Duration::from_nanos(1));
                stats.borrow_mut().record(iters, dur);
                dur
            });
        });
        stats.borrow().report("condvar", "mutex_lock_unlock", 1);
    }

    // No waiters: both wakes should be a single atomic load.
    {
        let cv = Condvar::new();
        group.bench_function("wake_one_empty", |b| b.iter(|| cv.wake_one()));
        group.bench_function("wake_all_empty", |b| b.iter(|| cv.wake_all()));
    }

    {
        let stats = RefCell::new(BenchStats::default());
        group.bench_function(BenchmarkId::new("ping_pong", 2), |b| {
            b.iter_custom(|iters| {
                let dur = ping_pong(&machine, iters).max(Duration::from_nanos(1));
                stats.borrow_mut().record(iters, dur);
                dur
            });
        });
        stats.borrow().report("condvar", "ping_pong", machine.ncpus());
    }

    group.finish();
}

criterion_group!(benches, bench_condvar);
criterion_main!(benches);
