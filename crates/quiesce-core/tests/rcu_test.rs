//! Reclamation engine behavior with real agents on a simulated machine.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use quiesce_core::sched::Machine;
use quiesce_core::{Rcu, RcuHashTable, RcuList, RcuPtr, SyncConfig};

const MAGIC: u64 = 0x5155_4945_5343_4521;

/// Poisons itself and raises a flag when dropped.
struct Canary {
    magic: AtomicU64,
    freed: Arc<AtomicBool>,
}

impl Canary {
    fn new(freed: &Arc<AtomicBool>) -> Self {
        Self {
            magic: AtomicU64::new(MAGIC),
            freed: Arc::clone(freed),
        }
    }

    fn alive(&self) -> bool {
        self.magic.load(Ordering::SeqCst) == MAGIC
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.magic.store(0, Ordering::SeqCst);
        self.freed.store(true, Ordering::SeqCst);
    }
}

/// Hash-table element that poisons itself when dropped.
struct Entry {
    key: u32,
    magic: AtomicU64,
}

impl Entry {
    fn new(key: u32) -> Self {
        Self {
            key,
            magic: AtomicU64::new(MAGIC),
        }
    }

    fn alive(&self) -> bool {
        self.magic.load(Ordering::SeqCst) == MAGIC
    }
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        assert!(self.alive(), "copied a freed entry");
        Self::new(self.key)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl std::hash::Hash for Entry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::borrow::Borrow<u32> for Entry {
    fn borrow(&self) -> &u32 {
        &self.key
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.magic.store(0, Ordering::SeqCst);
    }
}

fn config(cpus: usize) -> SyncConfig {
    SyncConfig::default().with_cpus(cpus)
}

fn started(cpus: usize) -> Arc<Rcu> {
    let cfg = config(cpus);
    Arc::new(Rcu::start_with(Arc::new(Machine::from_config(&cfg)), &cfg).unwrap())
}

fn counter_callback(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn synchronize_runs_callbacks_deferred_before_it() {
    for cpus in [1, 4] {
        let rcu = started(cpus);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            rcu.defer(counter_callback(&ran));
        }
        rcu.synchronize();
        assert_eq!(ran.load(Ordering::SeqCst), 10, "{cpus} cpus");
        let stats = rcu.stats();
        assert!(stats.cycles >= 1);
        assert!(stats.generation >= 1);
        assert_eq!(stats.stalls, 0);
    }
}

#[test]
fn reader_holds_off_disposal_until_it_leaves() {
    let rcu = started(2);
    let freed = Arc::new(AtomicBool::new(false));
    let ptr = Arc::new(RcuPtr::new(&rcu, Canary::new(&freed)));
    let holding = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let reader = {
        let rcu = Arc::clone(&rcu);
        let ptr = Arc::clone(&ptr);
        let holding = Arc::clone(&holding);
        let release = Arc::clone(&release);
        Arc::clone(rcu.machine())
            .spawn(1, "reader", move || {
                let guard = rcu.read_lock();
                let seen = ptr.read(&guard).expect("value published");
                holding.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                seen.alive()
            })
            .unwrap()
    };
    while !holding.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let other = Arc::new(AtomicBool::new(false));
    ptr.assign(Some(Canary::new(&other)), &rcu);
    let synchronizer = {
        let rcu = Arc::clone(&rcu);
        Arc::clone(rcu.machine())
            .spawn(0, "writer", move || rcu.synchronize())
            .unwrap()
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(!freed.load(Ordering::SeqCst), "disposed under an active reader");
    release.store(true, Ordering::SeqCst);

    assert!(reader.join().unwrap(), "reader observed a freed value");
    synchronizer.join().unwrap();
    assert!(freed.load(Ordering::SeqCst));
    assert!(!other.load(Ordering::SeqCst));
}

#[test]
fn list_readers_never_see_freed_nodes() {
    const CPUS: usize = 4;
    let rcu = started(CPUS);
    let list = Arc::new(RcuList::new(&rcu));
    let scratch = Arc::new(AtomicBool::new(false));
    for _ in 0..32 {
        list.push_front(Canary::new(&scratch));
    }
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (1..CPUS)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("reader{cpu}"), move || {
                    let mut visited = 0u64;
                    while !stop.load(Ordering::SeqCst) {
                        let guard = rcu.read_lock();
                        for node in list.iter(&guard) {
                            assert!(node.alive(), "reader reached a freed node");
                            visited += 1;
                        }
                    }
                    visited
                })
                .unwrap()
        })
        .collect();

    for round in 0..200 {
        list.remove_first(&rcu, |_| true);
        list.push_front(Canary::new(&scratch));
        if round % 25 == 0 {
            rcu.synchronize();
        }
    }
    stop.store(true, Ordering::SeqCst);
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    rcu.flush().unwrap();
    let stats = rcu.stats();
    assert_eq!(stats.deferred, stats.reclaimed);
    assert_eq!(list.len(), 32);
}

#[test]
fn hash_table_readers_survive_resizes() {
    const CPUS: usize = 4;
    const KEYS: u32 = 64;
    let rcu = started(CPUS);
    let table = Arc::new(RcuHashTable::new(&rcu));
    for key in 0..KEYS {
        table.insert(&rcu, Entry::new(key));
    }
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (1..CPUS)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("reader{cpu}"), move || {
                    let mut hits = 0u64;
                    while !stop.load(Ordering::SeqCst) {
                        let guard = rcu.read_lock();
                        for key in 0..KEYS {
                            if let Some(entry) = table.find(&guard, &key) {
                                assert!(entry.alive(), "lookup reached a freed entry");
                                assert_eq!(entry.key, key);
                                hits += 1;
                            }
                        }
                        table.for_each(&guard, |entry| {
                            assert!(entry.alive(), "walk reached a freed entry");
                        });
                    }
                    hits
                })
                .unwrap()
        })
        .collect();

    let grown = table.bucket_count();
    for round in 0..20 {
        // Drain to a handful and refill, so the array shrinks and grows.
        for key in 4..KEYS {
            assert!(table.erase(&rcu, &key));
        }
        assert!(table.bucket_count() < grown);
        for key in 4..KEYS {
            assert!(table.insert(&rcu, Entry::new(key)));
        }
        if round % 5 == 0 {
            rcu.synchronize();
        }
    }
    stop.store(true, Ordering::SeqCst);
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    rcu.flush().unwrap();
    let stats = rcu.stats();
    assert_eq!(stats.deferred, stats.reclaimed);
    assert_eq!(table.len(), KEYS as usize);
    assert_eq!(table.bucket_count(), grown);
}

#[test]
fn full_buffer_blocks_the_next_deferral_until_a_swap() {
    let cfg = config(1);
    let rcu = Arc::new(Rcu::new(Arc::new(Machine::from_config(&cfg)), &cfg));
    let ran = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for _ in 0..cfg.defer_capacity {
        rcu.defer(counter_callback(&ran));
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(rcu.stats().stalls, 0);

    let returned = Arc::new(AtomicBool::new(false));
    let overflow = {
        let rcu = Arc::clone(&rcu);
        let ran = Arc::clone(&ran);
        let returned = Arc::clone(&returned);
        Arc::clone(rcu.machine())
            .spawn(0, "overflow", move || {
                rcu.defer(counter_callback(&ran));
                returned.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::SeqCst), "deferral past capacity did not block");
    assert_eq!(rcu.stats().stalls, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    rcu.start().unwrap();
    overflow.join().unwrap();
    assert!(returned.load(Ordering::SeqCst));

    rcu.synchronize();
    assert_eq!(ran.load(Ordering::SeqCst), cfg.defer_capacity + 1);
}

#[test]
fn tiny_buffers_make_progress_under_sustained_deferral() {
    let cfg = config(2).with_defer_capacity(8);
    let rcu = Arc::new(Rcu::start_with(Arc::new(Machine::from_config(&cfg)), &cfg).unwrap());
    let ran = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..2)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            let ran = Arc::clone(&ran);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("deferrer{cpu}"), move || {
                    for _ in 0..500 {
                        rcu.defer(counter_callback(&ran));
                    }
                })
                .unwrap()
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    rcu.flush().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1000);
    assert!(rcu.stats().stalls > 0);
}

#[test]
fn generation_never_goes_backwards() {
    let rcu = started(3);
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let rcu = Arc::clone(&rcu);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut last = 0;
            let mut samples = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let now = rcu.generation();
                assert!(now >= last, "generation went from {last} to {now}");
                last = now;
                samples += 1;
            }
            samples
        })
    };
    let workers: Vec<_> = (0..3)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("sync{cpu}"), move || {
                    for _ in 0..20 {
                        rcu.dispose(Box::new(cpu));
                        rcu.synchronize();
                    }
                })
                .unwrap()
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    assert!(sampler.join().unwrap() > 0);
    assert!(rcu.generation() >= 20);
    for cpu in 0..3 {
        assert!(rcu.reached(cpu) <= rcu.generation());
    }
}

#[test]
fn flush_covers_every_cpu() {
    const CPUS: usize = 4;
    let rcu = started(CPUS);
    let ran = Arc::new(AtomicUsize::new(0));
    let deferrers: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            let ran = Arc::clone(&ran);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("deferrer{cpu}"), move || {
                    rcu.defer(counter_callback(&ran));
                })
                .unwrap()
        })
        .collect();
    for d in deferrers {
        d.join().unwrap();
    }
    rcu.flush().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), CPUS);
}

#[test]
fn nested_deferral_from_a_callback_completes() {
    let rcu = started(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let weak: Weak<Rcu> = Arc::downgrade(&rcu);
    {
        let ran = Arc::clone(&ran);
        rcu.defer(move || {
            if let Some(rcu) = weak.upgrade() {
                rcu.defer(counter_callback(&ran));
            }
        });
    }
    rcu.flush().unwrap();
    rcu.flush().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_overflowing_its_own_buffer_cycles_inline() {
    let cfg = config(1).with_defer_capacity(2);
    let rcu = Arc::new(Rcu::start_with(Arc::new(Machine::from_config(&cfg)), &cfg).unwrap());
    let ran = Arc::new(AtomicUsize::new(0));
    let weak: Weak<Rcu> = Arc::downgrade(&rcu);
    {
        let ran = Arc::clone(&ran);
        rcu.defer(move || {
            if let Some(rcu) = weak.upgrade() {
                for _ in 0..3 {
                    rcu.defer(counter_callback(&ran));
                }
            }
        });
    }

    let finished = Arc::new(AtomicBool::new(false));
    let synchronizer = {
        let rcu = Arc::clone(&rcu);
        let finished = Arc::clone(&finished);
        Arc::clone(rcu.machine())
            .spawn(0, "synchronizer", move || {
                for _ in 0..3 {
                    rcu.synchronize();
                }
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while !finished.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(finished.load(Ordering::SeqCst), "synchronize never returned");
    synchronizer.join().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    let stats = rcu.stats();
    assert_eq!(stats.deferred, stats.reclaimed);
    assert!(stats.stalls >= 1);
    // The agent survived and still drives cycles.
    rcu.defer(counter_callback(&ran));
    rcu.synchronize();
    assert_eq!(ran.load(Ordering::SeqCst), 4);
}

#[test]
fn last_handle_dropped_inside_a_callback_shuts_down() {
    let cfg = config(2).with_idle_flush(Some(Duration::from_millis(10)));
    let machine = Arc::new(Machine::from_config(&cfg));
    let rcu = Arc::new(Rcu::start_with(Arc::clone(&machine), &cfg).unwrap());
    let ran = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    {
        let held = Arc::clone(&rcu);
        let ran = Arc::clone(&ran);
        let dropped = Arc::clone(&dropped);
        rcu.defer(move || {
            while Arc::strong_count(&held) > 1 {
                std::thread::sleep(Duration::from_millis(1));
            }
            held.defer(counter_callback(&ran));
            drop(held);
            dropped.store(true, Ordering::SeqCst);
        });
    }
    drop(rcu);

    // Agents and the reaper each hold the machine until they exit.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Arc::strong_count(&machine) > 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(dropped.load(Ordering::SeqCst), "drop on the agent never returned");
    assert_eq!(Arc::strong_count(&machine), 1, "domain threads still running");
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_a_domain_never_discards_callbacks() {
    let ran = Arc::new(AtomicUsize::new(0));

    let cfg = config(2);
    let unstarted = Rcu::new(Arc::new(Machine::from_config(&cfg)), &cfg);
    unstarted.defer(counter_callback(&ran));
    drop(unstarted);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let running = Rcu::start_with(Arc::new(Machine::from_config(&cfg)), &cfg).unwrap();
    for _ in 0..5 {
        running.defer(counter_callback(&ran));
    }
    drop(running);
    assert_eq!(ran.load(Ordering::SeqCst), 6);
}

#[test]
fn read_sections_nest() {
    let rcu = started(1);
    let outer = rcu.read_lock();
    let inner = rcu.read_lock();
    assert_eq!(outer.cpu(), inner.cpu());
    drop(inner);
    drop(outer);
    rcu.synchronize();
}

#[test]
fn synchronize_inside_read_section_is_fatal() {
    let rcu = started(1);
    let offender = {
        let rcu = Arc::clone(&rcu);
        Arc::clone(rcu.machine())
            .spawn(0, "offender", move || {
                let _guard = rcu.read_lock();
                rcu.synchronize();
            })
            .unwrap()
    };
    assert!(offender.join().is_err());
    rcu.synchronize();
}

#[test]
fn synchronize_before_start_is_fatal() {
    let cfg = config(1);
    let rcu = Arc::new(Rcu::new(Arc::new(Machine::from_config(&cfg)), &cfg));
    let early = {
        let rcu = Arc::clone(&rcu);
        Arc::clone(rcu.machine()).spawn(0, "early", move || rcu.synchronize()).unwrap()
    };
    assert!(early.join().is_err());
}

#[test]
fn idle_flush_reclaims_without_a_nudge() {
    let cfg = config(2).with_idle_flush(Some(Duration::from_millis(10)));
    let rcu = Rcu::start_with(Arc::new(Machine::from_config(&cfg)), &cfg).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    rcu.defer(counter_callback(&ran));

    let deadline = Instant::now() + Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_writers_on_all_cpus_stay_live() {
    const CPUS: usize = 4;
    let rcu = started(CPUS);
    let workers: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let rcu = Arc::clone(&rcu);
            Arc::clone(rcu.machine())
                .spawn(cpu, format!("writer{cpu}"), move || {
                    for i in 0..200 {
                        rcu.dispose(Box::new([cpu; 16]));
                        if i % 20 == 0 {
                            rcu.synchronize();
                        }
                    }
                })
                .unwrap()
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    rcu.flush().unwrap();
    let stats = rcu.stats();
    assert_eq!(stats.deferred, stats.reclaimed);
}
