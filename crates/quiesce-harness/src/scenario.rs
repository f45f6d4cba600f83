//! Executable stress scenarios.
//!
//! Each scenario drives real threads on a freshly built [`Machine`] and
//! checks one guarantee of the synchronization layer. A broken guarantee is
//! reported as [`HarnessError::Violation`]; a thread that died on a contract
//! assertion as [`HarnessError::Panicked`].

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use quiesce_core::sched::SpawnedThread;
use quiesce_core::{Condvar, Machine, Mutex, Rcu, RcuList, RcuPtr, SyncConfig, WaitStatus};

use crate::error::HarnessError;
use crate::runner::millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Three waiters on one CPU receive the mutex from `wake_all` in
    /// arrival order, one at a time.
    FifoHandoff,
    /// A reader standing on a list keeps a concurrently unlinked node alive
    /// until its traversal ends.
    ReaderSafety,
    /// One deferral past a full buffer blocks until the agent swaps, and
    /// nothing is dropped.
    Backpressure,
    /// An unwoken timed wait times out and leaves the queue empty.
    Timeout,
    /// A wake landing around a waiter's deadline yields exactly one outcome.
    TimeoutRace,
    /// A producer publishing snapshots while consumers on every CPU read them.
    Stress,
}

impl Scenario {
    pub const ALL: [Self; 6] = [
        Self::FifoHandoff,
        Self::ReaderSafety,
        Self::Backpressure,
        Self::Timeout,
        Self::TimeoutRace,
        Self::Stress,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FifoHandoff => "fifo-handoff",
            Self::ReaderSafety => "reader-safety",
            Self::Backpressure => "backpressure",
            Self::Timeout => "timeout",
            Self::TimeoutRace => "timeout-race",
            Self::Stress => "stress",
        }
    }

    /// One-line description for listings.
    #[must_use]
    pub const fn summary(self) -> &'static str {
        match self {
            Self::FifoHandoff => "wake_all hands the mutex to same-CPU waiters in FIFO order",
            Self::ReaderSafety => "an unlinked node outlives the reader standing next to it",
            Self::Backpressure => "a deferral past a full buffer blocks until a swap",
            Self::Timeout => "an unwoken timed wait removes itself from the queue",
            Self::TimeoutRace => "a wake racing a deadline has exactly one outcome",
            Self::Stress => "mixed condvar and rcu traffic on every cpu",
        }
    }

    /// Fewest simulated CPUs the workload needs.
    #[must_use]
    pub const fn min_cpus(self) -> usize {
        match self {
            Self::ReaderSafety | Self::TimeoutRace => 2,
            _ => 1,
        }
    }

    pub(crate) fn execute(self, workload: &Workload) -> Result<Value, HarnessError> {
        match self {
            Self::FifoHandoff => fifo_handoff(workload),
            Self::ReaderSafety => reader_safety(workload),
            Self::Backpressure => backpressure(workload),
            Self::Timeout => timeout(workload),
            Self::TimeoutRace => timeout_race(workload),
            Self::Stress => stress(workload),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| HarnessError::UnknownScenario(s.to_string()))
    }
}

/// Sizing shared by every scenario of one run.
#[derive(Debug, Clone)]
pub(crate) struct Workload {
    pub(crate) config: SyncConfig,
    pub(crate) iterations: u32,
}

impl Workload {
    fn machine(&self) -> Arc<Machine> {
        Arc::new(Machine::from_config(&self.config))
    }

    fn last_cpu(&self) -> usize {
        self.config.cpus - 1
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Bound on how long one thread waits for another to reach a checkpoint.
const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline used by the timed-wait scenarios.
const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

const LIVE: u64 = 0x5155_4945_5343_454c;
const POISON: u64 = 0xdead_dead_dead_dead;

fn checkpoint(what: &str, mut reached: impl FnMut() -> bool) -> Result<(), HarnessError> {
    let deadline = Instant::now() + CHECKPOINT_TIMEOUT;
    while !reached() {
        if Instant::now() >= deadline {
            return Err(HarnessError::Violation(format!(
                "timed out waiting for {what}"
            )));
        }
        std::thread::yield_now();
    }
    Ok(())
}

fn ensure(holds: bool, violation: impl FnOnce() -> String) -> Result<(), HarnessError> {
    if holds {
        Ok(())
    } else {
        Err(HarnessError::Violation(violation()))
    }
}

fn join<T>(spawned: SpawnedThread<T>) -> Result<T, HarnessError> {
    let thread = spawned.thread().name().to_string();
    spawned.join().map_err(|payload| HarnessError::Panicked {
        thread,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One condition variable, its mutex, and a record of who held the mutex.
struct Handoff {
    cv: Condvar,
    mutex: Mutex,
    holders: AtomicUsize,
    order: parking_lot::Mutex<Vec<&'static str>>,
}

impl Handoff {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cv: Condvar::new(),
            mutex: Mutex::new(),
            holders: AtomicUsize::new(0),
            order: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

/// What a waiter saw when its `wait` returned.
struct WaitOutcome {
    status: WaitStatus,
    waited: Duration,
    owned: bool,
    alone: bool,
}

/// Start a waiter on `cpu` and return once it is queued.
fn spawn_waiter(
    machine: &Machine,
    shared: &Arc<Handoff>,
    cpu: usize,
    name: &'static str,
    timeout: Option<Duration>,
) -> Result<SpawnedThread<WaitOutcome>, HarnessError> {
    let before = shared.cv.waiters();
    let waiter = {
        let s = Arc::clone(shared);
        machine.spawn(cpu, name, move || {
            s.mutex.lock();
            let start = Instant::now();
            let status = match timeout {
                Some(timeout) => s.cv.wait_timeout(&s.mutex, timeout),
                None => s.cv.wait(&s.mutex, None),
            };
            let waited = start.elapsed();
            let owned = s.mutex.owned_by_current();
            let alone = s.holders.fetch_add(1, Ordering::SeqCst) == 0;
            s.order.lock().push(name);
            // Give a second owner, if there were one, time to show up.
            std::thread::yield_now();
            s.holders.fetch_sub(1, Ordering::SeqCst);
            s.mutex.unlock();
            WaitOutcome {
                status,
                waited,
                owned,
                alone,
            }
        })?
    };
    checkpoint(&format!("{name} to queue"), || {
        shared.cv.waiters() > before
    })?;
    Ok(waiter)
}

fn check_woken(round: u32, name: &str, outcome: &WaitOutcome) -> Result<(), HarnessError> {
    ensure(outcome.status == WaitStatus::Woken, || {
        format!("round {round}: {name} returned {:?}", outcome.status)
    })?;
    check_owned(round, name, outcome)
}

fn check_owned(round: u32, name: &str, outcome: &WaitOutcome) -> Result<(), HarnessError> {
    ensure(outcome.owned, || {
        format!("round {round}: {name} returned without the mutex")
    })?;
    ensure(outcome.alone, || {
        format!("round {round}: {name} shared the mutex with another thread")
    })
}

/// The condition variable is empty and the mutex is free.
fn check_settled(round: u32, s: &Handoff) -> Result<(), HarnessError> {
    ensure(!s.cv.has_waiters(), || {
        format!("round {round}: {} wait records left queued", s.cv.waiters())
    })?;
    ensure(s.mutex.try_lock(), || {
        format!("round {round}: mutex left owned")
    })?;
    s.mutex.unlock();
    Ok(())
}

// ---------------------------------------------------------------------------
// fifo-handoff
// ---------------------------------------------------------------------------

fn fifo_handoff(w: &Workload) -> Result<Value, HarnessError> {
    const NAMES: [&str; 3] = ["A", "B", "C"];
    let machine = w.machine();
    for round in 0..w.iterations {
        let s = Handoff::new();
        let waiters = NAMES
            .iter()
            .map(|&name| spawn_waiter(&machine, &s, 0, name, None))
            .collect::<Result<Vec<_>, _>>()?;

        let waker = {
            let s = Arc::clone(&s);
            machine.spawn(w.last_cpu(), "D", move || s.cv.wake_all())?
        };
        join(waker)?;
        for (name, waiter) in NAMES.iter().zip(waiters) {
            check_woken(round, name, &join(waiter)?)?;
        }

        let order = s.order.lock().clone();
        ensure(order == NAMES, || {
            format!("round {round}: handoff order {order:?}, expected {NAMES:?}")
        })?;
        check_settled(round, &s)?;
    }
    Ok(json!({
        "rounds": w.iterations,
        "waiters": NAMES.len(),
        "waker_cpu": w.last_cpu(),
    }))
}

// ---------------------------------------------------------------------------
// reader-safety
// ---------------------------------------------------------------------------

/// Tracks reclamation relative to a reader's traversal.
#[derive(Default)]
struct Lookout {
    reader_done: AtomicBool,
    early_frees: AtomicUsize,
    frees: AtomicUsize,
}

impl Lookout {
    /// A lookout with no traversal to protect.
    fn settled() -> Arc<Self> {
        let lookout = Self::default();
        lookout.reader_done.store(true, Ordering::SeqCst);
        Arc::new(lookout)
    }
}

struct Node {
    id: u32,
    magic: AtomicU64,
    lookout: Arc<Lookout>,
}

impl Node {
    fn new(id: u32, lookout: &Arc<Lookout>) -> Self {
        Self {
            id,
            magic: AtomicU64::new(LIVE),
            lookout: Arc::clone(lookout),
        }
    }

    fn live(&self) -> bool {
        self.magic.load(Ordering::SeqCst) == LIVE
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.magic.store(POISON, Ordering::SeqCst);
        if !self.lookout.reader_done.load(Ordering::SeqCst) {
            self.lookout.early_frees.fetch_add(1, Ordering::SeqCst);
        }
        self.lookout.frees.fetch_add(1, Ordering::SeqCst);
    }
}

fn reader_safety(w: &Workload) -> Result<Value, HarnessError> {
    const NODES: u32 = 8;
    const DOOMED: u32 = 1;
    let machine = w.machine();
    let rcu = Arc::new(Rcu::start_with(Arc::clone(&machine), &w.config)?);

    for round in 0..w.iterations {
        let lookout = Arc::new(Lookout::default());
        let list = Arc::new(RcuList::new(&rcu));
        for id in (0..NODES).rev() {
            list.push_front(Node::new(id, &lookout));
        }
        let standing = Arc::new(AtomicBool::new(false));
        let unlinked = Arc::new(AtomicBool::new(false));

        let reader = {
            let (rcu, list, lookout) = (Arc::clone(&rcu), Arc::clone(&list), Arc::clone(&lookout));
            let (standing, unlinked) = (Arc::clone(&standing), Arc::clone(&unlinked));
            machine.spawn(0, "R", move || -> Result<(Vec<u32>, usize), HarnessError> {
                let guard = rcu.read_lock();
                let mut walk = list.iter(&guard);
                let mut visited = Vec::new();
                let mut poisoned = 0;
                // Stand on the head; the walk has already loaded its successor.
                if let Some(head) = walk.next() {
                    visited.push(head.id);
                }
                standing.store(true, Ordering::SeqCst);
                checkpoint("W to unlink the next node", || {
                    unlinked.load(Ordering::SeqCst)
                })?;
                for node in walk {
                    if !node.live() {
                        poisoned += 1;
                    }
                    visited.push(node.id);
                }
                lookout.reader_done.store(true, Ordering::SeqCst);
                drop(guard);
                Ok((visited, poisoned))
            })?
        };

        let writer = {
            let (rcu, list) = (Arc::clone(&rcu), Arc::clone(&list));
            machine.spawn(1, "W", move || -> Result<bool, HarnessError> {
                checkpoint("R to enter the list", || standing.load(Ordering::SeqCst))?;
                let removed = list.remove_first(&rcu, |node| node.id == DOOMED);
                unlinked.store(true, Ordering::SeqCst);
                rcu.synchronize();
                Ok(removed)
            })?
        };

        let (visited, poisoned) = join(reader)??;
        let removed = join(writer)??;
        ensure(removed, || format!("round {round}: node {DOOMED} was not in the list"))?;
        ensure(visited.contains(&DOOMED), || {
            format!("round {round}: reader skipped the unlinked node, walked {visited:?}")
        })?;
        ensure(poisoned == 0, || {
            format!("round {round}: reader walked {poisoned} reclaimed nodes")
        })?;
        let early = lookout.early_frees.load(Ordering::SeqCst);
        ensure(early == 0, || {
            format!("round {round}: {early} nodes reclaimed during the traversal")
        })?;
        // The writer's synchronize covers its own CPU's buffer.
        ensure(lookout.frees.load(Ordering::SeqCst) == 1, || {
            format!("round {round}: synchronize returned before the unlinked node was reclaimed")
        })?;
    }

    let churn = churn(w, &machine, &rcu)?;
    rcu.flush()?;
    let stats = rcu.stats();
    ensure(stats.deferred == stats.reclaimed, || {
        format!(
            "flush left {} of {} callbacks unrun",
            stats.deferred - stats.reclaimed,
            stats.deferred
        )
    })?;
    Ok(json!({
        "rounds": w.iterations,
        "nodes": NODES,
        "churn_updates": churn.0,
        "churn_walks": churn.1,
        "cycles": stats.cycles,
        "reclaimed": stats.reclaimed,
    }))
}

/// Readers on every CPU but the writer's walk the list while the writer on
/// CPU 1 keeps replacing it. Returns (updates, walks).
fn churn(w: &Workload, machine: &Machine, rcu: &Arc<Rcu>) -> Result<(u64, u64), HarnessError> {
    const WRITER_CPU: usize = 1;
    const KEEP: u32 = 8;
    let updates = u64::from(w.iterations) * 50;
    let lookout = Lookout::settled();
    let list = Arc::new(RcuList::<Node>::new(rcu));
    let stop = Arc::new(AtomicBool::new(false));
    let poisoned = Arc::new(AtomicUsize::new(0));

    let readers = (0..machine.ncpus())
        .filter(|&cpu| cpu != WRITER_CPU)
        .map(|cpu| {
            let (rcu, list) = (Arc::clone(rcu), Arc::clone(&list));
            let (stop, poisoned) = (Arc::clone(&stop), Arc::clone(&poisoned));
            machine.spawn(cpu, format!("reader{cpu}"), move || {
                let mut walks = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    let guard = rcu.read_lock();
                    let dead = list.iter(&guard).filter(|node| !node.live()).count();
                    poisoned.fetch_add(dead, Ordering::SeqCst);
                    drop(guard);
                    walks += 1;
                    std::thread::yield_now();
                }
                walks
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let writer = {
        let (rcu, list) = (Arc::clone(rcu), Arc::clone(&list));
        machine.spawn(WRITER_CPU, "writer", move || {
            for next in 0..updates {
                let id = u32::try_from(next).unwrap_or(u32::MAX);
                list.push_front(Node::new(id, &lookout));
                list.retain(&rcu, |node| node.id.saturating_add(KEEP) > id);
            }
        })?
    };
    let written = join(writer);
    stop.store(true, Ordering::SeqCst);
    let mut walks = 0;
    for reader in readers {
        walks += join(reader)?;
    }
    written?;

    let dead = poisoned.load(Ordering::SeqCst);
    ensure(dead == 0, || {
        format!("readers walked {dead} reclaimed nodes during churn")
    })?;
    Ok((updates, walks))
}

// ---------------------------------------------------------------------------
// backpressure
// ---------------------------------------------------------------------------

fn backpressure(w: &Workload) -> Result<Value, HarnessError> {
    /// How long the overflowing deferral must stay blocked.
    const HOLD: Duration = Duration::from_millis(25);
    let capacity = w.config.defer_capacity;
    let mut slowest_fill = Duration::ZERO;

    for round in 0..w.iterations {
        let machine = w.machine();
        let rcu = Arc::new(Rcu::new(Arc::clone(&machine), &w.config));
        let ran = Arc::new(AtomicUsize::new(0));
        let filled = Arc::new(AtomicBool::new(false));
        let returned = Arc::new(AtomicBool::new(false));

        let deferrer = {
            let (rcu, ran) = (Arc::clone(&rcu), Arc::clone(&ran));
            let (filled, returned) = (Arc::clone(&filled), Arc::clone(&returned));
            machine.spawn(0, "W", move || {
                let start = Instant::now();
                for _ in 0..capacity {
                    let ran = Arc::clone(&ran);
                    rcu.defer(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                }
                let fill = start.elapsed();
                filled.store(true, Ordering::SeqCst);
                let ran = Arc::clone(&ran);
                rcu.defer(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                });
                returned.store(true, Ordering::SeqCst);
                fill
            })?
        };

        checkpoint("the buffer to fill", || filled.load(Ordering::SeqCst))?;
        checkpoint("the overflowing deferral to stall", || {
            rcu.stats().stalls > 0
        })?;
        std::thread::sleep(HOLD);
        ensure(!returned.load(Ordering::SeqCst), || {
            format!(
                "round {round}: deferral {} returned with no agent running",
                capacity + 1
            )
        })?;
        let stats = rcu.stats();
        ensure(stats.stalls == 1 && stats.deferred == capacity as u64, || {
            format!(
                "round {round}: {} deferrals accepted and {} stalls before the swap",
                stats.deferred, stats.stalls
            )
        })?;
        ensure(ran.load(Ordering::SeqCst) == 0, || {
            format!("round {round}: callbacks ran before any grace period")
        })?;

        rcu.start()?;
        slowest_fill = slowest_fill.max(join(deferrer)?);
        rcu.flush()?;
        let total = ran.load(Ordering::SeqCst);
        ensure(total == capacity + 1, || {
            format!(
                "round {round}: {total} of {} callbacks ran",
                capacity + 1
            )
        })?;
    }
    Ok(json!({
        "rounds": w.iterations,
        "capacity": capacity,
        "slowest_fill_us": u64::try_from(slowest_fill.as_micros()).unwrap_or(u64::MAX),
        "hold_ms": millis(HOLD),
    }))
}

// ---------------------------------------------------------------------------
// timeout
// ---------------------------------------------------------------------------

fn timeout(w: &Workload) -> Result<Value, HarnessError> {
    let machine = w.machine();
    let mut longest = Duration::ZERO;
    for round in 0..w.iterations {
        let s = Handoff::new();
        let waiter = spawn_waiter(&machine, &s, 0, "A", Some(WAIT_TIMEOUT))?;
        let outcome = join(waiter)?;
        ensure(outcome.status == WaitStatus::TimedOut, || {
            format!("round {round}: unwoken wait returned {:?}", outcome.status)
        })?;
        check_owned(round, "A", &outcome)?;
        ensure(outcome.waited >= WAIT_TIMEOUT, || {
            format!("round {round}: timed out after only {:?}", outcome.waited)
        })?;
        longest = longest.max(outcome.waited);

        // A late waker must find nothing to hand the mutex to.
        let late = {
            let s = Arc::clone(&s);
            machine.spawn(w.last_cpu(), "B", move || {
                let queued = s.cv.waiters();
                s.cv.wake_all();
                queued
            })?
        };
        let queued = join(late)?;
        ensure(queued == 0, || {
            format!("round {round}: {queued} records still queued after the timeout")
        })?;
        check_settled(round, &s)?;
    }
    Ok(json!({
        "rounds": w.iterations,
        "timeout_ms": millis(WAIT_TIMEOUT),
        "longest_wait_us": u64::try_from(longest.as_micros()).unwrap_or(u64::MAX),
    }))
}

// ---------------------------------------------------------------------------
// timeout-race
// ---------------------------------------------------------------------------

fn timeout_race(w: &Workload) -> Result<Value, HarnessError> {
    /// Wake offsets sweep the deadline in this many steps.
    const STEPS: u32 = 13;
    const FIRST_OFFSET: Duration = Duration::from_millis(47);
    const STEP: Duration = Duration::from_micros(500);
    let rounds = w.iterations.saturating_mul(4);
    let machine = w.machine();
    let (mut woken, mut timed_out) = (0u32, 0u32);

    for round in 0..rounds {
        let s = Handoff::new();
        let a = spawn_waiter(&machine, &s, 0, "A", Some(WAIT_TIMEOUT))?;
        let armed = Instant::now();
        // A bystander queued behind A takes B's wake if A has already left.
        let c = spawn_waiter(&machine, &s, 0, "C", None)?;

        let offset = FIRST_OFFSET + STEP * (round % STEPS);
        let b = {
            let s = Arc::clone(&s);
            machine.spawn(1, "B", move || {
                if let Some(rest) = (armed + offset).checked_duration_since(Instant::now()) {
                    std::thread::sleep(rest);
                }
                s.cv.wake_one();
            })?
        };
        join(b)?;
        let a = join(a)?;
        check_owned(round, "A", &a)?;

        let reached_c = !s.cv.has_waiters();
        match a.status {
            WaitStatus::Woken => {
                woken += 1;
                ensure(!reached_c, || {
                    format!("round {round}: one wake_one released both A and C")
                })?;
                s.cv.wake_one();
            }
            WaitStatus::TimedOut => {
                timed_out += 1;
                ensure(reached_c, || {
                    format!("round {round}: A timed out yet B's wake released nobody")
                })?;
            }
        }
        check_woken(round, "C", &join(c)?)?;
        check_settled(round, &s)?;
    }
    Ok(json!({
        "rounds": rounds,
        "woken": woken,
        "timed_out": timed_out,
        "timeout_ms": millis(WAIT_TIMEOUT),
    }))
}

// ---------------------------------------------------------------------------
// stress
// ---------------------------------------------------------------------------

/// Versioned configuration published through an [`RcuPtr`].
struct Snapshot {
    version: u64,
    magic: AtomicU64,
}

impl Snapshot {
    fn new(version: u64) -> Self {
        Self {
            version,
            magic: AtomicU64::new(LIVE),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.magic.store(POISON, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ConsumerTally {
    taken: usize,
    torn: usize,
    regressions: usize,
}

fn stress(w: &Workload) -> Result<Value, HarnessError> {
    const ITEMS_PER_ITERATION: usize = 500;
    const PUBLISH_EVERY: usize = 16;
    let items = w.iterations as usize * ITEMS_PER_ITERATION;
    let machine = w.machine();
    let rcu = Arc::new(Rcu::start_with(Arc::clone(&machine), &w.config)?);
    let snapshot = Arc::new(RcuPtr::new(&rcu, Snapshot::new(0)));
    let queue = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
    let s = Handoff::new();
    let done = Arc::new(AtomicBool::new(false));

    let consumers = (0..machine.ncpus())
        .map(|cpu| {
            let (rcu, snapshot) = (Arc::clone(&rcu), Arc::clone(&snapshot));
            let (queue, s, done) = (Arc::clone(&queue), Arc::clone(&s), Arc::clone(&done));
            machine.spawn(cpu, format!("consumer{cpu}"), move || {
                let mut tally = ConsumerTally::default();
                let mut newest = 0;
                loop {
                    s.mutex.lock();
                    s.cv.wait_until(&s.mutex, || {
                        !queue.lock().is_empty() || done.load(Ordering::SeqCst)
                    });
                    let item = queue.lock().pop_front();
                    s.mutex.unlock();
                    if item.is_none() {
                        break;
                    }
                    tally.taken += 1;
                    let guard = rcu.read_lock();
                    if let Some(snap) = snapshot.read(&guard) {
                        if snap.magic.load(Ordering::SeqCst) != LIVE {
                            tally.torn += 1;
                        }
                        if snap.version < newest {
                            tally.regressions += 1;
                        }
                        newest = newest.max(snap.version);
                    }
                }
                tally
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let producer = {
        let (rcu, snapshot) = (Arc::clone(&rcu), Arc::clone(&snapshot));
        let (queue, s) = (Arc::clone(&queue), Arc::clone(&s));
        machine.spawn(w.last_cpu(), "producer", move || {
            let mut version = 0;
            for item in 0..items {
                s.mutex.with_lock(|| {
                    queue.lock().push_back(item);
                    s.cv.wake_one();
                });
                if item % PUBLISH_EVERY == 0 {
                    version += 1;
                    snapshot.assign(Some(Snapshot::new(version)), &rcu);
                }
            }
            version
        })?
    };
    let published = join(producer);
    s.mutex.with_lock(|| {
        done.store(true, Ordering::SeqCst);
        s.cv.wake_all();
    });
    let mut total = ConsumerTally::default();
    for consumer in consumers {
        let tally = join(consumer)?;
        total.taken += tally.taken;
        total.torn += tally.torn;
        total.regressions += tally.regressions;
    }
    let published = published?;

    ensure(total.taken == items, || {
        format!("consumers took {} of {items} items", total.taken)
    })?;
    ensure(total.torn == 0, || {
        format!("readers saw {} reclaimed snapshots", total.torn)
    })?;
    ensure(total.regressions == 0, || {
        format!("readers saw the snapshot go back {} times", total.regressions)
    })?;

    rcu.flush()?;
    let stats = rcu.stats();
    ensure(stats.deferred == stats.reclaimed, || {
        format!(
            "flush left {} of {} callbacks unrun",
            stats.deferred - stats.reclaimed,
            stats.deferred
        )
    })?;
    ensure(!s.cv.has_waiters(), || "consumers left queued".to_string())?;
    Ok(json!({
        "items": items,
        "consumers": machine.ncpus(),
        "snapshots_published": published,
        "cycles": stats.cycles,
        "generation": stats.generation,
        "stalls": stats.stalls,
    }))
}
