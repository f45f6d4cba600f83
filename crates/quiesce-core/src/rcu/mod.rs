//! Epoch-based deferred reclamation (RCU).
//!
//! Readers enter a read-side critical section with [`Rcu::read_lock`] and
//! take no other lock. Writers unpublish an object and hand its destruction
//! to [`Rcu::defer`] (or [`Rcu::dispose`]); the callback runs only after
//! every CPU has passed a quiescent state, so no reader that could have seen
//! the object is still running.
//!
//! # Design
//!
//! - A read-side critical section is a preemption-disabled scope on the
//!   reader's CPU. Acquiring a CPU's preemption token is therefore proof that
//!   the CPU is quiescent.
//! - Each CPU has a double-buffered [`DeferStore`](defer) of callbacks and a
//!   long-lived agent thread (see [`agent`]). Agents drive cycles: retire a
//!   full buffer, allocate a generation from the domain-wide counter, and
//!   wait until every agent has reached it before draining.
//! - Deferral is bounded. A full buffer blocks the deferring thread until
//!   its CPU's agent swaps buffers; nothing is ever dropped.

mod agent;
mod defer;
#[allow(unsafe_code)]
mod hashtable;
#[allow(unsafe_code)]
mod list;
#[allow(unsafe_code)]
mod ptr;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::sched::{
    CpuId, Machine, PerCpu, PreemptGuard, Semaphore, SpawnedThread, migration_lock, preempt_depth,
};

use agent::Agent;
use defer::DeferStore;

pub use defer::Callback;
pub use hashtable::RcuHashTable;
pub use list::{Iter, RcuList};
pub use ptr::RcuPtr;

// ---------------------------------------------------------------------------
// Shared domain state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    deferred: AtomicU64,
    reclaimed: AtomicU64,
    stalls: AtomicU64,
}

struct Domain {
    machine: Arc<Machine>,
    stores: PerCpu<DeferStore>,
    agents: Box<[Agent]>,
    /// Domain-wide generation counter. Only ever incremented.
    next_generation: AtomicU64,
    capacity: usize,
    idle_flush: Option<Duration>,
    started: AtomicBool,
    stopping: AtomicBool,
    counters: Counters,
}

impl Domain {
    fn defer(&self, mut callback: Callback) {
        loop {
            let guard = self.machine.preempt_disable();
            let cpu = guard.cpu();
            let agent = &self.agents[cpu];
            let pushed = self.stores.get(&guard).push(callback);
            match pushed {
                Ok(len) => {
                    agent.set_pending(len);
                    self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(rejected) => callback = rejected,
            }

            assert_eq!(
                preempt_depth(),
                1,
                "rcu defer would block for buffer room inside a read-side critical section"
            );
            self.counters.stalls.fetch_add(1, Ordering::Relaxed);
            if agent.thread.is_current() {
                // One of this agent's callbacks filled the buffer. Nobody else
                // can swap it, so run a cycle right here.
                drop(guard);
                self.cycle_inline(cpu);
                continue;
            }
            let seen = agent.swaps();
            if self.started.load(Ordering::Acquire) {
                log::warn!(
                    "rcu defer buffer on cpu {cpu} is full ({} slots); waiting for a swap",
                    self.capacity
                );
            } else {
                log::warn!(
                    "rcu defer buffer on cpu {cpu} is full ({} slots); waiting for the domain to start",
                    self.capacity
                );
            }
            agent.wake();
            drop(guard);
            agent.room.wait_until(|| agent.swaps() != seen);
        }
    }

    fn synchronize(&self) {
        assert_eq!(
            preempt_depth(),
            0,
            "rcu synchronize inside a read-side critical section"
        );
        assert!(
            self.started.load(Ordering::Acquire),
            "rcu synchronize on a domain whose agents were never started"
        );
        let done = Arc::new(Semaphore::new(0));
        {
            let pin = migration_lock();
            let agent = &self.agents[pin.cpu()];
            assert!(
                !agent.thread.is_current(),
                "rcu synchronize from the agent's own callbacks"
            );
            let signal = Arc::clone(&done);
            self.defer(Box::new(move || signal.post()));
            agent.wake();
        }
        done.wait();
    }

    /// Flush until nothing is pending, stop the agents, then run whatever
    /// their last callbacks deferred.
    fn shut_down(self: &Arc<Self>, workers: Vec<SpawnedThread<()>>) {
        loop {
            if let Err(err) = self.flush() {
                log::error!("rcu flush on drop failed: {err}");
                break;
            }
            if self.quiet() {
                break;
            }
        }
        self.stop(workers);
        self.reclaim_inline();
    }

    fn stop(&self, workers: Vec<SpawnedThread<()>>) {
        self.stopping.store(true, Ordering::SeqCst);
        for agent in self.agents.iter() {
            agent.wake();
        }
        for worker in workers {
            if worker.join().is_err() {
                log::error!("rcu agent panicked");
            }
        }
    }

    fn flush(self: &Arc<Self>) -> io::Result<()> {
        let flushers = (0..self.machine.ncpus())
            .map(|cpu| {
                let domain = Arc::clone(self);
                self.machine
                    .spawn(cpu, format!("rcu-flush{cpu}"), move || domain.synchronize())
            })
            .collect::<io::Result<Vec<_>>>()?;
        for flusher in flushers {
            if let Err(panic) = flusher.join() {
                std::panic::resume_unwind(panic);
            }
        }
        Ok(())
    }

    fn quiet(&self) -> bool {
        self.counters.deferred.load(Ordering::SeqCst) == self.counters.reclaimed.load(Ordering::SeqCst)
    }

    /// Run every pending callback without agents. Taking each CPU's token
    /// in turn proves a grace period for everything deferred so far.
    fn reclaim_inline(&self) {
        assert_eq!(
            preempt_depth(),
            0,
            "rcu domain dropped inside a read-side critical section"
        );
        loop {
            let mut batch = Vec::new();
            for cpu in 0..self.machine.ncpus() {
                let guard = self.machine.preempt_disable_on(cpu);
                batch.append(&mut self.stores.get(&guard).take_all());
                self.agents[cpu].set_pending(0);
            }
            if batch.is_empty() {
                return;
            }
            log::debug!("rcu running {} callbacks inline", batch.len());
            for callback in batch {
                callback();
                self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Read-side critical section. Nestable; must not block.
pub struct ReadGuard<'a> {
    preempt: PreemptGuard<'a>,
}

impl ReadGuard<'_> {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.preempt.cpu()
    }

    pub(crate) fn machine_id(&self) -> u64 {
        self.preempt.machine_id()
    }
}

/// Counters for tests and the harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcuStats {
    /// Current value of the generation counter.
    pub generation: u64,
    /// Reclamation cycles completed.
    pub cycles: u64,
    /// Callbacks accepted by `defer`.
    pub deferred: u64,
    /// Callbacks run.
    pub reclaimed: u64,
    /// Times a deferrer blocked on a full buffer.
    pub stalls: u64,
}

/// One reclamation domain over one [`Machine`].
pub struct Rcu {
    domain: Arc<Domain>,
    agents: Mutex<Vec<SpawnedThread<()>>>,
}

impl Rcu {
    /// Build a domain without starting its agents.
    ///
    /// Deferral works immediately; [`Rcu::synchronize`] needs
    /// [`Rcu::start`] first. Until then nothing swaps the buffers, so a
    /// deferral past a CPU's capacity blocks until [`Rcu::start`] is called.
    #[must_use]
    pub fn new(machine: Arc<Machine>, config: &SyncConfig) -> Self {
        let capacity = config.defer_capacity;
        let stores = PerCpu::new(&machine, |_| DeferStore::new(capacity));
        let agents = (0..machine.ncpus()).map(Agent::new).collect();
        Self {
            domain: Arc::new(Domain {
                machine,
                stores,
                agents,
                next_generation: AtomicU64::new(0),
                capacity,
                idle_flush: config.idle_flush,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            agents: Mutex::new(Vec::new()),
        }
    }

    /// Build a domain and start one agent per CPU.
    pub fn start_with(machine: Arc<Machine>, config: &SyncConfig) -> io::Result<Self> {
        let rcu = Self::new(machine, config);
        rcu.start()?;
        Ok(rcu)
    }

    /// Start one agent per CPU. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        let mut workers = self.agents.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for agent in self.domain.agents.iter() {
            let domain = Arc::clone(&self.domain);
            let cpu = agent.cpu;
            match self
                .domain
                .machine
                .start(agent.thread.clone(), move || domain.run_agent(cpu))
            {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    log::error!("failed to start rcu agent for cpu {cpu}: {err}");
                    self.domain.stop(std::mem::take(&mut *workers));
                    self.domain.stopping.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        self.domain.started.store(true, Ordering::Release);
        for agent in self.domain.agents.iter() {
            agent.wake();
        }
        log::debug!("rcu domain started {} agents", workers.len());
        Ok(())
    }

    #[must_use]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.domain.machine
    }

    /// Enter a read-side critical section on the caller's CPU.
    #[must_use]
    pub fn read_lock(&self) -> ReadGuard<'_> {
        ReadGuard {
            preempt: self.domain.machine.preempt_disable(),
        }
    }

    /// Run `callback` once every reader active now has finished.
    ///
    /// Blocks while the caller's CPU buffer is full. On a domain that was
    /// never started that means until [`Rcu::start`]. From one of the
    /// domain's own callbacks it runs a reclamation cycle inline instead.
    ///
    /// # Panics
    ///
    /// If it would block inside a read-side critical section.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) {
        self.domain.defer(Box::new(callback));
    }

    /// Drop `object` once every reader active now has finished.
    pub fn dispose<T: Send + 'static>(&self, object: Box<T>) {
        self.defer(move || drop(object));
    }

    /// Block until everything deferred before the call is safe to reclaim.
    ///
    /// # Panics
    ///
    /// Inside a read-side critical section, or before [`Rcu::start`].
    pub fn synchronize(&self) {
        self.domain.synchronize();
    }

    /// Run [`Rcu::synchronize`] on every CPU. On return every callback
    /// deferred on any CPU before the call has run.
    pub fn flush(&self) -> io::Result<()> {
        self.domain.flush()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.domain.next_generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> RcuStats {
        let c = &self.domain.counters;
        RcuStats {
            generation: self.generation(),
            cycles: c.cycles.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
            stalls: c.stalls.load(Ordering::Relaxed),
        }
    }

    /// Highest generation `cpu` has proven quiescent.
    #[must_use]
    pub fn reached(&self, cpu: CpuId) -> u64 {
        self.domain.agents[cpu].reached()
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        let workers = std::mem::take(self.agents.get_mut());
        if workers.is_empty() {
            self.domain.reclaim_inline();
            return;
        }
        let Some(cpu) = self
            .domain
            .agents
            .iter()
            .find(|agent| agent.thread.is_current())
            .map(|agent| agent.cpu)
        else {
            self.domain.shut_down(workers);
            return;
        };
        // Dropped from one of our own callbacks. Shutdown needs this agent
        // to finish its cycle, so hand it to a detached thread.
        let domain = Arc::clone(&self.domain);
        match self
            .domain
            .machine
            .spawn(cpu, format!("rcu-reaper{cpu}"), move || domain.shut_down(workers))
        {
            Ok(_reaper) => log::debug!("rcu domain dropped on agent {cpu}; reaper started"),
            Err(err) => log::error!("failed to start rcu reaper: {err}; agents left running"),
        }
    }
}

impl std::fmt::Debug for Rcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rcu")
            .field("machine", &self.domain.machine)
            .field("stats", &self.stats())
            .finish()
    }
}
