//! Per-CPU quiescent-state agents and the reclamation cycle they drive.
//!
//! Each agent alternates between two roles:
//!
//! - **witness**: whenever it runs with its CPU's preemption token it proves
//!   that CPU quiescent, and raises its `reached` generation to whatever
//!   peers have `requested`;
//! - **driver**: when its own buffer holds callbacks it retires the buffer,
//!   allocates a new generation, asks every peer to reach it and waits. The
//!   wait also wakes for requests made *of* this agent, so two drivers never
//!   stall on each other.
//!
//! A generation is allocated while holding the driver's own token, which is
//! what lets the driver count itself as having reached it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crate::sched::{CpuId, Thread, WaitQueue};

use super::Domain;

pub(super) struct Agent {
    pub(super) cpu: CpuId,
    /// Handle created before the agent runs so wakes are never dropped.
    pub(super) thread: Thread,
    /// Highest generation this CPU has proven quiescent. Never regresses.
    reached: AtomicU64,
    /// Highest generation any driver asked this CPU to reach.
    requested: AtomicU64,
    driving: AtomicBool,
    /// Mirror of the current buffer's length, readable without the token.
    pending: AtomicUsize,
    /// Bumped on every buffer swap; stalled deferrers wait for it to move.
    swaps: AtomicU64,
    pub(super) room: WaitQueue,
}

impl Agent {
    pub(super) fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            thread: Thread::new(format!("rcu{cpu}"), cpu),
            reached: AtomicU64::new(0),
            requested: AtomicU64::new(0),
            driving: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            swaps: AtomicU64::new(0),
            room: WaitQueue::new(),
        }
    }

    pub(super) fn reached(&self) -> u64 {
        self.reached.load(Ordering::SeqCst)
    }

    pub(super) fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    fn behind(&self) -> bool {
        self.reached() < self.requested()
    }

    fn request(&self, generation: u64) {
        self.requested.fetch_max(generation, Ordering::SeqCst);
        self.wake();
    }

    pub(super) fn wake(&self) {
        self.thread.wake();
    }

    pub(super) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(super) fn set_pending(&self, len: usize) {
        self.pending.store(len, Ordering::Release);
    }

    pub(super) fn swaps(&self) -> u64 {
        self.swaps.load(Ordering::Acquire)
    }
}

impl Domain {
    /// Record that `cpu` is quiescent with respect to `generation`.
    /// The caller holds `cpu`'s preemption token.
    fn reach(&self, cpu: CpuId, generation: u64) {
        self.agents[cpu].reached.fetch_max(generation, Ordering::SeqCst);
        for peer in self.agents.iter() {
            if peer.cpu != cpu && peer.driving.load(Ordering::SeqCst) {
                peer.wake();
            }
        }
    }

    /// Answer every request observed so far. The caller holds `cpu`'s token.
    fn catch_up(&self, cpu: CpuId) {
        let agent = &self.agents[cpu];
        let requested = agent.requested();
        if agent.reached() < requested {
            log::trace!("rcu cpu {cpu} reaches generation {requested}");
            self.reach(cpu, requested);
        }
    }

    fn all_reached(&self, generation: u64) -> bool {
        self.agents.iter().all(|a| a.reached() >= generation)
    }

    pub(super) fn run_agent(&self, cpu: CpuId) {
        let agent = &self.agents[cpu];
        // Cycles need every peer alive, so hold off until all agents exist.
        Thread::wait_until(|| {
            self.started.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire)
        });
        log::debug!("rcu agent for cpu {cpu} running");
        loop {
            if let Some(target) = self.quiescent_point(cpu) {
                self.drive(cpu, target);
                continue;
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let has_work =
                || agent.behind() || agent.pending() > 0 || self.stopping.load(Ordering::Acquire);
            match self.idle_flush {
                None => Thread::wait_until(has_work),
                Some(interval) => {
                    // Timing out is fine: the next quiescent point picks up
                    // whatever accumulated.
                    let _ = Thread::wait_until_deadline(Instant::now() + interval, has_work);
                }
            }
        }
        log::debug!("rcu agent for cpu {cpu} stopped");
    }

    /// Pass a quiescent point on `cpu`. If callbacks are pending, retire
    /// them and return the generation whose completion makes them safe.
    fn quiescent_point(&self, cpu: CpuId) -> Option<u64> {
        let agent = &self.agents[cpu];
        let guard = self.machine.preempt_disable();
        debug_assert_eq!(guard.cpu(), cpu);
        self.catch_up(cpu);
        {
            let mut store = self.stores.get(&guard);
            if store.pending() == 0 {
                return None;
            }
            agent.driving.store(true, Ordering::SeqCst);
            store.swap();
        }
        agent.set_pending(0);
        agent.swaps.fetch_add(1, Ordering::AcqRel);
        agent.room.wake_all();

        let target = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        agent.requested.fetch_max(target, Ordering::SeqCst);
        self.reach(cpu, target);
        drop(guard);
        Some(target)
    }

    /// Retire and reclaim `cpu`'s full buffer from one of its own agent's
    /// callbacks. The retired slot is empty while a batch runs, so the swap
    /// cannot collide with the batch in progress.
    pub(super) fn cycle_inline(&self, cpu: CpuId) {
        if let Some(target) = self.quiescent_point(cpu) {
            log::debug!("rcu cpu {cpu} runs nested generation {target}");
            self.drive(cpu, target);
        }
    }

    fn drive(&self, cpu: CpuId, target: u64) {
        let agent = &self.agents[cpu];
        log::trace!("rcu cpu {cpu} drives generation {target}");
        for peer in self.agents.iter().filter(|peer| peer.cpu != cpu) {
            peer.request(target);
        }
        loop {
            Thread::wait_until(|| agent.behind() || self.all_reached(target));
            if !agent.behind() {
                break;
            }
            let _guard = self.machine.preempt_disable();
            self.catch_up(cpu);
        }

        let mut batch = {
            let guard = self.machine.preempt_disable();
            self.stores.get(&guard).take_retired()
        };
        log::debug!(
            "rcu cpu {cpu} generation {target} complete, running {} callbacks",
            batch.len()
        );
        for callback in batch.drain(..) {
            callback();
            self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
        {
            let guard = self.machine.preempt_disable();
            self.stores.get(&guard).restore(batch);
        }
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        agent.driving.store(false, Ordering::SeqCst);
    }
}
