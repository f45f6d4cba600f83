//! Scheduler collaborators consumed by the synchronization layer.
//!
//! The real kernel scheduler (run queues, context switching, migration
//! policy) is out of scope here. This module models just the surface the
//! condition variable and the reclamation engine need, on top of host
//! threads:
//!
//! - every kernel [`Thread`] is one host thread with a park/wake primitive
//!   that re-evaluates an arbitrary predicate on each wake;
//! - a [`Machine`] owns a fixed set of simulated CPUs; each CPU carries a
//!   *preemption token* and holding it is what "preemption disabled on this
//!   CPU" means;
//! - [`PerCpu`] storage is reachable only through a [`PreemptGuard`] for the
//!   slot's CPU, so per-CPU state is single-writer by construction.
//!
//! A read-side critical section is a held preemption token, so any thread
//! that manages to acquire a CPU's token has proven that CPU quiescent.

mod cpu;
#[allow(unsafe_code)]
mod percpu;
mod semaphore;
mod thread;
mod timer;
mod wait_queue;

pub use cpu::{
    Cpu, CpuId, Machine, MigrationGuard, PreemptGuard, SpawnedThread, migration_lock,
    preempt_depth,
};
pub use percpu::PerCpu;
pub use semaphore::Semaphore;
pub use thread::{Thread, ThreadId};
pub use timer::Timer;
pub use wait_queue::WaitQueue;
