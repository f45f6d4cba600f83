//! # quiesce-core
//!
//! Thread-synchronization layer of the quiesce unikernel.
//!
//! Two primitives carry the weight of every other subsystem's concurrent
//! access to shared kernel state:
//!
//! - [`condvar::Condvar`]: a condition variable with wait-morphing, where a
//!   waker hands the associated [`mutex::Mutex`] directly to the thread it
//!   wakes instead of letting it re-contend.
//! - [`rcu::Rcu`]: an epoch-based deferred-reclamation engine. Readers take
//!   no lock; writers defer destruction until every CPU has passed through a
//!   quiescent state.
//!
//! The scheduler pieces both depend on (threads, simulated CPUs, preemption
//! scopes, per-CPU storage) live in [`sched`]. No `unsafe` code is permitted
//! at the crate level; the few modules that own raw-pointer invariants opt
//! back in individually.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod condvar;
pub mod config;
#[allow(unsafe_code)]
pub mod mutex;
pub mod rcu;
pub mod sched;

pub use condvar::{Condvar, WaitRecord, WaitStatus};
pub use config::{ConfigError, SyncConfig};
pub use mutex::{Mutex, MutexGuard};
pub use rcu::{Rcu, RcuHashTable, RcuList, RcuPtr, RcuStats, ReadGuard};
pub use sched::{CpuId, Machine, PreemptGuard, Thread};
