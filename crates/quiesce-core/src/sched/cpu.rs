//! Simulated CPUs, preemption scopes and migration locks.

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use super::thread::Thread;
use crate::config::SyncConfig;

/// Index of a simulated CPU within its [`Machine`].
pub type CpuId = usize;

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static PREEMPT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Nesting depth of preemption-disabled scopes held by the calling thread.
#[must_use]
pub fn preempt_depth() -> u32 {
    PREEMPT_DEPTH.with(Cell::get)
}

// ---------------------------------------------------------------------------
// Cpu / Machine
// ---------------------------------------------------------------------------

/// One simulated core.
pub struct Cpu {
    id: CpuId,
    /// Held for the whole of every preemption-disabled scope on this CPU.
    preempt: ReentrantMutex<()>,
}

impl Cpu {
    #[must_use]
    pub fn id(&self) -> CpuId {
        self.id
    }
}

/// A fixed set of simulated CPUs. Never resized after creation.
pub struct Machine {
    id: u64,
    cpus: Box<[Cpu]>,
}

impl Machine {
    /// # Panics
    ///
    /// If `ncpus` is zero.
    #[must_use]
    pub fn new(ncpus: usize) -> Self {
        assert!(ncpus > 0, "a machine needs at least one cpu");
        let cpus = (0..ncpus)
            .map(|id| Cpu {
                id,
                preempt: ReentrantMutex::new(()),
            })
            .collect();
        Self {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            cpus,
        }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.cpus)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id]
    }

    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }

    /// Disable preemption on the caller's CPU until the guard drops.
    ///
    /// Reentrant. The calling thread cannot migrate while the guard lives.
    #[must_use]
    pub fn preempt_disable(&self) -> PreemptGuard<'_> {
        let pin = migration_lock();
        let cpu = pin.thread.cpu();
        assert!(
            cpu < self.ncpus(),
            "thread {} runs on cpu {cpu}, outside this {}-cpu machine",
            pin.thread.name(),
            self.ncpus()
        );
        self.enter(cpu, pin)
    }

    /// Take `cpu`'s preemption token from whatever CPU the caller runs on.
    ///
    /// Returns once no preemption-disabled scope (and so no read-side
    /// critical section) is active on `cpu`, and keeps new ones out until
    /// the guard drops.
    #[must_use]
    pub fn preempt_disable_on(&self, cpu: CpuId) -> PreemptGuard<'_> {
        self.enter(cpu, migration_lock())
    }

    fn enter(&self, cpu: CpuId, pin: MigrationGuard) -> PreemptGuard<'_> {
        let token = self.cpus[cpu].preempt.lock();
        PREEMPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        PreemptGuard {
            machine: self.id,
            cpu,
            _token: token,
            _pin: pin,
        }
    }

    /// Start a kernel thread bound to `cpu`.
    pub fn spawn<F, T>(
        &self,
        cpu: CpuId,
        name: impl Into<String>,
        f: F,
    ) -> io::Result<SpawnedThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(cpu < self.ncpus(), "cpu {cpu} does not exist");
        self.start(Thread::new(name, cpu), f)
    }

    /// Start a thread whose handle was created ahead of time, so others can
    /// wake it before it first runs.
    pub(crate) fn start<F, T>(&self, thread: Thread, f: F) -> io::Result<SpawnedThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = {
            let thread = thread.clone();
            std::thread::Builder::new()
                .name(thread.name().to_owned())
                .spawn(move || {
                    thread.install();
                    f()
                })?
        };
        Ok(SpawnedThread { thread, handle })
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("ncpus", &self.ncpus())
            .finish()
    }
}

/// A kernel thread started by [`Machine::spawn`].
pub struct SpawnedThread<T> {
    thread: Thread,
    handle: JoinHandle<T>,
}

impl<T> SpawnedThread<T> {
    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Wait for the thread to finish. `Err` carries the panic payload.
    pub fn join(self) -> std::thread::Result<T> {
        self.handle.join()
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Preemption-disabled scope on one CPU.
pub struct PreemptGuard<'a> {
    machine: u64,
    cpu: CpuId,
    _token: ReentrantMutexGuard<'a, ()>,
    _pin: MigrationGuard,
}

impl PreemptGuard<'_> {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub(crate) fn machine_id(&self) -> u64 {
        self.machine
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        PREEMPT_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Scope that keeps the calling thread on its current CPU.
pub struct MigrationGuard {
    thread: Thread,
    _not_send: PhantomData<*const ()>,
}

/// Prevent the calling thread from migrating until the guard drops.
#[must_use]
pub fn migration_lock() -> MigrationGuard {
    let thread = Thread::current();
    thread.pin();
    MigrationGuard {
        thread,
        _not_send: PhantomData,
    }
}

impl MigrationGuard {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.thread.cpu()
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.thread.unpin();
    }
}
