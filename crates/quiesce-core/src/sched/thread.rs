//! Kernel thread handles and the park/wake primitive.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::cpu::{CpuId, preempt_depth};

/// Process-unique thread identifier. Never reused.
pub type ThreadId = u64;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Thread>> = const { RefCell::new(None) };
}

struct Inner {
    id: ThreadId,
    name: String,
    cpu: AtomicUsize,
    migration_locks: AtomicU32,
    /// Set by `wake`, consumed by the sleeper. Makes a wake that lands
    /// before the sleeper blocks impossible to lose.
    wake_pending: Mutex<bool>,
    wakeup: Condvar,
}

/// Cloneable handle to one kernel thread.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

impl Thread {
    pub(crate) fn new(name: impl Into<String>, cpu: CpuId) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                cpu: AtomicUsize::new(cpu),
                migration_locks: AtomicU32::new(0),
                wake_pending: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Handle of the calling thread.
    ///
    /// Host threads that were not started through
    /// [`Machine::spawn`](super::Machine::spawn) are adopted onto CPU 0 the
    /// first time they ask.
    #[must_use]
    pub fn current() -> Thread {
        CURRENT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| {
                    let host = std::thread::current();
                    Thread::new(host.name().unwrap_or("adopted"), 0)
                })
                .clone()
        })
    }

    /// Bind this handle to the calling host thread.
    pub(crate) fn install(self) {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(slot.is_none(), "host thread already runs a kernel thread");
            *slot = Some(self);
        });
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// CPU the thread currently runs on.
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.inner.cpu.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|current| current.id() == self.id())
        })
    }

    /// Move the calling thread to `cpu`.
    ///
    /// # Panics
    ///
    /// If `self` is not the calling thread, or the thread is pinned by a
    /// migration lock or a preemption-disabled scope.
    pub fn migrate(&self, cpu: CpuId) {
        assert!(self.is_current(), "only the running thread may migrate itself");
        assert_eq!(
            self.inner.migration_locks.load(Ordering::Acquire),
            0,
            "thread {} migrated while pinned to cpu {}",
            self.name(),
            self.cpu()
        );
        debug_assert_eq!(preempt_depth(), 0);
        self.inner.cpu.store(cpu, Ordering::Release);
    }

    pub(crate) fn pin(&self) {
        self.inner.migration_locks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.inner.migration_locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "migration lock count underflow");
    }

    /// Wake the thread so it re-evaluates whatever predicate it sleeps on.
    pub fn wake(&self) {
        let mut pending = self.inner.wake_pending.lock();
        *pending = true;
        self.inner.wakeup.notify_one();
    }

    /// Block the calling thread until `pred` holds.
    ///
    /// `pred` is evaluated before sleeping and again after every wake,
    /// spurious or not. Whoever makes `pred` true must call [`Thread::wake`]
    /// on the sleeper afterwards.
    pub fn wait_until(mut pred: impl FnMut() -> bool) {
        let me = Thread::current();
        loop {
            if pred() {
                return;
            }
            me.park(None);
        }
    }

    /// Like [`Thread::wait_until`] but gives up at `deadline`.
    ///
    /// Returns the final value of `pred`, so `false` means the deadline
    /// passed with the condition still unsatisfied.
    pub fn wait_until_deadline(deadline: Instant, mut pred: impl FnMut() -> bool) -> bool {
        let me = Thread::current();
        loop {
            if pred() {
                return true;
            }
            if Instant::now() >= deadline || !me.park(Some(deadline)) {
                return pred();
            }
        }
    }

    /// Sleep until woken. Returns `false` if `deadline` passed first.
    fn park(&self, deadline: Option<Instant>) -> bool {
        let mut pending = self.inner.wake_pending.lock();
        if !*pending {
            match deadline {
                None => self.inner.wakeup.wait(&mut pending),
                Some(deadline) => {
                    if self
                        .inner
                        .wakeup
                        .wait_until(&mut pending, deadline)
                        .timed_out()
                        && !*pending
                    {
                        return false;
                    }
                }
            }
        }
        *pending = false;
        true
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("cpu", &self.cpu())
            .finish()
    }
}
