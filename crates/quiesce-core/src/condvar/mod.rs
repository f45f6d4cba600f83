//! Condition variable with wait-morphing handoff.
//!
//! Waiters queue stack-owned [`WaitRecord`]s in an intrusive FIFO together
//! with the one [`Mutex`] they all wait to reacquire. A waker never signals
//! a waiter to go and contend for that mutex; it hands the mutex to the
//! waiter with [`Mutex::send_lock`], so the waiter resumes already owning it.
//!
//! A timed wait races the timer against wakers. Whoever unlinks the record
//! first decides the outcome:
//!
//! - the waiter unlinks itself: [`WaitStatus::TimedOut`], no handoff is in
//!   flight and the waiter relocks normally;
//! - a waker unlinked it: a handoff is in flight, the waiter waits for it
//!   regardless of the timer and reports [`WaitStatus::Woken`].

mod wait_record;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex as FifoLock;

use crate::mutex::Mutex;
use crate::sched::{Thread, Timer};

pub use wait_record::WaitRecord;

/// Outcome of [`Condvar::wait`]. In both cases the caller owns the mutex on
/// return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Woken,
    TimedOut,
}

impl WaitStatus {
    #[must_use]
    pub fn timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

// ---------------------------------------------------------------------------
// Intrusive FIFO
// ---------------------------------------------------------------------------

struct Fifo {
    oldest: Option<NonNull<WaitRecord>>,
    newest: Option<NonNull<WaitRecord>>,
    len: usize,
    /// Null exactly when the FIFO is empty.
    mutex: Option<NonNull<Mutex>>,
}

// SAFETY: every linked record is pinned on the stack of a thread blocked in
// `Condvar::wait`, which unlinks it (or waits to be unlinked) before
// returning. The mutex pointer is borrowed by those same blocked calls.
unsafe impl Send for Fifo {}

/// # Safety
///
/// Callers pass only records currently linked in (or being linked into) a
/// FIFO, which keeps them alive.
unsafe fn record<'a>(node: NonNull<WaitRecord>) -> &'a WaitRecord {
    // SAFETY: forwarded from the caller.
    unsafe { node.as_ref() }
}

impl Fifo {
    const fn new() -> Self {
        Self {
            oldest: None,
            newest: None,
            len: 0,
            mutex: None,
        }
    }

    fn push(&mut self, node: NonNull<WaitRecord>) {
        // SAFETY: `node` is being linked by its live owner.
        unsafe { record(node) }.set_next(None);
        match self.newest {
            // SAFETY: `tail` is linked.
            Some(tail) => unsafe { record(tail) }.set_next(Some(node)),
            None => self.oldest = Some(node),
        }
        self.newest = Some(node);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<(NonNull<WaitRecord>, NonNull<Mutex>)> {
        let head = self.oldest?;
        let mutex = self.mutex?;
        // SAFETY: `head` is linked.
        let next = unsafe { record(head) }.next();
        self.oldest = next;
        if next.is_none() {
            self.newest = None;
        }
        self.shrink();
        Some((head, mutex))
    }

    fn remove(&mut self, target: NonNull<WaitRecord>) -> bool {
        let mut prev: Option<NonNull<WaitRecord>> = None;
        let mut cursor = self.oldest;
        while let Some(node) = cursor {
            // SAFETY: `node` is linked.
            let next = unsafe { record(node) }.next();
            if node == target {
                match prev {
                    None => self.oldest = next,
                    // SAFETY: `p` is linked.
                    Some(p) => unsafe { record(p) }.set_next(next),
                }
                if self.newest == Some(target) {
                    self.newest = prev;
                }
                self.shrink();
                return true;
            }
            prev = Some(node);
            cursor = next;
        }
        false
    }

    fn detach(&mut self) -> Option<(NonNull<WaitRecord>, NonNull<Mutex>)> {
        let head = self.oldest.take()?;
        self.newest = None;
        self.len = 0;
        let mutex = self.mutex.take()?;
        Some((head, mutex))
    }

    fn shrink(&mut self) {
        self.len -= 1;
        if self.len == 0 {
            self.mutex = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Condvar
// ---------------------------------------------------------------------------

pub struct Condvar {
    fifo: FifoLock<Fifo>,
    /// Lock-free hint for the wake fast path. Written only under `fifo`.
    queued: AtomicBool,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fifo: FifoLock::new(Fifo::new()),
            queued: AtomicBool::new(false),
        }
    }

    /// Release `mutex` and block until woken or until `timer` expires.
    ///
    /// The caller must hold `mutex` exactly once and owns it again on
    /// return, whatever the status.
    ///
    /// # Panics
    ///
    /// If `mutex` is not held once by the caller, or other waiters are
    /// queued with a different mutex.
    pub fn wait(&self, mutex: &Mutex, timer: Option<&Timer>) -> WaitStatus {
        assert!(
            mutex.held_once_by_current(),
            "condvar wait requires holding the mutex exactly once"
        );
        let record = WaitRecord::new(Thread::current());
        let node = NonNull::from(&record);
        {
            let mut fifo = self.fifo.lock();
            let mine = NonNull::from(mutex);
            match fifo.mutex {
                Some(current) => assert!(
                    current == mine,
                    "condition variable used with two different mutexes"
                ),
                None => fifo.mutex = Some(mine),
            }
            fifo.push(node);
            self.queued.store(true, Ordering::Release);
        }
        mutex.unlock();

        let woken = match timer {
            None => {
                record.wait();
                true
            }
            Some(timer) => record.wait_until(timer.deadline()),
        };
        if woken {
            mutex.receive_lock();
            return WaitStatus::Woken;
        }

        let removed = {
            let mut fifo = self.fifo.lock();
            let removed = fifo.remove(node);
            self.queued.store(fifo.len > 0, Ordering::Release);
            removed
        };
        if removed {
            mutex.lock();
            return WaitStatus::TimedOut;
        }
        // A waker unlinked us first and is handing the mutex over.
        record.wait();
        mutex.receive_lock();
        WaitStatus::Woken
    }

    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> WaitStatus {
        self.wait(mutex, Some(&Timer::after(timeout)))
    }

    /// Wait until `pred` holds. `pred` runs with `mutex` held.
    pub fn wait_until(&self, mutex: &Mutex, mut pred: impl FnMut() -> bool) {
        while !pred() {
            self.wait(mutex, None);
        }
    }

    /// Hand the mutex to the oldest waiter.
    pub fn wake_one(&self) {
        if !self.queued.load(Ordering::Acquire) {
            return;
        }
        let mut fifo = self.fifo.lock();
        let Some((node, mutex)) = fifo.pop() else {
            return;
        };
        self.queued.store(fifo.len > 0, Ordering::Release);
        // SAFETY: the popped waiter is blocked on `node` and borrows `mutex`
        // until the handoff wakes it.
        unsafe { mutex.as_ref().send_lock(node) };
    }

    /// Hand the mutex to every waiter in turn.
    ///
    /// Waiters whose thread runs on the same CPU as the most recent
    /// recipient are moved ahead of the others, so FIFO order holds only
    /// among waiters sharing a CPU.
    pub fn wake_all(&self) {
        if !self.queued.load(Ordering::Acquire) {
            return;
        }
        let detached = {
            let mut fifo = self.fifo.lock();
            let detached = fifo.detach();
            self.queued.store(false, Ordering::Release);
            detached
        };
        let Some((first, mutex)) = detached else {
            return;
        };

        // Each record may be freed as soon as it is sent, so links and CPUs
        // are read before sending.
        let send = |node: NonNull<WaitRecord>| {
            // SAFETY: see `wake_one`.
            unsafe { mutex.as_ref().send_lock(node) }
        };
        let mut head = Some(first);
        while let Some(leader) = head {
            // SAFETY: detached records stay alive until sent.
            let leader_rec = unsafe { record(leader) };
            let cpu = leader_rec.thread().cpu();
            head = leader_rec.next();
            send(leader);

            let mut prev: Option<NonNull<WaitRecord>> = None;
            let mut cursor = head;
            while let Some(node) = cursor {
                // SAFETY: not yet sent.
                let rec = unsafe { record(node) };
                let next = rec.next();
                if rec.thread().cpu() == cpu {
                    match prev {
                        None => head = next,
                        // SAFETY: `p` is not yet sent.
                        Some(p) => unsafe { record(p) }.set_next(next),
                    }
                    send(node);
                } else {
                    prev = Some(node);
                }
                cursor = next;
            }
        }
    }

    /// Racy snapshot: whether any waiter is queued.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.fifo.lock().len
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert_eq!(
            self.fifo.get_mut().len,
            0,
            "condition variable destroyed with queued waiters"
        );
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish()
    }
}
