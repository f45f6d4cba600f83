//! Sleeping recursive mutex with direct ownership handoff.
//!
//! Besides plain `lock`/`unlock`, the mutex supports the two primitives
//! wait-morphing needs:
//!
//! - [`Mutex::send_lock`] names a wait record as the next owner. If the
//!   mutex is free the record's thread owns it immediately; otherwise the
//!   record queues behind existing lockers and receives ownership from the
//!   corresponding `unlock`. Either way the record is woken only once its
//!   thread *is* the owner.
//! - [`Mutex::receive_lock`] is called by that thread after waking to
//!   account for the ownership it was handed. No locking happens.
//!
//! Ownership is therefore never released to open contention between a
//! waker and its chosen waiter.

use std::collections::VecDeque;
use std::ptr::NonNull;

use parking_lot::Mutex as StateLock;

use crate::condvar::WaitRecord;
use crate::sched::{Thread, ThreadId};

enum Pending {
    Lock(Thread),
    Handoff(RecordPtr),
}

struct RecordPtr(NonNull<WaitRecord>);

// SAFETY: a queued record belongs to a thread that stays blocked until the
// record is woken, which only happens after the pointer has left the queue.
unsafe impl Send for RecordPtr {}

impl RecordPtr {
    fn owner(&self) -> ThreadId {
        // SAFETY: see the `Send` impl; the record outlives its queue entry.
        unsafe { self.0.as_ref() }.thread().id()
    }
}

struct State {
    owner: Option<ThreadId>,
    /// Recursion depth. Zero while the owner is a handoff recipient that
    /// has not yet called `receive_lock`.
    depth: u32,
    waiters: VecDeque<Pending>,
}

pub struct Mutex {
    state: StateLock<State>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StateLock::new(State {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn lock(&self) {
        let me = Thread::current();
        {
            let mut st = self.state.lock();
            match st.owner {
                None => {
                    st.owner = Some(me.id());
                    st.depth = 1;
                    return;
                }
                Some(owner) if owner == me.id() => {
                    assert!(st.depth > 0, "lock() by a thread with a pending handoff");
                    st.depth += 1;
                    return;
                }
                Some(_) => st.waiters.push_back(Pending::Lock(me.clone())),
            }
        }
        Thread::wait_until(|| self.held_by(me.id()));
    }

    #[must_use]
    pub fn try_lock(&self) -> bool {
        let me = Thread::current().id();
        let mut st = self.state.lock();
        match st.owner {
            None => {
                st.owner = Some(me);
                st.depth = 1;
                true
            }
            Some(owner) if owner == me && st.depth > 0 => {
                st.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// # Panics
    ///
    /// If the calling thread does not own the mutex.
    pub fn unlock(&self) {
        let me = Thread::current().id();
        let next = {
            let mut st = self.state.lock();
            assert!(
                st.owner == Some(me) && st.depth > 0,
                "mutex unlocked by thread {me}, which does not own it"
            );
            st.depth -= 1;
            if st.depth > 0 {
                return;
            }
            let next = st.waiters.pop_front();
            match &next {
                None => st.owner = None,
                Some(Pending::Lock(thread)) => {
                    st.owner = Some(thread.id());
                    st.depth = 1;
                }
                Some(Pending::Handoff(record)) => {
                    st.owner = Some(record.owner());
                    st.depth = 0;
                }
            }
            next
        };
        match next {
            None => {}
            Some(Pending::Lock(thread)) => thread.wake(),
            // SAFETY: the record was queued by `send_lock`, whose caller
            // guarantees it stays alive until woken.
            Some(Pending::Handoff(record)) => unsafe { WaitRecord::wake(record.0) },
        }
    }

    /// Hand ownership to the thread that owns `record`, then wake it.
    ///
    /// # Safety
    ///
    /// `record` must point to a live, un-woken [`WaitRecord`] whose thread
    /// stays blocked on it until woken. The caller must not touch the record
    /// again.
    pub unsafe fn send_lock(&self, record: NonNull<WaitRecord>) {
        let record = RecordPtr(record);
        {
            let mut st = self.state.lock();
            if st.owner.is_some() {
                st.waiters.push_back(Pending::Handoff(record));
                return;
            }
            st.owner = Some(record.owner());
            st.depth = 0;
        }
        // SAFETY: forwarded from the caller.
        unsafe { WaitRecord::wake(record.0) };
    }

    /// Account for ownership handed over by [`Mutex::send_lock`].
    ///
    /// # Panics
    ///
    /// If the calling thread is not the designated recipient.
    pub fn receive_lock(&self) {
        let me = Thread::current().id();
        let mut st = self.state.lock();
        assert!(
            st.owner == Some(me) && st.depth == 0,
            "receive_lock by thread {me} without a pending handoff"
        );
        st.depth = 1;
    }

    #[must_use]
    pub fn owned_by_current(&self) -> bool {
        self.held_by(Thread::current().id())
    }

    /// Whether the calling thread holds the mutex exactly once.
    pub(crate) fn held_once_by_current(&self) -> bool {
        let st = self.state.lock();
        st.owner == Some(Thread::current().id()) && st.depth == 1
    }

    fn held_by(&self, id: ThreadId) -> bool {
        let st = self.state.lock();
        st.owner == Some(id) && st.depth > 0
    }

    /// Lock and return a guard that unlocks on drop.
    #[must_use]
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard();
        f()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let st = self.state.get_mut();
        assert!(
            st.owner.is_none() && st.waiters.is_empty(),
            "mutex destroyed while held or contended"
        );
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Mutex")
            .field("owner", &st.owner)
            .field("depth", &st.depth)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}

/// RAII scope returned by [`Mutex::guard`].
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl MutexGuard<'_> {
    #[must_use]
    pub fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
