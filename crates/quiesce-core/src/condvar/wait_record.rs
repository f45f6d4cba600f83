//! Stack-owned record for one blocked thread.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::sched::Thread;

/// One blocked thread, linked into at most one intrusive FIFO.
///
/// The storage belongs to the waiting thread's stack. Queues hold only
/// non-owning pointers and must unlink the record before its thread returns.
pub struct WaitRecord {
    next: AtomicPtr<WaitRecord>,
    thread: Thread,
    woken: AtomicBool,
}

impl WaitRecord {
    #[must_use]
    pub fn new(thread: Thread) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            thread,
            woken: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    #[must_use]
    pub fn woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Block the owning thread until the record is woken.
    pub fn wait(&self) {
        Thread::wait_until(|| self.woken());
    }

    /// Like [`WaitRecord::wait`] with a deadline. Returns whether the record
    /// was woken.
    pub fn wait_until(&self, deadline: std::time::Instant) -> bool {
        Thread::wait_until_deadline(deadline, || self.woken())
    }

    /// Mark the record woken and wake its thread.
    ///
    /// # Safety
    ///
    /// `record` must be live and not yet woken. Once `woken` is published the
    /// owning thread may return and free the record, so nothing here touches
    /// it after that store.
    ///
    /// # Panics
    ///
    /// If the record was already woken.
    pub(crate) unsafe fn wake(record: NonNull<WaitRecord>) {
        // SAFETY: live per the caller's contract.
        let record = unsafe { record.as_ref() };
        let thread = record.thread.clone();
        let already = record.woken.swap(true, Ordering::AcqRel);
        assert!(!already, "wait record woken twice");
        thread.wake();
    }

    pub(super) fn next(&self) -> Option<NonNull<WaitRecord>> {
        NonNull::new(self.next.load(Ordering::Relaxed))
    }

    pub(super) fn set_next(&self, next: Option<NonNull<WaitRecord>>) {
        self.next
            .store(next.map_or(ptr::null_mut(), NonNull::as_ptr), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for WaitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitRecord")
            .field("thread", &self.thread)
            .field("woken", &self.woken())
            .finish_non_exhaustive()
    }
}
