//! RCU-protected singly-linked list.
//!
//! Readers walk the list under a [`ReadGuard`] without locking. Writers are
//! serialized by the list's own lock; an unlinked node keeps pointing at its
//! successor, so a reader standing on it can still finish its walk, and it
//! is disposed through the domain.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use super::{Rcu, ReadGuard};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: T,
}

pub struct RcuList<T> {
    head: AtomicPtr<Node<T>>,
    writer: Mutex<()>,
    machine: u64,
    _owns: PhantomData<Box<Node<T>>>,
}

// SAFETY: the list owns its nodes; readers on other threads see `&T` and
// removed nodes are dropped on agent threads.
unsafe impl<T: Send + Sync> Send for RcuList<T> {}
// SAFETY: as above; writers are serialized by `writer`.
unsafe impl<T: Send + Sync> Sync for RcuList<T> {}

impl<T: Send + Sync + 'static> RcuList<T> {
    #[must_use]
    pub fn new(rcu: &Rcu) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            writer: Mutex::new(()),
            machine: rcu.machine().id(),
            _owns: PhantomData,
        }
    }

    /// Walk the list for the rest of the read-side section.
    pub fn iter<'a>(&'a self, guard: &'a ReadGuard<'_>) -> Iter<'a, T> {
        assert_eq!(
            guard.machine_id(),
            self.machine,
            "rcu list read under another machine's read lock"
        );
        Iter {
            next: self.head.load(Ordering::Acquire),
            _guard: PhantomData,
        }
    }

    pub fn push_front(&self, value: T) {
        let _writer = self.writer.lock();
        let head = self.head.load(Ordering::Relaxed);
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(head),
            value,
        }));
        self.head.store(node, Ordering::Release);
    }

    /// Unlink the first element matching `pred`. Returns whether one was
    /// found.
    pub fn remove_first(&self, rcu: &Rcu, mut pred: impl FnMut(&T) -> bool) -> bool {
        let mut first = true;
        self.unlink_where(rcu, |value| {
            if first && pred(value) {
                first = false;
                return true;
            }
            false
        }) == 1
    }

    /// Unlink every element for which `keep` returns `false`. Returns how
    /// many were removed.
    pub fn retain(&self, rcu: &Rcu, mut keep: impl FnMut(&T) -> bool) -> usize {
        self.unlink_where(rcu, |value| !keep(value))
    }

    fn unlink_where(&self, rcu: &Rcu, mut doomed: impl FnMut(&T) -> bool) -> usize {
        assert_eq!(
            rcu.machine().id(),
            self.machine,
            "rcu list updated through another machine's domain"
        );
        let _writer = self.writer.lock();
        let mut removed = 0;
        let mut link = &self.head;
        loop {
            let raw = link.load(Ordering::Relaxed);
            // SAFETY: nodes reachable from the list are live and only the
            // writer (us) unlinks them.
            let Some(node) = (unsafe { raw.as_ref() }) else {
                break;
            };
            if doomed(&node.value) {
                link.store(node.next.load(Ordering::Relaxed), Ordering::Release);
                // SAFETY: unlinked, so new readers cannot reach it; current
                // readers are covered by the grace period.
                rcu.dispose(unsafe { Box::from_raw(raw) });
                removed += 1;
            } else {
                link = &node.next;
            }
        }
        removed
    }

    /// Number of elements, counted under the writer lock.
    #[must_use]
    pub fn len(&self) -> usize {
        let _writer = self.writer.lock();
        let mut count = 0;
        let mut raw = self.head.load(Ordering::Relaxed);
        // SAFETY: the writer lock keeps every reachable node alive.
        while let Some(node) = unsafe { raw.as_ref() } {
            count += 1;
            raw = node.next.load(Ordering::Relaxed);
        }
        count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        let mut raw = *self.head.get_mut();
        while !raw.is_null() {
            // SAFETY: exclusive access; every node is still owned.
            let node = unsafe { Box::from_raw(raw) };
            raw = node.next.load(Ordering::Relaxed);
        }
    }
}

/// Iterator returned by [`RcuList::iter`].
pub struct Iter<'a, T> {
    next: *const Node<T>,
    _guard: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        // SAFETY: the iterator lives no longer than a read-side section, so
        // any node reached from the head, even one unlinked since, is not
        // disposed before the section ends.
        let node = unsafe { self.next.as_ref() }?;
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.value)
    }
}
