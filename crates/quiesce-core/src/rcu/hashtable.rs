//! RCU-protected hash table.
//!
//! Lookups run under a [`ReadGuard`] without locking. Writers are serialized
//! by the table's own lock. The bucket array doubles when the table holds
//! twice as many elements as buckets and halves when it holds fewer than
//! half. A resize copies every element into a fresh array, publishes it,
//! and disposes the old array (with the nodes hanging off it) through the
//! domain, so readers still walking it finish undisturbed.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Rcu, ReadGuard};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: T,
}

/// Bucket heads. Owns every node still chained from them.
struct Buckets<T> {
    heads: Box<[AtomicPtr<Node<T>>]>,
    _owns: PhantomData<Box<Node<T>>>,
}

impl<T> Buckets<T> {
    fn new(count: usize) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            heads: (0..count).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            _owns: PhantomData,
        }
    }

    fn len(&self) -> usize {
        self.heads.len()
    }

    fn head(&self, hash: u64) -> &AtomicPtr<Node<T>> {
        // Only the low bits pick the bucket.
        let index = hash as usize & (self.heads.len() - 1);
        &self.heads[index]
    }
}

impl<T> Drop for Buckets<T> {
    fn drop(&mut self) {
        for head in self.heads.iter_mut() {
            let mut raw = *head.get_mut();
            while !raw.is_null() {
                // SAFETY: the array is being dropped, either exclusively or
                // after a grace period, and still owns its chains.
                let node = unsafe { Box::from_raw(raw) };
                raw = node.next.load(Ordering::Relaxed);
            }
        }
    }
}

pub struct RcuHashTable<T, S = RandomState> {
    buckets: AtomicPtr<Buckets<T>>,
    len: AtomicUsize,
    writer: Mutex<()>,
    hasher: S,
    machine: u64,
}

// SAFETY: the table owns its nodes; readers on other threads see `&T` and
// retired nodes are dropped on agent threads.
unsafe impl<T: Send + Sync, S: Send> Send for RcuHashTable<T, S> {}
// SAFETY: as above; writers are serialized by `writer`.
unsafe impl<T: Send + Sync, S: Sync> Sync for RcuHashTable<T, S> {}

impl<T> RcuHashTable<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(rcu: &Rcu) -> Self {
        Self::with_capacity_and_hasher(rcu, 1, RandomState::new())
    }

    /// Start with at least `buckets` buckets, rounded up to a power of two.
    #[must_use]
    pub fn with_capacity(rcu: &Rcu, buckets: usize) -> Self {
        Self::with_capacity_and_hasher(rcu, buckets, RandomState::new())
    }
}

impl<T, S> RcuHashTable<T, S>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    #[must_use]
    pub fn with_capacity_and_hasher(rcu: &Rcu, buckets: usize, hasher: S) -> Self {
        let count = buckets.max(1).next_power_of_two();
        Self {
            buckets: AtomicPtr::new(Box::into_raw(Box::new(Buckets::new(count)))),
            len: AtomicUsize::new(0),
            writer: Mutex::new(()),
            hasher,
            machine: rcu.machine().id(),
        }
    }

    fn check_guard(&self, guard: &ReadGuard<'_>) {
        assert_eq!(
            guard.machine_id(),
            self.machine,
            "rcu hash table read under another machine's read lock"
        );
    }

    fn check_domain(&self, rcu: &Rcu) {
        assert_eq!(
            rcu.machine().id(),
            self.machine,
            "rcu hash table updated through another machine's domain"
        );
    }

    /// The live bucket array. Callers hold a read-side section or the
    /// writer lock.
    fn buckets(&self) -> &Buckets<T> {
        // SAFETY: the pointer is never null, and a replaced array is only
        // disposed after a grace period, which neither a read-side section
        // nor the writer lock (held across every replacement) can outlive.
        unsafe { &*self.buckets.load(Ordering::Acquire) }
    }

    fn chain<'a>(head: &'a AtomicPtr<Node<T>>) -> impl Iterator<Item = &'a T> + 'a {
        let mut raw = head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            // SAFETY: nodes reached from a live array, even ones unlinked
            // since, are not disposed before the caller's section ends.
            let node = unsafe { raw.as_ref() }?;
            raw = node.next.load(Ordering::Acquire);
            Some(&node.value)
        })
    }

    /// Find the element equal to `key`, valid for the rest of the read-side
    /// section.
    pub fn find<'a, Q>(&'a self, guard: &'a ReadGuard<'_>, key: &Q) -> Option<&'a T>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.check_guard(guard);
        let hash = self.hasher.hash_one(key);
        Self::chain(self.buckets().head(hash)).find(|value| <T as Borrow<Q>>::borrow(value) == key)
    }

    pub fn contains<Q>(&self, guard: &ReadGuard<'_>, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(guard, key).is_some()
    }

    /// Visit every element under a read-side section. Elements inserted or
    /// erased concurrently may or may not be seen.
    pub fn for_each<'a>(&'a self, guard: &'a ReadGuard<'_>, mut visit: impl FnMut(&'a T)) {
        self.check_guard(guard);
        for head in self.buckets().heads.iter() {
            Self::chain(head).for_each(&mut visit);
        }
    }

    /// Visit every element under the writer lock, so the set is stable.
    /// `visit` must not update the table.
    pub fn owner_for_each(&self, mut visit: impl FnMut(&T)) {
        let _writer = self.writer.lock();
        for head in self.buckets().heads.iter() {
            Self::chain(head).for_each(&mut visit);
        }
    }

    /// Insert `value` unless an equal element is present. Returns whether it
    /// was inserted.
    pub fn insert(&self, rcu: &Rcu, value: T) -> bool {
        self.check_domain(rcu);
        let _writer = self.writer.lock();
        let hash = self.hasher.hash_one(&value);
        if Self::chain(self.buckets().head(hash)).any(|present| *present == value) {
            return false;
        }
        let len = self.len.load(Ordering::Relaxed) + 1;
        self.len.store(len, Ordering::Relaxed);
        let count = self.buckets().len();
        if count.saturating_mul(2) <= len {
            self.resize(rcu, count.saturating_mul(2));
        }
        Self::link(self.buckets().head(hash), value);
        true
    }

    fn link(head: &AtomicPtr<Node<T>>, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(head.load(Ordering::Relaxed)),
            value,
        }));
        head.store(node, Ordering::Release);
    }

    /// Unlink the element equal to `key`, disposing it through the domain.
    /// Returns whether one was found.
    pub fn erase<Q>(&self, rcu: &Rcu, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.check_domain(rcu);
        let _writer = self.writer.lock();
        let hash = self.hasher.hash_one(key);
        let mut link = self.buckets().head(hash);
        loop {
            let raw = link.load(Ordering::Relaxed);
            // SAFETY: nodes reachable from the live array are owned by it and
            // only the writer (us) unlinks them.
            let Some(node) = (unsafe { raw.as_ref() }) else {
                return false;
            };
            if <T as Borrow<Q>>::borrow(&node.value) == key {
                link.store(node.next.load(Ordering::Relaxed), Ordering::Release);
                // SAFETY: unlinked, so new readers cannot reach it; current
                // readers are covered by the grace period.
                rcu.dispose(unsafe { Box::from_raw(raw) });
                break;
            }
            link = &node.next;
        }
        let len = self.len.load(Ordering::Relaxed) - 1;
        self.len.store(len, Ordering::Relaxed);
        let count = self.buckets().len();
        if count / 2 > len {
            self.resize(rcu, count / 2);
        }
        true
    }

    /// Copy every element into `count` fresh buckets and publish them. The
    /// caller holds the writer lock.
    fn resize(&self, rcu: &Rcu, count: usize) {
        let fresh = Box::new(Buckets::new(count));
        for head in self.buckets().heads.iter() {
            for value in Self::chain(head) {
                Self::link(fresh.head(self.hasher.hash_one(value)), value.clone());
            }
        }
        log::trace!("rcu hash table resized to {count} buckets");
        let old = self.buckets.swap(Box::into_raw(fresh), Ordering::AcqRel);
        // SAFETY: `old` came from `Box::into_raw` and is no longer reachable
        // for new readers.
        rcu.dispose(unsafe { Box::from_raw(old) });
    }

    /// Element count. Stable only under external exclusion of writers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        let _writer = self.writer.lock();
        self.buckets().len()
    }
}

impl<T, S> Drop for RcuHashTable<T, S> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the array is still owned.
        drop(unsafe { Box::from_raw(*self.buckets.get_mut()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sched::Machine;
    use std::sync::Arc;

    fn domain() -> Rcu {
        Rcu::new(Arc::new(Machine::new(1)), &SyncConfig::default())
    }

    fn sorted(table: &RcuHashTable<u32>, rcu: &Rcu) -> Vec<u32> {
        let guard = rcu.read_lock();
        let mut seen = Vec::new();
        table.for_each(&guard, |v| seen.push(*v));
        seen.sort_unstable();
        seen
    }

    #[test]
    fn insert_then_find() {
        let rcu = domain();
        let table = RcuHashTable::new(&rcu);
        assert!(table.insert(&rcu, 7u32));
        assert!(table.insert(&rcu, 9));
        let guard = rcu.read_lock();
        assert_eq!(table.find(&guard, &7), Some(&7));
        assert!(table.contains(&guard, &9));
        assert!(!table.contains(&guard, &8));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let rcu = domain();
        let table = RcuHashTable::new(&rcu);
        assert!(table.insert(&rcu, 1u32));
        assert!(!table.insert(&rcu, 1));
        assert_eq!(table.len(), 1);
        assert_eq!(sorted(&table, &rcu), vec![1]);
    }

    #[test]
    fn grows_and_shrinks_with_its_contents() {
        let rcu = domain();
        let table = RcuHashTable::new(&rcu);
        assert_eq!(table.bucket_count(), 1);
        for i in 0..64u32 {
            table.insert(&rcu, i);
        }
        assert_eq!(table.bucket_count(), 64);
        assert_eq!(sorted(&table, &rcu), (0..64).collect::<Vec<_>>());
        // Each resize retires the old array through the domain.
        assert_eq!(rcu.stats().deferred, 6);

        for i in 0..60u32 {
            assert!(table.erase(&rcu, &i));
        }
        assert!(!table.erase(&rcu, &0));
        assert_eq!(table.len(), 4);
        assert!(table.bucket_count() <= 8);
        assert_eq!(sorted(&table, &rcu), vec![60, 61, 62, 63]);
    }

    #[test]
    fn owner_for_each_sees_every_element() {
        let rcu = domain();
        let table = RcuHashTable::with_capacity(&rcu, 5);
        assert_eq!(table.bucket_count(), 8);
        for i in [3u32, 1, 4, 5, 9] {
            table.insert(&rcu, i);
        }
        let mut sum = 0;
        table.owner_for_each(|v| sum += v);
        assert_eq!(sum, 22);
    }

    #[test]
    fn lookup_by_borrowed_key() {
        let rcu = domain();
        let table = RcuHashTable::new(&rcu);
        table.insert(&rcu, String::from("eth0"));
        let guard = rcu.read_lock();
        assert_eq!(table.find(&guard, "eth0").map(String::as_str), Some("eth0"));
        drop(guard);
        assert!(table.erase(&rcu, "eth0"));
        assert!(table.is_empty());
    }

    #[test]
    fn reader_keeps_walking_a_replaced_array() {
        let rcu = domain();
        let table = RcuHashTable::new(&rcu);
        table.insert(&rcu, 1u32);
        let guard = rcu.read_lock();
        let held = table.find(&guard, &1).unwrap();
        // Growth swaps in a fresh array; the old node stays valid until the
        // section ends.
        for i in 2..40 {
            table.insert(&rcu, i);
        }
        assert_eq!(*held, 1);
        assert!(table.contains(&guard, &39));
    }
}
