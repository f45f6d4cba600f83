//! RCU-protected owning pointer.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::{Rcu, ReadGuard};

/// Owning pointer whose target readers may borrow without locking.
///
/// Writers must be serialized by the caller. A replaced value is disposed
/// through the domain, so it outlives every read-side section that could
/// have loaded it.
pub struct RcuPtr<T> {
    ptr: AtomicPtr<T>,
    machine: u64,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: the pointer owns a `Box<T>`. Readers on other threads get `&T`,
// and replaced values are dropped on agent threads.
unsafe impl<T: Send + Sync> Send for RcuPtr<T> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync> Sync for RcuPtr<T> {}

impl<T: Send + Sync + 'static> RcuPtr<T> {
    #[must_use]
    pub fn new(rcu: &Rcu, value: T) -> Self {
        Self::from_raw(rcu, Box::into_raw(Box::new(value)))
    }

    #[must_use]
    pub fn null(rcu: &Rcu) -> Self {
        Self::from_raw(rcu, ptr::null_mut())
    }

    fn from_raw(rcu: &Rcu, raw: *mut T) -> Self {
        Self {
            ptr: AtomicPtr::new(raw),
            machine: rcu.machine().id(),
            _owns: PhantomData,
        }
    }

    /// Borrow the current value for the rest of the read-side section.
    ///
    /// # Panics
    ///
    /// If `guard` belongs to a different machine than the pointer.
    pub fn read<'a>(&'a self, guard: &'a ReadGuard<'_>) -> Option<&'a T> {
        assert_eq!(
            guard.machine_id(),
            self.machine,
            "rcu pointer read under another machine's read lock"
        );
        let raw = self.ptr.load(Ordering::Acquire);
        // SAFETY: non-null values are live boxes. A value swapped out after
        // this load is disposed only once `guard`'s CPU has been quiescent,
        // which cannot happen while `guard` lives.
        unsafe { raw.as_ref() }
    }

    /// Exclusive access needs no read-side section.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: `&mut self` rules out readers and writers.
        unsafe { self.ptr.get_mut().as_mut() }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Publish `value` and dispose the previous one after a grace period.
    pub fn assign(&self, value: Option<T>, rcu: &Rcu) {
        let raw = value.map_or(ptr::null_mut(), |v| Box::into_raw(Box::new(v)));
        self.replace(raw, rcu);
    }

    /// Unpublish the value, disposing it after a grace period.
    pub fn take(&self, rcu: &Rcu) {
        self.replace(ptr::null_mut(), rcu);
    }

    fn replace(&self, raw: *mut T, rcu: &Rcu) {
        assert_eq!(
            rcu.machine().id(),
            self.machine,
            "rcu pointer updated through another machine's domain"
        );
        let old = self.ptr.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: `old` came from `Box::into_raw` and is now unreachable
            // for new readers.
            rcu.dispose(unsafe { Box::from_raw(old) });
        }
    }
}

impl<T> Drop for RcuPtr<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        if !raw.is_null() {
            // SAFETY: exclusive access; the value is still owned.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sched::Machine;
    use std::sync::Arc;

    #[test]
    fn read_sees_latest_assignment() {
        let rcu = Rcu::new(Arc::new(Machine::new(1)), &SyncConfig::default());
        let p = RcuPtr::new(&rcu, 1u32);
        {
            let guard = rcu.read_lock();
            assert_eq!(p.read(&guard), Some(&1));
        }
        p.assign(Some(2), &rcu);
        {
            let guard = rcu.read_lock();
            assert_eq!(p.read(&guard), Some(&2));
        }
        p.take(&rcu);
        assert!(p.is_null());
        assert_eq!(rcu.stats().deferred, 2);
    }

    #[test]
    fn get_mut_edits_in_place() {
        let rcu = Rcu::new(Arc::new(Machine::new(1)), &SyncConfig::default());
        let mut p = RcuPtr::new(&rcu, String::from("a"));
        if let Some(s) = p.get_mut() {
            s.push('b');
        }
        let guard = rcu.read_lock();
        assert_eq!(p.read(&guard).map(String::as_str), Some("ab"));
    }
}
