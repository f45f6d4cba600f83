//! Per-CPU double-buffered store of deferred callbacks.

/// A deferred reclamation callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Two alternating buffers: `current` accepts new callbacks while the other
/// holds a batch waiting for (or undergoing) its grace period.
pub(crate) struct DeferStore {
    buffers: [Vec<Callback>; 2],
    current: usize,
    capacity: usize,
}

impl DeferStore {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "deferred-callback buffers need at least one slot");
        Self {
            buffers: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
            current: 0,
            capacity,
        }
    }

    /// Append to the current buffer. Hands the callback back when full.
    pub(crate) fn push(&mut self, callback: Callback) -> Result<usize, Callback> {
        let buffer = &mut self.buffers[self.current];
        if buffer.len() == self.capacity {
            return Err(callback);
        }
        buffer.push(callback);
        Ok(buffer.len())
    }

    pub(crate) fn pending(&self) -> usize {
        self.buffers[self.current].len()
    }

    /// Retire the current buffer and open the other one for new callbacks.
    ///
    /// # Panics
    ///
    /// If the previous batch has not been drained yet.
    pub(crate) fn swap(&mut self) {
        assert!(
            self.buffers[self.current ^ 1].is_empty(),
            "deferred-callback buffer swapped before its previous batch drained"
        );
        self.current ^= 1;
    }

    /// Take the retired batch. Its allocation comes back through
    /// [`DeferStore::restore`].
    pub(crate) fn take_retired(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.buffers[self.current ^ 1])
    }

    pub(crate) fn restore(&mut self, drained: Vec<Callback>) {
        debug_assert!(drained.is_empty());
        let slot = &mut self.buffers[self.current ^ 1];
        if slot.is_empty() && slot.capacity() < drained.capacity() {
            *slot = drained;
        }
    }

    /// Everything still held, oldest first.
    pub(crate) fn take_all(&mut self) -> Vec<Callback> {
        let mut all = std::mem::take(&mut self.buffers[self.current ^ 1]);
        all.append(&mut self.buffers[self.current]);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn full_buffer_hands_callback_back() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut store = DeferStore::new(2);
        assert_eq!(store.push(counting(&ran)).ok(), Some(1));
        assert_eq!(store.push(counting(&ran)).ok(), Some(2));
        let rejected = store.push(counting(&ran)).expect_err("third push must not fit");
        rejected();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending(), 2);
    }

    #[test]
    fn swap_opens_fresh_buffer_and_retires_batch_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut store = DeferStore::new(3);
        for i in 0..3 {
            let order = Arc::clone(&order);
            let _ = store.push(Box::new(move || order.lock().push(i)));
        }
        store.swap();
        assert_eq!(store.pending(), 0);
        assert!(store.push(Box::new(|| {})).is_ok());

        let mut batch = store.take_retired();
        for cb in batch.drain(..) {
            cb();
        }
        store.restore(batch);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        store.swap();
        assert_eq!(store.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "before its previous batch drained")]
    fn swapping_twice_without_drain_is_fatal() {
        let mut store = DeferStore::new(1);
        let _ = store.push(Box::new(|| {}));
        store.swap();
        let _ = store.push(Box::new(|| {}));
        store.swap();
    }

    #[test]
    fn take_all_returns_retired_then_current() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut store = DeferStore::new(4);
        for i in 0..4 {
            if i == 2 {
                store.swap();
            }
            let order = Arc::clone(&order);
            let _ = store.push(Box::new(move || order.lock().push(i)));
        }
        for cb in store.take_all() {
            cb();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
