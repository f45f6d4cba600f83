//! CPU-indexed storage guarded by preemption scopes.

use std::cell::{RefCell, RefMut};

use super::cpu::{CpuId, Machine, PreemptGuard};

/// One `T` per CPU of a [`Machine`].
///
/// The slot for CPU *c* is reachable only while holding a [`PreemptGuard`]
/// for *c* on the same machine, so at most one thread touches a slot at a
/// time.
pub struct PerCpu<T> {
    machine: u64,
    slots: Box<[RefCell<T>]>,
}

// SAFETY: every shared-reference access to a slot goes through `get`, which
// requires the preemption token of that slot's CPU. The token is a lock, so
// accesses to one slot are serialized across threads and `T` only needs to
// be movable between them.
unsafe impl<T: Send> Sync for PerCpu<T> {}

impl<T> PerCpu<T> {
    pub fn new(machine: &Machine, mut init: impl FnMut(CpuId) -> T) -> Self {
        Self {
            machine: machine.id(),
            slots: (0..machine.ncpus()).map(|cpu| RefCell::new(init(cpu))).collect(),
        }
    }

    /// The slot of the CPU `guard` disables preemption on.
    ///
    /// # Panics
    ///
    /// If `guard` belongs to a different machine, or the slot is already
    /// borrowed further up the same scope.
    pub fn get<'a>(&'a self, guard: &'a PreemptGuard<'_>) -> RefMut<'a, T> {
        assert_eq!(
            guard.machine_id(),
            self.machine,
            "per-cpu slot accessed under another machine's preemption scope"
        );
        self.slots[guard.cpu()].borrow_mut()
    }

    pub fn get_mut(&mut self, cpu: CpuId) -> &mut T {
        self.slots[cpu].get_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_follows_guard_cpu() {
        let machine = Machine::new(3);
        let mut counters = PerCpu::new(&machine, |cpu| cpu * 10);
        {
            let guard = machine.preempt_disable_on(2);
            *counters.get(&guard) += 1;
        }
        assert_eq!(*counters.get_mut(2), 21);
        assert_eq!(*counters.get_mut(0), 0);
        assert_eq!(counters.len(), 3);
    }

    #[test]
    #[should_panic(expected = "another machine")]
    fn foreign_guard_is_rejected() {
        let a = Machine::new(1);
        let b = Machine::new(1);
        let slots = PerCpu::new(&a, |_| ());
        let guard = b.preempt_disable();
        let _slot = slots.get(&guard);
    }
}
