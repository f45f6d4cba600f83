//! Threads waiting on a shared event, woken in bulk.

use parking_lot::Mutex;

use super::thread::Thread;

#[derive(Default)]
pub struct WaitQueue {
    waiters: Mutex<Vec<Thread>>,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread, then sleep until `pred` holds.
    ///
    /// Registration precedes the first evaluation of `pred`, so an event
    /// published after that evaluation always reaches the sleeper.
    pub fn wait_until(&self, pred: impl FnMut() -> bool) {
        self.waiters.lock().push(Thread::current());
        Thread::wait_until(pred);
    }

    /// Wake and deregister every waiter.
    pub fn wake_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for thread in waiters {
            thread.wake();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn wake_all_releases_registered_waiters() {
        let queue = Arc::new(WaitQueue::new());
        let ready = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || queue.wait_until(|| ready.load(Ordering::Acquire)))
            })
            .collect();
        while queue.len() < 3 {
            std::thread::yield_now();
        }
        ready.store(true, Ordering::Release);
        queue.wake_all();
        for w in workers {
            w.join().unwrap();
        }
        assert!(queue.is_empty());
    }
}
