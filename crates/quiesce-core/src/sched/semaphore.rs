//! Counting semaphore.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Semaphore {
    units: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new(units: u64) -> Self {
        Self {
            units: Mutex::new(units),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut units = self.units.lock();
        *units += 1;
        self.available.notify_one();
    }

    pub fn wait(&self) {
        let mut units = self.units.lock();
        while *units == 0 {
            self.available.wait(&mut units);
        }
        *units -= 1;
    }

    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut units = self.units.lock();
        if *units == 0 {
            return false;
        }
        *units -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_releases_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        assert!(!sem.try_wait());
        let poster = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.post())
        };
        sem.wait();
        poster.join().unwrap();
        assert!(!sem.try_wait());
    }
}
