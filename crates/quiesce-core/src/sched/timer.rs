//! Deadlines for timed condition-variable waits.

use std::time::{Duration, Instant};

/// A deadline for timed waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    #[must_use]
    pub fn at(deadline: Instant) -> Self {
        Self { deadline }
    }

    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
