use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::Stamp;

/// Process-wide event counter.
///
/// Every acquire and release takes exactly one tick. Since all ticks are read-modify-write operations on a single
/// atomic, they form one total order, and that order agrees with any happens-before edge between the events (a
/// pointer handed from one thread to another and then freed always gets a later stamp than its allocation).
#[derive(Debug)]
pub(crate) struct SequenceClock {
    next: AtomicU64,
}

impl SequenceClock {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn tick(&self) -> Stamp {
        Stamp(self.next.fetch_add(1, Ordering::AcqRel))
    }

    #[cfg(test)]
    pub fn peek(&self) -> Stamp {
        Stamp(self.next.load(Ordering::Acquire))
    }
}
