//! Which threads a sampling run may target

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::domain::Tid;

/// Decides which threads a sampling pass may target.
///
/// When `enabled` returns false the cycle skips the filter entirely and
/// every thread is eligible. `size` feeds the scheduler's interval
/// adjustment and should track the expected number of accepted threads.
pub trait ThreadFilter: Send + Sync {
    fn enabled(&self) -> bool;
    fn size(&self) -> usize;
    fn accept(&self, tid: Tid) -> bool;
}

/// No filtering; every thread in the process is eligible.
#[derive(Debug, Default)]
pub struct AllThreads;

impl ThreadFilter for AllThreads {
    fn enabled(&self) -> bool {
        false
    }

    fn size(&self) -> usize {
        0
    }

    fn accept(&self, _tid: Tid) -> bool {
        true
    }
}

/// Explicit allow-set of thread ids, mutable while sampling runs.
#[derive(Debug, Default)]
pub struct TidSetFilter {
    tids: RwLock<HashSet<Tid>>,
}

impl TidSetFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tid: Tid) {
        self.tids.write().unwrap_or_else(PoisonError::into_inner).insert(tid);
    }

    pub fn remove(&self, tid: Tid) {
        self.tids.write().unwrap_or_else(PoisonError::into_inner).remove(&tid);
    }
}

impl ThreadFilter for TidSetFilter {
    fn enabled(&self) -> bool {
        true
    }

    fn size(&self) -> usize {
        self.tids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn accept(&self, tid: Tid) -> bool {
        self.tids.read().unwrap_or_else(PoisonError::into_inner).contains(&tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_threads_accepts_everything() {
        let filter = AllThreads;
        assert!(!filter.enabled());
        assert!(filter.accept(Tid(1)));
        assert!(filter.accept(Tid(i32::MAX)));
    }

    #[test]
    fn test_tid_set_filter_membership() {
        let filter = TidSetFilter::new();
        assert!(filter.enabled());
        assert_eq!(filter.size(), 0);
        assert!(!filter.accept(Tid(7)));

        filter.add(Tid(7));
        filter.add(Tid(8));
        assert_eq!(filter.size(), 2);
        assert!(filter.accept(Tid(7)));
        assert!(!filter.accept(Tid(9)));

        filter.remove(Tid(7));
        assert_eq!(filter.size(), 1);
        assert!(!filter.accept(Tid(7)));
    }
}
