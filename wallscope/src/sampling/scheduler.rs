//! The sampling cycle
//!
//! A dedicated thread sweeps the process's threads, handing each eligible
//! one to the handshake. Per tick it samples at most [`THREADS_PER_TICK`]
//! threads; a full sweep of a big process therefore spreads over several
//! ticks, and in idle-sampling mode the tick interval is shrunk to keep the
//! effective per-thread rate stable.

use std::sync::Arc;

use log::debug;

use crate::domain::Tid;
use crate::os::thread_list::ThreadCursor;
use crate::os::{self, RunState};

use super::filter::ThreadFilter;
use super::handshake::Handshake;
use super::SamplerShared;

/// Cap on threads sampled per tick. Throttles signal traffic so processes
/// with thousands of threads do not drown in profiling overhead.
pub(crate) const THREADS_PER_TICK: usize = 8;

/// Hard floor for the tick interval. Below this the sampling machinery
/// itself dominates the cost.
pub(crate) const MIN_INTERVAL_NS: u64 = 100_000;

/// Shrink the tick interval in proportion to how many ticks a full sweep of
/// `thread_count` threads needs, so each thread still gets sampled at
/// roughly the configured rate.
///
/// `adjust_interval(1_000_000, 20)` is `333_333`: twenty threads need three
/// ticks per sweep.
pub(crate) fn adjust_interval(interval_ns: u64, thread_count: usize) -> u64 {
    if thread_count > THREADS_PER_TICK {
        interval_ns / thread_count.div_ceil(THREADS_PER_TICK) as u64
    } else {
        interval_ns
    }
}

/// One scan pass over the cursor.
///
/// Attempts threads until [`THREADS_PER_TICK`] samples succeeded or the
/// cursor runs out (then rewinds it for the next pass and stops early).
/// Skips the cycle thread itself, threads the filter rejects, and, when
/// idle sampling is off, threads the kernel does not report runnable.
/// Returns the number of successful samples.
pub(crate) fn scan_once<C, R, P>(
    cursor: &mut C,
    self_tid: Tid,
    filter: &dyn ThreadFilter,
    filter_enabled: bool,
    sample_idle: bool,
    run_state: R,
    mut probe: P,
) -> usize
where
    C: ThreadCursor + ?Sized,
    R: Fn(Tid) -> RunState,
    P: FnMut(Tid) -> bool,
{
    let mut count = 0;
    while count < THREADS_PER_TICK {
        let Some(tid) = cursor.next() else {
            cursor.rewind();
            break;
        };

        if tid == self_tid || (filter_enabled && !filter.accept(tid)) {
            continue;
        }

        if (sample_idle || run_state(tid) == RunState::Running) && probe(tid) {
            count += 1;
        }
    }
    count
}

/// Body of the cycle thread. Returns when the shared running flag clears.
pub(crate) fn timer_loop<C: ThreadCursor>(
    shared: &SamplerShared,
    mut thread_list: C,
    filter: &Arc<dyn ThreadFilter>,
    handshake: &Handshake,
    interval_ns: u64,
    sample_idle: bool,
) {
    let self_tid = os::current_thread_id();
    let filter_enabled = filter.enabled();

    let mut next_cycle_time = os::nanotime();

    while shared.is_running() {
        if !shared.is_enabled() {
            os::sleep_ns(interval_ns);
            continue;
        }

        if sample_idle {
            // Keep the effective wall-clock rate stable regardless of how
            // many threads a sweep covers
            let estimated_thread_count =
                if filter_enabled { filter.size() } else { thread_list.size() };
            next_cycle_time += adjust_interval(interval_ns, estimated_thread_count);
        }

        scan_once(
            &mut thread_list,
            self_tid,
            filter.as_ref(),
            filter_enabled,
            sample_idle,
            os::thread_run_state,
            |tid| handshake.sample_thread(tid),
        );

        if sample_idle {
            let now = os::nanotime();
            if next_cycle_time.saturating_sub(now) > MIN_INTERVAL_NS {
                os::sleep_ns(next_cycle_time - now);
            } else {
                // The scan overran the deadline; re-anchor rather than
                // busy-looping to catch up
                next_cycle_time = now + MIN_INTERVAL_NS;
                os::sleep_ns(MIN_INTERVAL_NS);
            }
        } else {
            os::sleep_ns(interval_ns);
        }
    }

    debug!("sampling cycle thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::filter::{AllThreads, TidSetFilter};

    struct MockCursor {
        tids: Vec<Tid>,
        pos: usize,
        rewinds: usize,
    }

    impl MockCursor {
        fn new(tids: &[i32]) -> Self {
            Self { tids: tids.iter().map(|&t| Tid(t)).collect(), pos: 0, rewinds: 0 }
        }
    }

    impl ThreadCursor for MockCursor {
        fn next(&mut self) -> Option<Tid> {
            let tid = self.tids.get(self.pos).copied();
            if tid.is_some() {
                self.pos += 1;
            }
            tid
        }

        fn rewind(&mut self) {
            self.pos = 0;
            self.rewinds += 1;
        }

        fn size(&self) -> usize {
            self.tids.len()
        }
    }

    fn running(_: Tid) -> RunState {
        RunState::Running
    }

    #[test]
    fn test_adjust_interval_division() {
        assert_eq!(adjust_interval(1_000_000, 20), 333_333);
        assert_eq!(adjust_interval(1_000_000, 8), 1_000_000);
        assert_eq!(adjust_interval(1_000_000, 9), 500_000);
        assert_eq!(adjust_interval(1_000_000, 16), 500_000);
        assert_eq!(adjust_interval(1_000_000, 17), 333_333);
        assert_eq!(adjust_interval(1_000_000, 1), 1_000_000);
        assert_eq!(adjust_interval(1_000_000, 0), 1_000_000);
    }

    #[test]
    fn test_scan_attempts_min_of_threads_and_cap() {
        // Fewer threads than the cap: every thread probed once, then rewind
        let mut cursor = MockCursor::new(&[1, 2, 3]);
        let mut probed = Vec::new();
        let count = scan_once(&mut cursor, Tid(99), &AllThreads, false, true, running, |tid| {
            probed.push(tid);
            true
        });
        assert_eq!(count, 3);
        assert_eq!(probed.len(), 3);
        assert_eq!(cursor.rewinds, 1);

        // More threads than the cap: exactly THREADS_PER_TICK probes, no rewind
        let tids: Vec<i32> = (1..=20).collect();
        let mut cursor = MockCursor::new(&tids);
        let mut probes = 0;
        let count = scan_once(&mut cursor, Tid(99), &AllThreads, false, true, running, |_| {
            probes += 1;
            true
        });
        assert_eq!(count, THREADS_PER_TICK);
        assert_eq!(probes, THREADS_PER_TICK);
        assert_eq!(cursor.rewinds, 0);
    }

    #[test]
    fn test_scan_skips_self() {
        let mut cursor = MockCursor::new(&[1, 2, 3]);
        let mut probed = Vec::new();
        scan_once(&mut cursor, Tid(2), &AllThreads, false, true, running, |tid| {
            probed.push(tid);
            true
        });
        assert_eq!(probed, vec![Tid(1), Tid(3)]);
    }

    #[test]
    fn test_scan_honors_filter() {
        let filter = TidSetFilter::new();
        filter.add(Tid(1));
        filter.add(Tid(3));

        let mut cursor = MockCursor::new(&[1, 2, 3, 4]);
        let mut probed = Vec::new();
        scan_once(&mut cursor, Tid(99), &filter, true, true, running, |tid| {
            probed.push(tid);
            true
        });
        assert_eq!(probed, vec![Tid(1), Tid(3)]);
    }

    #[test]
    fn test_scan_skips_idle_threads_when_idle_sampling_off() {
        let mut cursor = MockCursor::new(&[1, 2, 3]);
        let mut probed = Vec::new();
        let state = |tid: Tid| if tid == Tid(2) { RunState::Sleeping } else { RunState::Running };
        scan_once(&mut cursor, Tid(99), &AllThreads, false, false, state, |tid| {
            probed.push(tid);
            true
        });
        assert_eq!(probed, vec![Tid(1), Tid(3)]);
    }

    #[test]
    fn test_scan_probes_idle_threads_when_idle_sampling_on() {
        let mut cursor = MockCursor::new(&[1, 2]);
        let mut probed = Vec::new();
        let state = |_: Tid| RunState::Sleeping;
        scan_once(&mut cursor, Tid(99), &AllThreads, false, true, state, |tid| {
            probed.push(tid);
            true
        });
        assert_eq!(probed, vec![Tid(1), Tid(2)]);
    }

    #[test]
    fn test_failed_probes_do_not_count_but_scan_continues() {
        let tids: Vec<i32> = (1..=10).collect();
        let mut cursor = MockCursor::new(&tids);
        let mut probes = 0;
        let count = scan_once(&mut cursor, Tid(99), &AllThreads, false, true, running, |_| {
            probes += 1;
            false
        });
        // Every thread was attempted, none succeeded, cursor exhausted
        assert_eq!(count, 0);
        assert_eq!(probes, 10);
        assert_eq!(cursor.rewinds, 1);
    }
}
