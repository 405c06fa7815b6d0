//! In-memory profile aggregation.
//!
//! Aggregates samples as they stream in: per-thread state counts for the
//! wall-clock picture, a per-pc histogram for hotspots, and a bounded raw
//! sample log for export. Snapshots can be taken at any time, including
//! while sampling is still running.

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use crate::domain::{Duration, Tid, Timestamp};
use crate::os;
use crate::sampling::thread_state::ThreadState;
use crate::symbolization::Symbolizer;

use super::{Sample, SampleEvent, SampleSink};

/// Hotspot lines shown in the rendered summary.
const MAX_RENDERED_HOTSPOTS: usize = 10;

/// Thread-safe aggregating sink.
///
/// The raw sample log is capped at `event_capacity`; counters keep counting
/// after the cap so totals stay truthful.
pub struct ProfileAggregator {
    inner: Mutex<Inner>,
    event_capacity: usize,
}

#[derive(Default)]
struct Inner {
    threads: HashMap<Tid, ThreadCounts>,
    hotspots: HashMap<u64, u64>,
    events: Vec<SampleEvent>,
    events_dropped: u64,
    first_timestamp: Option<Timestamp>,
    last_timestamp: Option<Timestamp>,
}

#[derive(Default)]
struct ThreadCounts {
    name: Option<String>,
    running: u64,
    sleeping: u64,
    unknown: u64,
}

impl ProfileAggregator {
    #[must_use]
    pub fn new(event_capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), event_capacity }
    }

    /// Snapshot the aggregated profile, leaving aggregation running.
    #[must_use]
    pub fn snapshot(&self) -> WallProfile {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut threads: Vec<ThreadProfile> = inner
            .threads
            .iter()
            .map(|(&tid, counts)| ThreadProfile {
                tid,
                name: counts.name.clone().unwrap_or_else(|| "unknown".to_string()),
                running: counts.running,
                sleeping: counts.sleeping,
                unknown: counts.unknown,
            })
            .collect();
        threads.sort_unstable_by_key(|t| std::cmp::Reverse(t.total()));

        let mut hotspots: Vec<(u64, u64)> =
            inner.hotspots.iter().map(|(&pc, &count)| (pc, count)).collect();
        hotspots.sort_unstable_by_key(|&(_, count)| std::cmp::Reverse(count));

        let span = match (inner.first_timestamp, inner.last_timestamp) {
            (Some(first), Some(last)) => Duration(last.0.saturating_sub(first.0)),
            _ => Duration(0),
        };

        WallProfile {
            threads,
            hotspots,
            events: inner.events.clone(),
            events_dropped: inner.events_dropped,
            span,
        }
    }
}

impl SampleSink for ProfileAggregator {
    fn record_sample(&self, sample: &Sample<'_>) {
        let event = SampleEvent::from_sample(sample);
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        inner.first_timestamp.get_or_insert(sample.timestamp);
        inner.last_timestamp = Some(sample.timestamp);

        *inner.hotspots.entry(sample.pc).or_insert(0) += 1;

        let counts = inner.threads.entry(sample.tid).or_default();
        match sample.state {
            ThreadState::Running => counts.running += 1,
            ThreadState::Sleeping => counts.sleeping += 1,
            ThreadState::Unknown => counts.unknown += 1,
        }
        // A registered label beats the kernel comm; either may show up only
        // after the first few samples
        if let Some(label) = &event.label {
            counts.name = Some(label.clone());
        } else if counts.name.is_none() {
            counts.name = os::thread_name(sample.tid);
        }

        if inner.events.len() < self.event_capacity {
            inner.events.push(event);
        } else {
            inner.events_dropped += 1;
        }
    }
}

/// Point-in-time view of an aggregated wall-clock profile.
#[derive(Debug, Clone)]
pub struct WallProfile {
    /// Per-thread sample counts, most sampled first
    pub threads: Vec<ThreadProfile>,
    /// `(pc, samples)`, most frequent first
    pub hotspots: Vec<(u64, u64)>,
    /// Raw sample log, capped at the aggregator's capacity
    pub events: Vec<SampleEvent>,
    /// Samples beyond the log cap (still counted above)
    pub events_dropped: u64,
    /// Time between the first and last recorded sample
    pub span: Duration,
}

/// Sample counts for one thread.
#[derive(Debug, Clone)]
pub struct ThreadProfile {
    pub tid: Tid,
    pub name: String,
    pub running: u64,
    pub sleeping: u64,
    pub unknown: u64,
}

impl ThreadProfile {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.running + self.sleeping + self.unknown
    }
}

impl WallProfile {
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.threads.iter().map(ThreadProfile::total).sum()
    }

    /// Render a plain-text summary table.
    ///
    /// With a symbolizer, hotspot addresses resolve to function names;
    /// without one, raw addresses are printed.
    #[must_use]
    pub fn render_summary(&self, symbolizer: Option<&Symbolizer>) -> String {
        let mut out = String::new();
        let total = self.total_samples();

        let _ = writeln!(out, "WALL-CLOCK PROFILE  ({}, {} samples)", self.span, total);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  {:<10} {:<20} {:>6}  {:>8}  {:>8}  {:>8}",
            "TID", "THREAD", "RUN%", "RUNNING", "SLEEPING", "TOTAL"
        );

        for thread in &self.threads {
            let thread_total = thread.total();
            let run_pct = if thread_total > 0 {
                thread.running as f64 / thread_total as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "  {:<10} {:<20} {:>5.1}%  {:>8}  {:>8}  {:>8}",
                thread.tid.0, thread.name, run_pct, thread.running, thread.sleeping, thread_total
            );
        }

        if !self.hotspots.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "HOT ADDRESSES");
            for &(pc, count) in self.hotspots.iter().take(MAX_RENDERED_HOTSPOTS) {
                let pct = if total > 0 { count as f64 / total as f64 * 100.0 } else { 0.0 };
                let name = symbolizer
                    .map_or_else(|| format!("0x{pc:x}"), |s| s.resolve_runtime(pc).describe());
                let _ = writeln!(out, "  {pct:>5.1}%  {count:>6}  {name}");
            }
        }

        if self.events_dropped > 0 {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "  ({} samples beyond the raw log cap were counted but not retained)",
                self.events_dropped
            );
        }

        out
    }
}
