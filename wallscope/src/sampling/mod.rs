//! # Wall-Clock Sampling Engine
//!
//! Periodically interrupts the process's threads and records where each one
//! is, whether it is on-CPU or parked in the kernel. Unlike a CPU profiler,
//! wall-clock mode samples idle threads too, so time spent blocked on I/O,
//! locks or sleeps shows up with the same weight as burned CPU.
//!
//! ## How a sample happens
//!
//! 1. The cycle thread ([`scheduler`]) sweeps `/proc/self/task`, up to
//!    eight threads per tick.
//! 2. For each eligible thread it runs the [`handshake`]: arm a shared
//!    slot, deliver a signal, wait for the target's handler to publish its
//!    interrupted register state.
//! 3. The published program counter is classified ([`thread_state`]) as
//!    running or sleeping and forwarded to the configured
//!    [`SampleSink`](crate::recording::SampleSink).
//!
//! [`WallClockSampler`] owns the whole arrangement: it claims the
//! process-wide handshake slot, installs the signal handler, spawns the
//! cycle thread, and tears it all down on [`stop`](WallClockSampler::stop)
//! or drop.

pub mod filter;
pub(crate) mod handshake;
pub(crate) mod scheduler;
pub mod thread_state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::domain::{Duration, SamplerError};
use crate::os;
use crate::os::thread_list::ProcessThreads;
use crate::recording::SampleSink;
use crate::symbolization::CodeMap;

pub use filter::{AllThreads, ThreadFilter, TidSetFilter};
pub use thread_state::ThreadState;

/// The signal a sample rides on. `SIGVTALRM` is free in practice: nothing
/// in the std runtime uses it, and the handler ignores deliveries it did
/// not ask for.
pub const SAMPLE_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// Tick interval when the configuration does not pin one down.
pub const DEFAULT_INTERVAL_NS: u64 = 10_000_000;

/// Which event drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Sample elapsed time: every thread, running or not.
    Wall,
    /// Sample CPU time: only threads the kernel reports runnable.
    Cpu,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wall => write!(f, "wall"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Sampler configuration.
///
/// Interval resolution: an explicit wall interval wins over the generic
/// one; with neither set the engine default applies, stretched 5x in
/// idle-sampling mode because sweeping all threads costs proportionally
/// more than sweeping the runnable few.
#[derive(Clone)]
pub struct SamplerConfig {
    pub event: EventKind,
    /// Generic interval override in nanoseconds.
    pub interval_ns: Option<u64>,
    /// Wall-mode interval override in nanoseconds. Setting this also opts
    /// a [`EventKind::Cpu`] run into idle sampling.
    pub wall_interval_ns: Option<u64>,
    pub filter: Arc<dyn ThreadFilter>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            event: EventKind::Wall,
            interval_ns: None,
            wall_interval_ns: None,
            filter: Arc::new(AllThreads),
        }
    }
}

impl SamplerConfig {
    pub(crate) fn sample_idle_threads(&self) -> bool {
        self.wall_interval_ns.is_some() || self.event == EventKind::Wall
    }

    pub(crate) fn effective_interval_ns(&self) -> u64 {
        match self.wall_interval_ns.or(self.interval_ns) {
            Some(ns) if ns > 0 => ns,
            _ if self.sample_idle_threads() => DEFAULT_INTERVAL_NS * 5,
            _ => DEFAULT_INTERVAL_NS,
        }
    }
}

/// Counters a sampling run accumulates. Shared with the cycle thread;
/// readable at any time through [`SamplerStats::snapshot`].
#[derive(Debug, Default)]
pub struct SamplerStats {
    samples: AtomicU64,
    signal_failures: AtomicU64,
    handshake_timeouts: AtomicU64,
}

impl SamplerStats {
    pub(crate) fn note_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_signal_failure(&self) {
        self.signal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_handshake_timeout(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            signal_failures: self.signal_failures.load(Ordering::Relaxed),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the run counters.
///
/// `signal_failures` counts threads that vanished before delivery;
/// `handshake_timeouts` counts threads that got the signal but never
/// published (signal blocked, or the thread died mid-handshake). Neither
/// produces a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub samples: u64,
    pub signal_failures: u64,
    pub handshake_timeouts: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} samples ({} failed deliveries, {} handshake timeouts)",
            self.samples, self.signal_failures, self.handshake_timeouts
        )
    }
}

/// Flags shared between the controlling thread and the cycle thread.
pub(crate) struct SamplerShared {
    running: AtomicBool,
    enabled: AtomicBool,
}

impl SamplerShared {
    fn new() -> Self {
        Self { running: AtomicBool::new(true), enabled: AtomicBool::new(true) }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// A running wall-clock sampling session.
///
/// At most one exists per process; [`start`](Self::start) refuses a second.
/// Dropping the sampler stops it, but [`stop`](Self::stop) is the polite
/// way out since it hands back the final counters.
pub struct WallClockSampler {
    shared: Arc<SamplerShared>,
    stats: Arc<SamplerStats>,
    handle: Option<JoinHandle<()>>,
    claim: Option<handshake::SlotClaim>,
    interval_ns: u64,
    sample_idle: bool,
}

impl WallClockSampler {
    /// Start sampling every thread of this process into `sink`.
    ///
    /// # Errors
    /// Fails if a sampler is already running, the thread list or signal
    /// handler cannot be set up, or the cycle thread cannot be spawned.
    pub fn start(config: &SamplerConfig, sink: Arc<dyn SampleSink>) -> Result<Self, SamplerError> {
        let claim = handshake::SlotClaim::acquire().ok_or(SamplerError::AlreadyRunning)?;

        let sample_idle = config.sample_idle_threads();
        let interval_ns = config.effective_interval_ns();

        let thread_list = ProcessThreads::new().map_err(SamplerError::ThreadList)?;
        let code_map = CodeMap::load().unwrap_or_else(|err| {
            // Without a code map the classifier still works, it just cannot
            // probe instructions preceding a page boundary
            warn!("Could not snapshot executable regions: {err:#}");
            CodeMap::default()
        });

        handshake::install_handler().map_err(SamplerError::HandlerInstall)?;

        let stats = Arc::new(SamplerStats::default());
        let shared = Arc::new(SamplerShared::new());
        let handshake = handshake::Handshake::new(
            &claim,
            sink,
            code_map,
            interval_ns,
            sample_idle,
            Arc::clone(&stats),
        );

        info!(
            "Starting wall-clock sampler: interval {}, idle threads {}",
            Duration(interval_ns),
            if sample_idle { "sampled" } else { "skipped" }
        );

        let shared_for_cycle = Arc::clone(&shared);
        let filter = Arc::clone(&config.filter);
        let handle = std::thread::Builder::new()
            .name("wallscope-cycle".into())
            .spawn(move || {
                scheduler::timer_loop(
                    &shared_for_cycle,
                    thread_list,
                    &filter,
                    &handshake,
                    interval_ns,
                    sample_idle,
                );
            })
            .map_err(SamplerError::Spawn)?;

        Ok(Self {
            shared,
            stats,
            handle: Some(handle),
            claim: Some(claim),
            interval_ns,
            sample_idle,
        })
    }

    /// Stop sampling, wait for the cycle thread, and return the final
    /// counters. Recorded samples stay wherever the sink put them.
    pub fn stop(mut self) -> StatsSnapshot {
        self.stop_inner();
        self.stats.snapshot()
    }

    /// Suspend sampling without tearing anything down.
    pub fn pause(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        debug!("sampling paused");
    }

    /// Resume after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        debug!("sampling resumed");
    }

    /// Live view of the run counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    #[must_use]
    pub fn samples_idle_threads(&self) -> bool {
        self.sample_idle
    }

    fn stop_inner(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);

        // Knock the cycle thread out of its interval sleep; the handler
        // treats an untargeted delivery as a pure wakeup
        use std::os::unix::thread::JoinHandleExt;
        os::pthread_signal(handle.as_pthread_t(), SAMPLE_SIGNAL);

        if handle.join().is_err() {
            log::error!("sampling cycle thread panicked");
        }

        // Releasing the claim only after the cycle thread is gone keeps the
        // slot out of reach of in-flight handshakes
        drop(self.claim.take());

        info!("Wall-clock sampler stopped: {}", self.stats.snapshot());
    }
}

impl Drop for WallClockSampler {
    fn drop(&mut self) {
        self.stop_inner();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tid;
    use crate::recording::aggregator::ProfileAggregator;
    use crate::sampling::tests_support::sampler_test_lock;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_interval_resolution() {
        let mut config = SamplerConfig::default();
        assert_eq!(config.effective_interval_ns(), DEFAULT_INTERVAL_NS * 5);
        assert!(config.sample_idle_threads());

        config.event = EventKind::Cpu;
        assert_eq!(config.effective_interval_ns(), DEFAULT_INTERVAL_NS);
        assert!(!config.sample_idle_threads());

        config.interval_ns = Some(5_000_000);
        assert_eq!(config.effective_interval_ns(), 5_000_000);

        // An explicit wall interval wins and opts into idle sampling
        config.wall_interval_ns = Some(7_000_000);
        assert_eq!(config.effective_interval_ns(), 7_000_000);
        assert!(config.sample_idle_threads());

        // Zero means "use the default", not "sample as fast as possible"
        config.interval_ns = None;
        config.wall_interval_ns = Some(0);
        config.event = EventKind::Wall;
        assert_eq!(config.effective_interval_ns(), DEFAULT_INTERVAL_NS * 5);
    }

    struct Workload {
        busy_tid: Tid,
        sleepy_tid: Tid,
        stop: Arc<AtomicBool>,
        handles: Vec<JoinHandle<()>>,
    }

    impl Workload {
        fn spawn() -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let (tid_tx, tid_rx) = mpsc::channel();

            let stop_busy = Arc::clone(&stop);
            let tx_busy = tid_tx.clone();
            let busy = std::thread::spawn(move || {
                tx_busy.send(os::current_thread_id()).unwrap();
                while !stop_busy.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            });
            let busy_tid = tid_rx.recv().unwrap();

            let stop_sleepy = Arc::clone(&stop);
            let sleepy = std::thread::spawn(move || {
                tid_tx.send(os::current_thread_id()).unwrap();
                while !stop_sleepy.load(Ordering::Relaxed) {
                    std::thread::sleep(StdDuration::from_millis(5));
                }
            });
            let sleepy_tid = tid_rx.recv().unwrap();

            Self { busy_tid, sleepy_tid, stop, handles: vec![busy, sleepy] }
        }

        fn finish(self) {
            self.stop.store(true, Ordering::Relaxed);
            for handle in self.handles {
                handle.join().unwrap();
            }
        }
    }

    fn fast_config() -> SamplerConfig {
        SamplerConfig { interval_ns: Some(2_000_000), ..SamplerConfig::default() }
    }

    #[test]
    fn test_sampler_records_busy_and_idle_threads() {
        let _guard = sampler_test_lock();
        let workload = Workload::spawn();

        let aggregator = Arc::new(ProfileAggregator::new(4096));
        let as_sink: Arc<dyn SampleSink> = aggregator.clone();
        let sampler = WallClockSampler::start(&fast_config(), as_sink).expect("sampler start");

        std::thread::sleep(StdDuration::from_millis(300));
        let stats = sampler.stop();
        assert!(stats.samples > 0, "no samples after 300ms: {stats}");

        let profile = aggregator.snapshot();
        let sampled: Vec<Tid> = profile.threads.iter().map(|t| t.tid).collect();
        assert!(sampled.contains(&workload.busy_tid), "busy thread never sampled");
        // Wall mode must also catch the thread that spends its life asleep
        assert!(sampled.contains(&workload.sleepy_tid), "sleeping thread never sampled");

        let busy = profile.threads.iter().find(|t| t.tid == workload.busy_tid).unwrap();
        assert!(busy.running > 0, "spinning thread recorded no running samples");

        workload.finish();
    }

    #[test]
    fn test_stop_freezes_counts() {
        let _guard = sampler_test_lock();
        let workload = Workload::spawn();

        let aggregator = Arc::new(ProfileAggregator::new(4096));
        let as_sink: Arc<dyn SampleSink> = aggregator.clone();
        let sampler = WallClockSampler::start(&fast_config(), as_sink).expect("sampler start");

        std::thread::sleep(StdDuration::from_millis(150));
        let stats = sampler.stop();

        let at_stop = aggregator.snapshot().total_samples();
        assert_eq!(stats.samples, at_stop);

        // No cycle thread left, so nothing can trickle in afterwards
        std::thread::sleep(StdDuration::from_millis(100));
        assert_eq!(aggregator.snapshot().total_samples(), at_stop);

        workload.finish();
    }

    #[test]
    fn test_second_sampler_is_refused_until_stop() {
        let _guard = sampler_test_lock();

        let first = WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(16)))
            .expect("first sampler");

        match WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(16))) {
            Err(SamplerError::AlreadyRunning) => {}
            Err(other) => panic!("expected AlreadyRunning, got {other}"),
            Ok(_) => panic!("second concurrent sampler was allowed"),
        }

        first.stop();

        let again = WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(16)))
            .expect("restart after stop");
        again.stop();
    }

    #[test]
    fn test_pause_and_resume() {
        let _guard = sampler_test_lock();
        let workload = Workload::spawn();

        let sampler =
            WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(4096)))
                .expect("sampler start");

        std::thread::sleep(StdDuration::from_millis(100));
        sampler.pause();
        // Let any in-flight tick drain before taking the baseline
        std::thread::sleep(StdDuration::from_millis(60));
        let paused_at = sampler.stats().samples;

        std::thread::sleep(StdDuration::from_millis(150));
        assert_eq!(sampler.stats().samples, paused_at, "samples recorded while paused");

        sampler.resume();
        std::thread::sleep(StdDuration::from_millis(150));
        assert!(sampler.stats().samples > paused_at, "no samples after resume");

        sampler.stop();
        workload.finish();
    }

    #[test]
    fn test_drop_stops_the_cycle_thread() {
        let _guard = sampler_test_lock();

        {
            let _sampler =
                WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(4096)))
                    .expect("sampler start");
            std::thread::sleep(StdDuration::from_millis(50));
        }

        // Sampler dropped; the slot must be reclaimable immediately
        let again = WallClockSampler::start(&fast_config(), Arc::new(ProfileAggregator::new(16)))
            .expect("restart after drop");
        again.stop();
    }
}
