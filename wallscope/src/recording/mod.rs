//! Sample recording
//!
//! The engine hands every completed handshake to a [`SampleSink`] exactly
//! once, from the sampling cycle thread, while the sampled thread is still
//! parked in its signal handler. Sinks must therefore be quick; anything
//! slow belongs behind a channel.
//!
//! Provided sinks: [`ProfileAggregator`](aggregator::ProfileAggregator) for
//! in-memory profiles, [`ChannelSink`] to feed a consumer thread, and
//! [`FanoutSink`] to combine them.

pub mod aggregator;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::{Duration, SampleKind, Tid, Timestamp};
use crate::sampling::thread_state::ThreadState;
use crate::thread_token::ThreadToken;

/// One captured sample, borrowed for the duration of the sink call.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub tid: Tid,
    pub timestamp: Timestamp,
    /// Program counter the thread was interrupted at
    pub pc: u64,
    /// Sampling interval this sample represents
    pub interval: Duration,
    pub kind: SampleKind,
    pub state: ThreadState,
    /// The thread's registration token, when it installed one
    pub token: Option<&'a ThreadToken>,
}

/// Consumer of captured samples.
///
/// Called from the sampling cycle thread. Implementations must not block
/// for long and must never panic; the engine offers no recovery path in the
/// middle of a handshake.
pub trait SampleSink: Send + Sync {
    fn record_sample(&self, sample: &Sample<'_>);
}

/// Owned copy of a sample, for consumers outside the sink call.
#[derive(Debug, Clone)]
pub struct SampleEvent {
    pub tid: Tid,
    pub timestamp: Timestamp,
    pub pc: u64,
    pub interval: Duration,
    pub state: ThreadState,
    pub label: Option<String>,
    pub task_id: Option<u64>,
}

impl SampleEvent {
    #[must_use]
    pub fn from_sample(sample: &Sample<'_>) -> Self {
        Self {
            tid: sample.tid,
            timestamp: sample.timestamp,
            pc: sample.pc,
            interval: sample.interval,
            state: sample.state,
            label: sample.token.map(|t| t.label().to_string()),
            task_id: sample.token.map(ThreadToken::task_id).filter(|&id| id != 0),
        }
    }
}

/// Forwards samples into a bounded channel, dropping when the consumer lags.
///
/// Dropping beats blocking here: a full channel must not stall the cycle
/// thread while a sampled thread sits parked in its handler.
pub struct ChannelSink {
    tx: Sender<SampleEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the consumer thread.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<SampleEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    /// Samples discarded because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleSink for ChannelSink {
    fn record_sample(&self, sample: &Sample<'_>) {
        if self.tx.try_send(SampleEvent::from_sample(sample)).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                trace!("sample channel full, {dropped} samples dropped so far");
            }
        }
    }
}

/// Delivers every sample to each of a set of sinks, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SampleSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn SampleSink>>) -> Self {
        Self { sinks }
    }
}

impl SampleSink for FanoutSink {
    fn record_sample(&self, sample: &Sample<'_>) {
        for sink in &self.sinks {
            sink.record_sample(sample);
        }
    }
}
