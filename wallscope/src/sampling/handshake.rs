//! The stop-and-publish handshake between the cycle thread and a target
//!
//! One sample works like this: the cycle thread arms the slot and signals
//! the target; the target's signal handler publishes its execution context
//! through the slot and parks; the cycle thread classifies and records the
//! context, then releases the target. The slot is a handful of atomics
//! coordinated with CAS and fenced polling; a mutex is off the table because
//! one side of the protocol runs in signal context.

#![allow(unsafe_code)] // signal handler plus reads of the published context

use std::io;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

use log::trace;

use crate::arch::Frame;
use crate::domain::{Duration, SampleKind, Tid, Timestamp};
use crate::os;
use crate::recording::{Sample, SampleSink};
use crate::symbolization::CodeMap;
use crate::thread_token::{self, ThreadToken};

use super::thread_state::{self, ThreadState};
use super::{SamplerStats, SAMPLE_SIGNAL};

/// How long the cycle thread waits for a target to publish its context.
/// Expiry means the target never got the signal (exited, or delivery is
/// stuck); the target-side wait has no such bound.
const HANDSHAKE_TIMEOUT_NS: u64 = 10_000_000;

/// What a signal handler publishes. Lives on the handler's stack; the
/// pointer in the slot is valid exactly until `walked` is set.
struct SampledContext {
    ucontext: *mut libc::c_void,
    token: *const ThreadToken,
}

/// The single-slot mailbox shared between the cycle thread and whichever
/// thread the current sample signal lands on.
///
/// `target` names the one thread expected to publish (-1 = nobody);
/// `settable` is the publication permit, consumed by CAS so duplicate signal
/// deliveries cannot publish twice; `ready` flags a published `context`;
/// `walked` releases the parked target. All four are reset together when a
/// request begins.
struct HandshakeSlot {
    target: AtomicI32,
    context: AtomicPtr<SampledContext>,
    settable: AtomicBool,
    ready: AtomicBool,
    walked: AtomicBool,
    claimed: AtomicBool,
}

impl HandshakeSlot {
    const fn new() -> Self {
        Self {
            target: AtomicI32::new(-1),
            context: AtomicPtr::new(ptr::null_mut()),
            settable: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            walked: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }
}

/// The handler needs a registration context at an address that can never
/// dangle, no matter how a stop races with an in-flight signal; a static is
/// the one thing with that property. [`SlotClaim`] layers exclusive
/// ownership on top.
static SLOT: HandshakeSlot = HandshakeSlot::new();

/// Exclusive use of the process-wide handshake slot.
///
/// Held by the running sampler; released on drop. Only one can exist at a
/// time, which is what makes "single outstanding request" enforceable.
pub(crate) struct SlotClaim {
    slot: &'static HandshakeSlot,
}

impl SlotClaim {
    /// Claim the slot, or `None` if another sampler holds it.
    pub(crate) fn acquire() -> Option<Self> {
        if SLOT
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        SLOT.target.store(-1, Ordering::SeqCst);
        SLOT.context.store(ptr::null_mut(), Ordering::SeqCst);
        SLOT.settable.store(false, Ordering::SeqCst);
        SLOT.ready.store(false, Ordering::SeqCst);
        SLOT.walked.store(false, Ordering::SeqCst);
        Some(Self { slot: &SLOT })
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        // No target first, so a straggling delivery sees nobody to publish
        // for before the claim opens up again
        self.slot.target.store(-1, Ordering::SeqCst);
        self.slot.claimed.store(false, Ordering::SeqCst);
    }
}

/// Install the sample signal handler process-wide.
pub(crate) fn install_handler() -> io::Result<()> {
    os::install_signal_handler(SAMPLE_SIGNAL, sample_signal_handler)
}

/// Poll until `condition` turns false. With a timeout, gives up and returns
/// false once it expires. The SeqCst fence in the loop pairs with the fence
/// the publishing side issues before its stores.
fn wait_while(condition: impl Fn() -> bool, timeout_ns: Option<u64>) -> bool {
    let start = os::nanotime();
    while condition() {
        if let Some(timeout) = timeout_ns {
            if os::nanotime() - start > timeout {
                return false;
            }
        }
        fence(Ordering::SeqCst);
    }
    true
}

/// The sample signal handler. Runs on whichever thread the signal lands on.
///
/// Everything here must be async-signal-safe: no allocation, no locks, no
/// logging, no blocking syscalls, no panics. The body is atomics, a
/// thread-local pointer read, and `clock_gettime`.
extern "C" fn sample_signal_handler(
    _signo: libc::c_int,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // Not the awaited target: either a stale delivery for an earlier request
    // or a pure wakeup poke at the cycle thread. Both are ignored.
    if os::current_thread_id().0 != SLOT.target.load(Ordering::SeqCst) {
        return;
    }

    // Consume the publication permit; losing the race means another
    // invocation on this thread is already publishing
    if SLOT
        .settable
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let mut context =
        SampledContext { ucontext, token: thread_token::current_raw() };
    fence(Ordering::SeqCst);
    SLOT.context.store(ptr::addr_of_mut!(context), Ordering::SeqCst);
    SLOT.ready.store(true, Ordering::SeqCst);

    // Park until the cycle thread has consumed the context. Deliberately no
    // timeout: resuming early would unwind the stack the consumer is reading
    wait_while(|| !SLOT.walked.load(Ordering::SeqCst), None);
}

/// Control-thread side of the protocol.
///
/// Owns everything one sample needs: the sink, the code map for
/// classification, and the stats counters. Constructed per sampling run and
/// moved onto the cycle thread.
pub(crate) struct Handshake {
    slot: &'static HandshakeSlot,
    sink: Arc<dyn SampleSink>,
    code_map: CodeMap,
    interval_ns: u64,
    classify_idle: bool,
    stats: Arc<SamplerStats>,
}

impl Handshake {
    pub(crate) fn new(
        claim: &SlotClaim,
        sink: Arc<dyn SampleSink>,
        code_map: CodeMap,
        interval_ns: u64,
        classify_idle: bool,
        stats: Arc<SamplerStats>,
    ) -> Self {
        Self { slot: claim.slot, sink, code_map, interval_ns, classify_idle, stats }
    }

    /// Sample one thread: arm the slot, signal, await publication, record.
    ///
    /// Returns true when a sample was recorded. False means the thread was
    /// skipped (delivery failed or the handshake timed out); both outcomes
    /// are counted separately in the stats.
    pub(crate) fn sample_thread(&self, tid: Tid) -> bool {
        let slot = self.slot;

        // Arm the slot for this target. Order matters only in that all
        // fields are re-armed before the signal goes out
        slot.target.store(tid.0, Ordering::SeqCst);
        slot.context.store(ptr::null_mut(), Ordering::SeqCst);
        slot.settable.store(true, Ordering::SeqCst);
        slot.walked.store(false, Ordering::SeqCst);
        slot.ready.store(false, Ordering::SeqCst);

        if !os::send_thread_signal(tid, SAMPLE_SIGNAL) {
            slot.target.store(-1, Ordering::SeqCst);
            self.stats.note_signal_failure();
            trace!("{tid}: signal delivery failed, thread gone");
            return false;
        }

        if !wait_while(|| !slot.ready.load(Ordering::SeqCst), Some(HANDSHAKE_TIMEOUT_NS)) {
            slot.target.store(-1, Ordering::SeqCst);
            self.stats.note_handshake_timeout();
            trace!("{tid}: handshake timed out");
            return false;
        }

        let context = slot.context.load(Ordering::SeqCst);
        debug_assert!(!context.is_null(), "ready was set without a published context");
        if context.is_null() {
            slot.walked.store(true, Ordering::SeqCst);
            return false;
        }

        // SAFETY: the publishing thread is parked in its signal handler
        // until `walked` is set, which keeps the context (and the ucontext
        // it points to) alive for this whole block.
        let published = unsafe { &*context };
        let frame = unsafe { Frame::from_ucontext(published.ucontext) };

        let state = if self.classify_idle {
            // SAFETY: the pc comes from an interrupted thread's registers,
            // so it is a mapped instruction address; the code map only
            // vouches for executable regions of this process.
            unsafe { thread_state::classify_frame(&frame, |addr| self.code_map.contains(addr)) }
        } else {
            ThreadState::Unknown
        };

        // SAFETY: tokens are leaked at registration, so a non-null pointer
        // stays valid even past the target thread's death.
        let token = unsafe { published.token.as_ref() };

        let sample = Sample {
            tid,
            timestamp: Timestamp(os::nanotime()),
            pc: frame.pc(),
            interval: Duration(self.interval_ns),
            kind: SampleKind::Execution,
            state,
            token,
        };
        self.sink.record_sample(&sample);
        self.stats.note_sample();

        // Release the parked target
        slot.walked.store(true, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::tests_support::sampler_test_lock;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::{mpsc, Mutex};

    struct CountingSink {
        count: AtomicUsize,
        last_pc: AtomicU64,
        last_state: Mutex<Option<ThreadState>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
                last_pc: AtomicU64::new(0),
                last_state: Mutex::new(None),
            })
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl SampleSink for CountingSink {
        fn record_sample(&self, sample: &Sample<'_>) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.last_pc.store(sample.pc, Ordering::SeqCst);
            *self.last_state.lock().unwrap() = Some(sample.state);
        }
    }

    fn handshake_for_test(
        claim: &SlotClaim,
        sink: Arc<CountingSink>,
        classify_idle: bool,
    ) -> (Handshake, Arc<SamplerStats>) {
        let stats = Arc::new(SamplerStats::default());
        let code_map = CodeMap::load().unwrap();
        let hs = Handshake::new(claim, sink, code_map, 5_000_000, classify_idle, Arc::clone(&stats));
        (hs, stats)
    }

    /// Spawn a thread that spins until told to stop, reporting its tid.
    fn spawn_spinner() -> (Tid, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let (tid_tx, tid_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            tid_tx.send(os::current_thread_id()).unwrap();
            while !stop2.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });
        (tid_rx.recv().unwrap(), stop, handle)
    }

    #[test]
    fn test_live_thread_handshake_records_once() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();

        let sink = CountingSink::new();
        let (hs, stats) = handshake_for_test(&claim, Arc::clone(&sink), true);

        let (tid, stop, handle) = spawn_spinner();
        assert!(hs.sample_thread(tid), "handshake with a live thread failed");

        assert_eq!(sink.count(), 1);
        assert_ne!(sink.last_pc.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshot().samples, 1);
        // A spinning thread classifies as running
        assert_eq!(*sink.last_state.lock().unwrap(), Some(ThreadState::Running));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_classification_disabled_reports_unknown() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();

        let sink = CountingSink::new();
        let (hs, _stats) = handshake_for_test(&claim, Arc::clone(&sink), false);

        let (tid, stop, handle) = spawn_spinner();
        assert!(hs.sample_thread(tid));
        assert_eq!(*sink.last_state.lock().unwrap(), Some(ThreadState::Unknown));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_vanished_thread_fails_fast() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();

        let sink = CountingSink::new();
        let (hs, stats) = handshake_for_test(&claim, Arc::clone(&sink), true);

        // Capture a tid, then let the thread exit completely
        let (tid_tx, tid_rx) = mpsc::channel();
        std::thread::spawn(move || tid_tx.send(os::current_thread_id()).unwrap())
            .join()
            .unwrap();
        let dead_tid = tid_rx.recv().unwrap();

        let start = os::nanotime();
        assert!(!hs.sample_thread(dead_tid));
        let elapsed = os::nanotime() - start;

        assert_eq!(sink.count(), 0);
        assert_eq!(stats.snapshot().signal_failures, 1);
        // Delivery failure short-circuits; nowhere near the 10ms timeout
        // even on a loaded machine
        assert!(elapsed < 1_000_000_000, "took {elapsed}ns");
    }

    #[test]
    fn test_signal_blocked_thread_times_out() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();

        let sink = CountingSink::new();
        let (hs, stats) = handshake_for_test(&claim, Arc::clone(&sink), true);

        // A thread that has the sample signal blocked can receive it but
        // never runs the handler, which is exactly the timeout case
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            // SAFETY: masking a signal on the current thread
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, SAMPLE_SIGNAL);
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
            tid_tx.send(os::current_thread_id()).unwrap();
            done_rx.recv().ok();
        });
        let tid = tid_rx.recv().unwrap();

        let start = os::nanotime();
        assert!(!hs.sample_thread(tid));
        let elapsed = os::nanotime() - start;

        assert_eq!(sink.count(), 0);
        assert_eq!(stats.snapshot().handshake_timeouts, 1);
        assert!(elapsed >= HANDSHAKE_TIMEOUT_NS, "gave up after only {elapsed}ns");

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_stale_delivery_after_walk_publishes_nothing() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();

        let sink = CountingSink::new();
        let (hs, _stats) = handshake_for_test(&claim, Arc::clone(&sink), true);

        let (tid, stop, handle) = spawn_spinner();
        assert!(hs.sample_thread(tid));
        assert_eq!(sink.count(), 1);

        // A duplicate/stale delivery to the same thread: the target still
        // matches but the publication permit is spent, so the handler must
        // return without publishing or parking
        assert!(os::send_thread_signal(tid, SAMPLE_SIGNAL));
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(sink.count(), 1, "stale delivery produced a sample");
        // The spinner is still alive and responsive, so it was not parked
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_wakeup_poke_with_no_target_is_ignored() {
        let _guard = sampler_test_lock();
        let claim = SlotClaim::acquire().expect("slot free");
        install_handler().unwrap();
        drop(claim);

        // Deliver the sample signal to ourselves with nobody targeted; the
        // handler must treat it as a pure wakeup
        assert!(os::send_thread_signal(os::current_thread_id(), SAMPLE_SIGNAL));
    }

    #[test]
    fn test_second_claim_is_refused() {
        let _guard = sampler_test_lock();
        let first = SlotClaim::acquire().expect("slot free");
        assert!(SlotClaim::acquire().is_none());
        drop(first);
        let again = SlotClaim::acquire();
        assert!(again.is_some());
    }

    #[test]
    fn test_wait_while_timeout_expires() {
        let start = os::nanotime();
        assert!(!wait_while(|| true, Some(1_000_000)));
        assert!(os::nanotime() - start >= 1_000_000);
    }

    #[test]
    fn test_wait_while_immediate_pass() {
        assert!(wait_while(|| false, Some(1_000_000)));
        assert!(wait_while(|| false, None));
    }
}
