//! Thread workload demo for wallscope
//!
//! Spawns threads with very different time profiles and samples them all:
//! - a spinner that never leaves the CPU
//! - a sleeper that never touches it
//! - a pair fighting over one mutex
//!
//! Run with: cargo run --example threads-demo
//!
//! The summary should show the spinner near 100% RUN, the sleeper near 0%,
//! and the lock pair somewhere in between. A CPU profiler would show the
//! sleeper and the lock waits as nothing at all; wall-clock mode is the
//! point of this demo.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wallscope::recording::aggregator::ProfileAggregator;
use wallscope::sampling::{SamplerConfig, WallClockSampler};
use wallscope::symbolization::Symbolizer;
use wallscope::thread_token;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("wallscope threads demo: 4 workload threads, 3 seconds\n");

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    {
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            thread_token::install("spinner");
            spin(&stop);
        }));
    }
    {
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            thread_token::install("sleeper");
            doze(&stop);
        }));
    }

    let lock = Arc::new(Mutex::new(0u64));
    for i in 0..2 {
        let stop = Arc::clone(&stop);
        let lock = Arc::clone(&lock);
        handles.push(std::thread::spawn(move || {
            thread_token::install(format!("locker-{i}"));
            fight_over(&lock, &stop);
        }));
    }

    let aggregator = Arc::new(ProfileAggregator::new(50_000));
    let config = SamplerConfig { interval_ns: Some(5_000_000), ..SamplerConfig::default() };
    let sampler = WallClockSampler::start(&config, aggregator.clone())?;

    std::thread::sleep(Duration::from_secs(3));
    let stats = sampler.stop();

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().ok();
    }

    let symbolizer = Symbolizer::for_current_exe().ok();
    println!("{}", aggregator.snapshot().render_summary(symbolizer.as_ref()));
    println!("{stats}");
    Ok(())
}

/// Pure CPU burn; every sample of this thread should say running.
#[inline(never)]
fn spin(stop: &AtomicBool) {
    let mut acc = 1u64;
    while !stop.load(Ordering::Relaxed) {
        acc = acc.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(7);
        std::hint::black_box(acc);
    }
}

/// Parked in nanosleep; only wall-clock sampling sees this thread at all.
#[inline(never)]
fn doze(stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Alternates between holding the lock (running) and waiting on it.
#[inline(never)]
fn fight_over(lock: &Mutex<u64>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let mut guard = lock.lock().unwrap();
        for _ in 0..200_000 {
            *guard = guard.wrapping_add(std::hint::black_box(1));
        }
        drop(guard);
        std::thread::sleep(Duration::from_millis(1));
    }
}
