//! Tokio workload demo for wallscope
//!
//! Profiles a multi-threaded Tokio runtime from the inside. Six polite
//! tasks await most of the time; one villain blocks its worker with
//! CPU-bound bursts. Worker threads get labelled via `on_thread_start`,
//! and each task tags its current worker's token with its task id, so the
//! villain's bursts are attributable in an exported trace.
//!
//! Run with: cargo run --example tokio-demo
//!
//! Expect the workers to be mostly sleeping (parked in the runtime's
//! driver) with run-time spikes on whichever worker hosts the villain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use wallscope::recording::aggregator::ProfileAggregator;
use wallscope::sampling::{SamplerConfig, WallClockSampler};
use wallscope::symbolization::Symbolizer;
use wallscope::thread_token;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .on_thread_start(|| {
            let name = std::thread::current().name().map_or_else(
                || "tokio-worker".to_string(),
                std::string::ToString::to_string,
            );
            thread_token::install(name);
        })
        .build()?;

    runtime.block_on(profile_the_runtime())
}

async fn profile_the_runtime() -> anyhow::Result<()> {
    println!("wallscope tokio demo: 4 workers, 6 polite tasks, 1 villain\n");

    let aggregator = Arc::new(ProfileAggregator::new(50_000));
    let config = SamplerConfig { interval_ns: Some(5_000_000), ..SamplerConfig::default() };
    let sampler = WallClockSampler::start(&config, aggregator.clone())?;

    let mut tasks = Vec::new();
    for id in 1..=6 {
        tasks.push(tokio::spawn(well_behaved(id)));
    }
    tasks.push(tokio::spawn(villain()));

    for task in tasks {
        task.await?;
    }

    let stats = sampler.stop();

    let symbolizer = Symbolizer::for_current_exe().ok();
    println!("{}", aggregator.snapshot().render_summary(symbolizer.as_ref()));
    println!("{stats}");
    Ok(())
}

/// Awaits constantly; its worker spends the wait parked in the driver.
async fn well_behaved(id: u64) {
    for _ in 0..30 {
        if let Some(token) = thread_token::current() {
            token.set_task_id(id);
        }
        sleep(Duration::from_millis(100)).await;
        std::hint::black_box((0..1_000).sum::<u64>());
    }
}

/// Burns the CPU for half a second at a time without yielding (bad!).
async fn villain() {
    for _ in 0..3 {
        sleep(Duration::from_millis(400)).await;

        if let Some(token) = thread_token::current() {
            token.set_task_id(999);
        }

        let started = Instant::now();
        let mut acc = 0u64;
        while started.elapsed() < Duration::from_millis(500) {
            for _ in 0..100_000 {
                acc = acc.wrapping_add(std::hint::black_box(1));
            }
        }
        std::hint::black_box(acc);
    }
}
