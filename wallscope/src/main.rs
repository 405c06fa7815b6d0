//! # wallscope - Main Entry Point
//!
//! Self-profiling demo binary: spawns a labelled workload (busy spinners
//! and sleepers), samples the whole process, prints a wall-clock summary
//! and optionally exports the timeline as a Chrome trace.
//!
//! Operational modes:
//! - **Summary** (default): run for `--duration` seconds, print the report
//! - **Live** (`--live`): additionally stream each sample to stdout
//! - **Export** (`--export trace.json`): write the sample timeline for
//!   `chrome://tracing` / Perfetto

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use wallscope::cli::Args;
use wallscope::export::ChromeTraceExporter;
use wallscope::preflight::run_preflight_checks;
use wallscope::recording::aggregator::ProfileAggregator;
use wallscope::recording::{ChannelSink, FanoutSink, SampleEvent, SampleSink};
use wallscope::sampling::{SamplerConfig, WallClockSampler};
use wallscope::symbolization::Symbolizer;
use wallscope::thread_token;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

/// Samples the aggregator keeps verbatim for export; counting continues
/// past this cap, only the per-sample log stops growing.
const EVENT_LOG_CAPACITY: usize = 200_000;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

/// Demo threads for the profiler to look at, each registering a thread
/// token so the report shows labels instead of bare tids.
struct DemoWorkload {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl DemoWorkload {
    fn spawn(busy: usize, sleepy: usize) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(busy + sleepy);

        for i in 0..busy {
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("busy-{i}"))
                .spawn(move || {
                    thread_token::install(format!("busy-{i}"));
                    busy_work(&stop);
                })
                .context("Failed to spawn workload thread")?;
            handles.push(handle);
        }

        for i in 0..sleepy {
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("sleepy-{i}"))
                .spawn(move || {
                    thread_token::install(format!("sleepy-{i}"));
                    sleepy_work(&stop);
                })
                .context("Failed to spawn workload thread")?;
            handles.push(handle);
        }

        Ok(Self { stop, handles })
    }

    fn finish(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.join().ok();
        }
    }
}

/// Spin with a little arithmetic so samples land in a recognizable frame.
#[inline(never)]
fn busy_work(stop: &AtomicBool) {
    let mut acc = 0x2545_f491_4f6c_dd1d_u64;
    while !stop.load(Ordering::Relaxed) {
        acc ^= acc << 13;
        acc ^= acc >> 7;
        acc ^= acc << 17;
        std::hint::black_box(acc);
    }
}

/// Park in short sleeps; wall mode must still see this thread.
#[inline(never)]
fn sleepy_work(stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(3));
    }
}

/// Stream raw samples off the channel until the sampler drops its sink.
fn spawn_live_printer(rx: crossbeam_channel::Receiver<SampleEvent>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            let state = event.state.to_string();
            let label = event.label.as_deref().unwrap_or("-");
            println!(
                "{:>12.6} {} {:<8} 0x{:012x} {}",
                event.timestamp.as_seconds(),
                event.tid,
                state,
                event.pc,
                label
            );
        }
    })
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    // Run pre-flight checks before anything else
    run_preflight_checks(quiet)?;

    let config = SamplerConfig {
        event: args.event.into(),
        interval_ns: args.interval.map(|ms| ms * 1_000_000),
        wall_interval_ns: args.wall_interval.map(|ms| ms * 1_000_000),
        ..SamplerConfig::default()
    };

    if !quiet {
        println!("wallscope v{}", env!("CARGO_PKG_VERSION"));
        println!("event: {}", config.event);
        println!("workload: {} busy, {} sleepy", args.busy, args.sleepy);
        if let Some(ref path) = args.export {
            println!("export: {}", path.display());
        }
    }

    let workload = DemoWorkload::spawn(args.busy, args.sleepy)?;

    // Sinks: always aggregate; optionally tee raw samples to stdout
    let aggregator = Arc::new(ProfileAggregator::new(EVENT_LOG_CAPACITY));
    let (sink, live_printer): (Arc<dyn SampleSink>, Option<JoinHandle<()>>) = if args.live {
        let (channel_sink, rx) = ChannelSink::new(4096);
        let printer = spawn_live_printer(rx);
        let fanout = FanoutSink::new(vec![
            Arc::clone(&aggregator) as Arc<dyn SampleSink>,
            Arc::new(channel_sink),
        ]);
        (Arc::new(fanout), Some(printer))
    } else {
        (Arc::clone(&aggregator) as Arc<dyn SampleSink>, None)
    };

    let sampler =
        WallClockSampler::start(&config, sink).context("Failed to start the wall-clock sampler")?;

    if !quiet {
        println!("interval: {}", wallscope::domain::Duration(sampler.interval_ns()));
        println!(
            "idle threads: {}",
            if sampler.samples_idle_threads() { "sampled" } else { "skipped" }
        );
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Track start time for duration limit
    let profiling_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

    // Track why we exited the loop
    let mut exit_reason = "interrupted";

    loop {
        // Check for duration timeout
        if let Some(limit) = duration_limit {
            if profiling_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        // Use select to handle both sleep and Ctrl+C
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {
                // Continue loop
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    let stats = sampler.stop();
    workload.finish();

    // The channel sink is gone with the sampler, so the printer drains and exits
    if let Some(printer) = live_printer {
        printer.join().ok();
    }

    let profile = aggregator.snapshot();

    if !quiet {
        let elapsed = profiling_start.elapsed();
        eprintln!("\n{exit_reason}: {:.1}s, {stats}", elapsed.as_secs_f64());

        let symbolizer = match Symbolizer::for_current_exe() {
            Ok(sym) => Some(sym),
            Err(e) => {
                warn!("Symbolizer unavailable, reporting raw addresses: {e:#}");
                None
            }
        };
        println!("{}", profile.render_summary(symbolizer.as_ref()));
    }

    // Export trace if enabled
    if let Some(ref export_path) = args.export {
        if profile.events_dropped > 0 {
            warn!("{} samples beyond the event log cap will not be exported", profile.events_dropped);
        }

        let export_symbolizer =
            Symbolizer::for_current_exe().context("Failed to create symbolizer for trace export")?;
        let mut exporter = ChromeTraceExporter::new(Some(export_symbolizer));
        exporter.add_samples(&profile.events);

        let file = File::create(export_path).context("Failed to create trace output file")?;
        exporter.export(BufWriter::new(file)).context("Failed to export trace")?;

        if !quiet {
            println!("saved: {} ({} events)", export_path.display(), exporter.event_count());
        }
    }

    Ok(())
}
