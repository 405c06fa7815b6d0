//! # Wallscope - Signal-based Wall-Clock Profiler
//!
//! Wallscope is a low-overhead profiling library that measures where the
//! threads of a Rust process spend *elapsed* time, not just CPU time. A
//! thread parked in `read(2)`, waiting on a lock, or sleeping counts the
//! same as one burning a core, which is what you want when the question is
//! "why is this slow?" rather than "what is hot?".
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Profiled Process                           │
//! │   any thread, running or parked, with or without a token        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ SIGVTALRM per sample
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Wallscope (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │  Scheduler   │──▶│  Handshake   │──▶│  Recording   │        │
//! │  │ (cycle loop) │   │ (slot+signal)│   │ (sinks/agg)  │        │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘        │
//! │         │                  │                  │                │
//! │         ▼                  ▼                  ▼                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │ Thread List  │   │ Thread State │   │    Export    │        │
//! │  │ (/proc/task) │   │ (pc classify)│   │ (trace.json) │        │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘        │
//! │                                               │                │
//! │                                        ┌──────────────┐        │
//! │                                        │  Symbolizer  │        │
//! │                                        │   (DWARF)    │        │
//! │                                        └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`sampling`]: The engine. Cycle scheduling, the signal handshake,
//!   thread-state classification, filters, and the
//!   [`WallClockSampler`](sampling::WallClockSampler) lifecycle.
//!
//! - [`recording`]: Where samples go. The [`SampleSink`](recording::SampleSink)
//!   trait plus ready-made sinks: an aggregating profile builder, a
//!   non-blocking channel sink for live streaming, and a fan-out.
//!
//! - [`symbolization`]: Convert sampled program counters to function names
//!   - Uses DWARF debug information via `addr2line`, with an ELF symbol
//!     table fallback for release builds
//!   - Handles PIE (Position Independent Executable) address adjustment
//!
//! - [`export`]: Generate Chrome Trace Event Format JSON for visualization
//!   - Compatible with Perfetto, Speedscope, Chrome's `chrome://tracing`
//!
//! ### Platform and Support Modules
//!
//! - [`os`]: Thin wrappers over Linux syscalls and `/proc` reads
//!
//! - [`arch`]: Per-architecture register and instruction decoding
//!   (x86_64 and aarch64)
//!
//! - [`thread_token`]: Optional per-thread labels and task ids that
//!   samples pick up, for readable profiles
//!
//! - [`cli`] / [`preflight`]: Argument parsing and environment checks for
//!   the bundled binary
//!
//! - [`domain`]: Core domain types (Pid, Tid, Timestamp, errors)
//!
//! ## How a Sample Happens
//!
//! 1. A dedicated cycle thread walks `/proc/self/task`, up to 8 threads
//!    per tick, shrinking the tick interval so the per-thread rate holds.
//! 2. Each eligible thread gets `SIGVTALRM` via `tgkill`; its handler
//!    publishes the interrupted register state through a single-slot
//!    mailbox and parks until the cycle thread has read it.
//! 3. The program counter is classified (running vs sleeping in a
//!    syscall) and the sample lands in the configured sink.
//!
//! ## Typical Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wallscope::recording::aggregator::ProfileAggregator;
//! use wallscope::sampling::{SamplerConfig, WallClockSampler};
//!
//! # fn main() -> anyhow::Result<()> {
//! let aggregator = Arc::new(ProfileAggregator::new(100_000));
//! let sampler = WallClockSampler::start(&SamplerConfig::default(), aggregator.clone())?;
//!
//! // ... run the interesting part of your program ...
//!
//! let stats = sampler.stop();
//! println!("{}", aggregator.snapshot().render_summary(None));
//! println!("{stats}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Wall-clock sampling**: idle threads are sampled too; blocked time
//!   is visible instead of vanishing from the profile
//! - **Signal handshake**: the sampled thread stops itself and publishes
//!   its own context, so no ptrace and no stopping the world
//! - **PIE/ASLR**: position-independent executables require address
//!   relocation before DWARF lookup
//! - **Syscall classification**: a thread whose pc sits on (or just past)
//!   a syscall instruction was blocked in the kernel, not running

// Expose modules for testing
pub mod arch;
pub mod cli;
pub mod domain;
pub mod export;
pub mod os;
pub mod preflight;
pub mod recording;
pub mod sampling;
pub mod symbolization;
pub mod thread_token;
