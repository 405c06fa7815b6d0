//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::sampling::EventKind;

#[derive(Parser)]
#[command(
    name = "wallscope",
    about = "Wall-clock profiler: sample where every thread spends its time",
    after_help = "\
EXAMPLES:
    wallscope                                 Profile the demo workload for 5s
    wallscope --duration 10 --export t.json   Record 10s, write a Chrome trace
    wallscope --event cpu --interval 5        CPU mode, 5ms between samples
    wallscope --live --quiet                  Stream raw samples to stdout"
)]
pub struct Args {
    /// Sampling event: wall catches idle threads, cpu only runnable ones
    #[arg(long, value_enum, default_value_t = EventArg::Wall)]
    pub event: EventArg,

    /// Interval between samples in milliseconds
    #[arg(short, long, value_name = "MS")]
    pub interval: Option<u64>,

    /// Wall-mode interval in milliseconds (wins over --interval, forces
    /// idle sampling even with --event cpu)
    #[arg(long, value_name = "MS")]
    pub wall_interval: Option<u64>,

    /// Stop after N seconds (0 = run until Ctrl-C)
    #[arg(long, default_value = "5")]
    pub duration: u64,

    /// Busy-spinning demo threads to run under the profiler
    #[arg(long, default_value = "2", value_name = "N")]
    pub busy: usize,

    /// Sleeping demo threads to run under the profiler
    #[arg(long, default_value = "2", value_name = "N")]
    pub sleepy: usize,

    /// Export the sample timeline to a Chrome trace file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Print each sample as it is recorded
    #[arg(long)]
    pub live: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// CLI spelling of the sampling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    Wall,
    Cpu,
}

impl From<EventArg> for EventKind {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Wall => EventKind::Wall,
            EventArg::Cpu => EventKind::Cpu,
        }
    }
}
