//! Trace export functionality
//!
//! Exports recorded samples to Chrome Trace Event Format for visualization
//! in `chrome://tracing` or [Perfetto](https://ui.perfetto.dev). Each wall
//! sample becomes a thread-scoped instant event, so the timeline shows
//! exactly when each thread was caught and in what state.

use std::collections::HashMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::ExportError;
use crate::os;
use crate::recording::SampleEvent;
use crate::symbolization::Symbolizer;

/// Chrome Trace Event format
/// Spec: <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview>
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChromeTraceEvent {
    /// Event name (usually function name)
    name: String,
    /// Category for filtering/coloring
    cat: String,
    /// Phase: "i" = instant, "M" = metadata
    ph: String,
    /// Timestamp in microseconds
    ts: f64,
    /// Process ID
    pid: u32,
    /// Thread ID
    tid: u32,
    /// Instant event scope: "t" pins the event to its thread track
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    /// Optional arguments (metadata)
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

/// Chrome trace exporter for the sample timeline.
///
/// Feed it [`SampleEvent`]s, then [`export`](Self::export) the collected
/// trace to any writer. Without a symbolizer, event names fall back to the
/// raw program counter.
pub struct ChromeTraceExporter {
    /// Collected trace events
    events: Vec<ChromeTraceEvent>,
    /// Resolves sampled program counters to function names
    symbolizer: Option<Symbolizer>,
    /// Last-seen label per thread, for name metadata events
    thread_labels: HashMap<u32, String>,
    /// Start timestamp for relative timing (in nanoseconds)
    start_timestamp_ns: Option<u64>,
    pid: u32,
}

impl ChromeTraceExporter {
    #[must_use]
    pub fn new(symbolizer: Option<Symbolizer>) -> Self {
        #[allow(clippy::cast_sign_loss)] // pids are positive
        let pid = os::process_id().0 as u32;
        Self {
            events: Vec::new(),
            symbolizer,
            thread_labels: HashMap::new(),
            start_timestamp_ns: None,
            pid,
        }
    }

    /// Add one recorded sample to the trace.
    pub fn add_sample(&mut self, event: &SampleEvent) {
        // Initialize start timestamp on first event
        let start_ts = *self.start_timestamp_ns.get_or_insert(event.timestamp.0);

        // Convert timestamp from nanoseconds to microseconds (relative to start)
        #[allow(clippy::cast_precision_loss)] // microsecond display precision
        let ts_us = (event.timestamp.0.saturating_sub(start_ts)) as f64 / 1000.0;

        let name = match &self.symbolizer {
            Some(symbolizer) => symbolizer.resolve_runtime(event.pc).function,
            None => format!("0x{:x}", event.pc),
        };

        let mut args = HashMap::new();
        args.insert("state".to_string(), serde_json::json!(event.state.to_string()));
        args.insert("pc".to_string(), serde_json::json!(format!("0x{:x}", event.pc)));
        if let Some(task_id) = event.task_id {
            args.insert("task_id".to_string(), serde_json::json!(task_id));
        }

        #[allow(clippy::cast_sign_loss)] // tids are positive
        let tid = event.tid.0 as u32;
        if let Some(label) = &event.label {
            self.thread_labels.insert(tid, label.clone());
        }

        self.events.push(ChromeTraceEvent {
            name,
            cat: event.state.to_string(),
            ph: "i".to_string(), // Instant
            ts: ts_us,
            pid: self.pid,
            tid,
            s: Some("t".to_string()), // thread scope
            args: Some(args),
        });
    }

    /// Add a batch of recorded samples.
    pub fn add_samples<'a>(&mut self, events: impl IntoIterator<Item = &'a SampleEvent>) {
        for event in events {
            self.add_sample(event);
        }
    }

    /// Export the trace to any writer (file, stdout, buffer, etc.)
    ///
    /// # Errors
    /// Fails when the trace cannot be serialized or written.
    pub fn export<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        // Add metadata events for thread names
        let mut all_events = self.events.clone();

        for (&tid, label) in &self.thread_labels {
            let mut args = HashMap::new();
            args.insert("name".to_string(), serde_json::json!(label));

            all_events.push(ChromeTraceEvent {
                name: "thread_name".to_string(),
                cat: String::new(),
                ph: "M".to_string(), // Metadata
                ts: 0.0,
                pid: self.pid,
                tid,
                s: None,
                args: Some(args),
            });
        }

        let trace =
            ChromeTrace { trace_events: all_events, display_time_unit: "ms".to_string() };

        serde_json::to_writer_pretty(writer, &trace)?;
        Ok(())
    }

    /// Get the number of events collected
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}
