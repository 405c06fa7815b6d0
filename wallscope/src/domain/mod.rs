//! Domain model for wallscope
//!
//! Core domain types and errors:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Duration, Pid, SampleKind, Tid, Timestamp};

pub use errors::{ExportError, SamplerError};
