//! Structured error types for wallscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("a wall-clock sampler is already running in this process")]
    AlreadyRunning,

    #[error("failed to install the sample signal handler: {0}")]
    HandlerInstall(std::io::Error),

    #[error("failed to enumerate process threads: {0}")]
    ThreadList(std::io::Error),

    #[error("failed to spawn the sampling cycle thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
