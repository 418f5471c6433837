//! Error types for Tycho.
//!
//! Tool-related failures (missing tool, permission denial, provider errors)
//! are deliberately absent from this taxonomy at the loop boundary: the
//! execution gate converts them into in-band error `ToolResult`s so the
//! model can observe and react to them.

use thiserror::Error;

/// Primary error type for all Tycho operations.
#[derive(Error, Debug)]
pub enum TychoError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("turn limit exceeded (max_turns={limit})")]
    TurnLimitExceeded { limit: usize },

    #[error("iteration limit exceeded (max_iterations={limit})")]
    IterationLimitExceeded { limit: usize },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool execution error in '{tool_name}': {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Yielded only when work is started on an already-cancelled session.
    /// Cancellation of in-flight work ends the stream silently instead.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, TychoError>;
