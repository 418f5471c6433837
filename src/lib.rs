//! Tycho -- client-side agent orchestration engine
//!
//! Tycho drives tool-augmented conversations against a pluggable model
//! backend: a streaming agent loop with turn accounting and cancellation,
//! an observation-only hook system, permission-gated tool execution,
//! token-pressure history compaction, parallel sub-agent batches, and a
//! JSON-RPC client for external tool servers.
//!
//! The backend itself is injected behind [`backend::ModelBackend`]; Tycho
//! contains no provider bindings.

pub mod backend;
pub mod compaction;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod mcp;
pub mod prelude;
pub mod session;
pub mod subagents;
pub mod tools;
pub mod types;
