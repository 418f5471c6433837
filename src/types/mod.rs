//! Core data types shared across the engine.

pub mod message;

pub use message::{ContentBlock, Message, Role, ToolResult, ToolUse};
