//! Convenience re-exports for common use.

pub use crate::backend::{BackendRequest, MessageStream, ModelBackend, ToolDefinition};
pub use crate::compaction::CompactionConfig;
pub use crate::engine::{AgentEngine, EngineConfig};
pub use crate::error::{Result, TychoError};
pub use crate::hooks::{HookEvent, HookKind, HookRegistry};
pub use crate::mcp::{discover_tools, HttpTransport, McpClient, StdioTransport};
pub use crate::session::{CancelHandle, Session, SessionState};
pub use crate::subagents::{
    subagent_tool, SubAgentBatchResult, SubAgentCoordinator, SubAgentProgress, SubAgentResult,
    SubAgentTask, SubAgentTool,
};
pub use crate::tools::gate::{PermissionMode, ToolGate};
pub use crate::tools::{FnTool, PermissionSet, Tool, ToolSet};
pub use crate::types::{ContentBlock, Message, Role, ToolResult, ToolUse};
