//! Tool execution gate: permission evaluation + delegated execution.
//!
//! The gate never returns an error outward. Missing tools, permission
//! denials, and provider failures are all converted into in-band error
//! [`ToolResult`]s so the conversation continues and the model can react.

use std::sync::Arc;

use crate::hooks::{HookEvent, HookRegistry};
use crate::tools::{PermissionSet, ToolSet};
use crate::types::{ToolResult, ToolUse};

/// Active permission mode gating tool execution.
#[derive(Clone)]
pub enum PermissionMode {
    /// Deny every tool.
    Manual,
    /// Allow only tools whose categories are a subset of `{read}`.
    AcceptReadOnly,
    /// Allow only tools whose categories are a subset of `{read, write}`.
    AcceptEdits,
    /// Allow every tool.
    AcceptAll,
    /// Custom predicate over the tool's category set.
    Custom(Arc<dyn Fn(PermissionSet) -> bool + Send + Sync>),
}

impl PermissionMode {
    pub fn allows(&self, permissions: PermissionSet) -> bool {
        match self {
            PermissionMode::Manual => false,
            PermissionMode::AcceptReadOnly => permissions.is_subset_of(PermissionSet::READ),
            PermissionMode::AcceptEdits => {
                permissions.is_subset_of(PermissionSet::READ | PermissionSet::WRITE)
            }
            PermissionMode::AcceptAll => true,
            PermissionMode::Custom(predicate) => predicate(permissions),
        }
    }
}

impl std::fmt::Debug for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PermissionMode::Manual => "Manual",
            PermissionMode::AcceptReadOnly => "AcceptReadOnly",
            PermissionMode::AcceptEdits => "AcceptEdits",
            PermissionMode::AcceptAll => "AcceptAll",
            PermissionMode::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Permission evaluation and delegation for one tool catalog.
#[derive(Debug, Clone)]
pub struct ToolGate {
    tools: ToolSet,
    mode: PermissionMode,
}

impl ToolGate {
    pub fn new(tools: ToolSet, mode: PermissionMode) -> Self {
        Self { tools, mode }
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn mode(&self) -> &PermissionMode {
        &self.mode
    }

    /// Execute one tool-use block. Fires `before/after_tool_execution`
    /// hooks around dispatch regardless of outcome.
    pub async fn execute(&self, hooks: &HookRegistry, tool_use: &ToolUse) -> ToolResult {
        hooks.fire(&HookEvent::BeforeToolExecution {
            name: tool_use.name.clone(),
            id: tool_use.id.clone(),
            input: tool_use.input.clone(),
        });

        let result = self.dispatch(tool_use).await;
        if result.is_error {
            tracing::debug!(tool = %tool_use.name, id = %tool_use.id, error = %result.content, "tool execution failed");
        }

        hooks.fire(&HookEvent::AfterToolExecution {
            name: tool_use.name.clone(),
            id: tool_use.id.clone(),
            result: result.clone(),
        });
        result
    }

    async fn dispatch(&self, tool_use: &ToolUse) -> ToolResult {
        let Some(tool) = self.tools.get(&tool_use.name) else {
            return ToolResult::error(
                &tool_use.id,
                format!("tool '{}' not found", tool_use.name),
            );
        };

        if !self.mode.allows(tool.permissions()) {
            return ToolResult::error(
                &tool_use.id,
                format!("permission denied for tool '{}'", tool_use.name),
            );
        }

        match tool.execute(tool_use.input.clone()).await {
            Ok(value) => {
                let content = match &value {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                ToolResult::ok(&tool_use.id, content).with_structured(value)
            }
            Err(err) => ToolResult::error(&tool_use.id, err.to_string()),
        }
    }
}
