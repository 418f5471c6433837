//! Lifecycle hook dispatcher.
//!
//! Hooks observe the agent loop; they can never alter control flow. Firing
//! is a synchronous broadcast in registration order, and a handler that
//! panics is caught and logged without disturbing the remaining handlers
//! or the loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::backend::ToolDefinition;
use crate::types::{Message, ToolResult};

/// Hook event kinds, used as registration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeRequest,
    AfterResponse,
    OnError,
    BeforeToolExecution,
    AfterToolExecution,
    OnMessage,
}

/// Immutable context snapshot delivered to handlers.
#[derive(Debug, Clone)]
pub enum HookEvent {
    BeforeRequest {
        pending: Vec<Message>,
        model: String,
        tools: Vec<ToolDefinition>,
    },
    AfterResponse {
        success: bool,
    },
    OnError {
        error: String,
        phase: String,
    },
    BeforeToolExecution {
        name: String,
        id: String,
        input: serde_json::Value,
    },
    AfterToolExecution {
        name: String,
        id: String,
        result: ToolResult,
    },
    OnMessage {
        message: Message,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::BeforeRequest { .. } => HookKind::BeforeRequest,
            HookEvent::AfterResponse { .. } => HookKind::AfterResponse,
            HookEvent::OnError { .. } => HookKind::OnError,
            HookEvent::BeforeToolExecution { .. } => HookKind::BeforeToolExecution,
            HookEvent::AfterToolExecution { .. } => HookKind::AfterToolExecution,
            HookEvent::OnMessage { .. } => HookKind::OnMessage,
        }
    }
}

/// Observer callback fired at a lifecycle point.
pub type HookHandler = Arc<dyn Fn(&HookEvent) + Send + Sync>;

/// Ordered, per-event-kind registry of hook handlers.
///
/// Append-only via [`on`](Self::on); cleared via [`clear`](Self::clear) or
/// [`clear_all`](Self::clear_all).
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<HookKind, Vec<HookHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind. Handlers fire in registration order.
    pub fn on<F>(&mut self, kind: HookKind, handler: F)
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Remove all handlers for one event kind.
    pub fn clear(&mut self, kind: HookKind) {
        self.handlers.remove(&kind);
    }

    /// Remove every handler.
    pub fn clear_all(&mut self) {
        self.handlers.clear();
    }

    /// Broadcast an event to its registered handlers, in order. A panicking
    /// handler is isolated: later handlers still observe the event.
    pub fn fire(&self, event: &HookEvent) {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return;
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "hook handler panicked; continuing");
            }
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<(HookKind, usize)> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        counts.sort_by_key(|(kind, _)| format!("{kind:?}"));
        f.debug_map().entries(counts).finish()
    }
}
