//! The agent execution loop.
//!
//! [`AgentEngine`] owns one [`Session`] and drives request/response/tool-use
//! cycles against an injected [`ModelBackend`]: enforce the turn limit,
//! compact history under token pressure, stream one exchange, route tool-use
//! blocks through the execution gate sequentially, and repeat until the
//! model stops requesting tools.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time;

use crate::backend::{BackendRequest, ModelBackend};
use crate::compaction::{self, CompactionConfig};
use crate::error::TychoError;
use crate::hooks::{HookEvent, HookRegistry};
use crate::session::{CancelHandle, Session};
use crate::tools::gate::{PermissionMode, ToolGate};
use crate::tools::ToolSet;
use crate::types::{Message, Role, ToolUse};

/// Engine configuration, injected at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Limit on external `query` calls for this session.
    pub max_turns: Option<usize>,
    /// Limit on backend round-trips within a single `query`.
    pub max_iterations: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub compaction: Option<CompactionConfig>,
    pub permission_mode: PermissionMode,
    /// Idle timeout between streamed messages, milliseconds. `None` disables.
    pub stream_idle_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: None,
            max_iterations: None,
            max_tokens: None,
            temperature: None,
            compaction: None,
            permission_mode: PermissionMode::AcceptAll,
            stream_idle_timeout_ms: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = Some(config);
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }
}

/// Stateful loop driving multi-turn, tool-augmented conversations.
pub struct AgentEngine {
    config: EngineConfig,
    backend: Arc<dyn ModelBackend>,
    gate: ToolGate,
    hooks: HookRegistry,
    session: Session,
}

impl AgentEngine {
    pub fn new(backend: Arc<dyn ModelBackend>, config: EngineConfig) -> Self {
        let gate = ToolGate::new(ToolSet::empty(), config.permission_mode.clone());
        Self {
            config,
            backend,
            gate,
            hooks: HookRegistry::new(),
            session: Session::new(),
        }
    }

    /// Replace the tool catalog.
    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.gate = ToolGate::new(tools, self.config.permission_mode.clone());
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tools(&self) -> &ToolSet {
        self.gate.tools()
    }

    /// Mutable access to the hook registry for registration and clearing.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Handle for cancelling the session from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }

    /// Replace the session history wholesale (explicit import).
    pub fn import_history(&mut self, messages: Vec<Message>) {
        self.session.import(messages);
    }

    /// Clear the session history and turn counter.
    pub fn reset(&mut self) {
        self.session.reset();
    }

    fn effective_system_prompt(&self) -> Option<String> {
        // Injected once per request assembly, only when the history does not
        // already carry a system message. Compaction summaries are system
        // messages too, but they carry no instructions and must not
        // suppress the configured prompt.
        let has_system = self
            .session
            .messages()
            .iter()
            .any(|m| m.role == Role::System && !compaction::is_summary_message(m));
        if has_system {
            None
        } else {
            self.config.system_prompt.clone()
        }
    }

    /// Run one query: a lazy, ordered stream of messages.
    ///
    /// The stream ends when the model stops requesting tools, stops silently
    /// on cancellation, or ends after a final `Err` item on turn-limit or
    /// backend failure. One active stream per session, enforced by the
    /// `&mut` borrow.
    pub fn query(
        &mut self,
        prompt: impl Into<String>,
    ) -> impl Stream<Item = Result<Message, TychoError>> + '_ {
        let prompt = prompt.into();
        async_stream::stream! {
            if let Some(limit) = self.config.max_turns {
                if self.session.turns() >= limit {
                    self.hooks.fire(&HookEvent::OnError {
                        error: format!("turn limit exceeded (max_turns={limit})"),
                        phase: "turn_limit".to_string(),
                    });
                    yield Err(TychoError::TurnLimitExceeded { limit });
                    return;
                }
            }

            let cancel = match self.session.begin_turn() {
                Ok(token) => token,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            tracing::debug!(session_id = %self.session.id(), turn = self.session.turns(), "query start");
            self.session.push(Message::user(prompt));

            let mut iteration = 0usize;
            'request: loop {
                iteration += 1;
                if let Some(limit) = self.config.max_iterations {
                    if iteration > limit {
                        self.hooks.fire(&HookEvent::OnError {
                            error: format!("tool loop exceeded max iterations (max_iterations={limit})"),
                            phase: "iteration_limit".to_string(),
                        });
                        self.hooks.fire(&HookEvent::AfterResponse { success: false });
                        yield Err(TychoError::IterationLimitExceeded { limit });
                        break 'request;
                    }
                }

                if let Some(compaction_config) = self.config.compaction.clone() {
                    let compacted = tokio::select! {
                        _ = cancel.cancelled() => break 'request,
                        result = compaction::compact(
                            self.backend.as_ref(),
                            &self.config.model,
                            self.session.messages(),
                            &compaction_config,
                        ) => result,
                    };
                    match compacted {
                        Ok(Some(rebuilt)) => self.session.rewrite(rebuilt),
                        Ok(None) => {}
                        Err(err) => {
                            let error = format!("compaction failed: {err}");
                            self.hooks.fire(&HookEvent::OnError {
                                error: error.clone(),
                                phase: "compaction".to_string(),
                            });
                            self.hooks.fire(&HookEvent::AfterResponse { success: false });
                            yield Err(TychoError::Backend(error));
                            break 'request;
                        }
                    }
                }

                let request = BackendRequest {
                    messages: self.session.messages().to_vec(),
                    model: self.config.model.clone(),
                    system_prompt: self.effective_system_prompt(),
                    max_tokens: self.config.max_tokens,
                    temperature: self.config.temperature,
                    tools: if self.gate.tools().is_empty() {
                        None
                    } else {
                        Some(self.gate.tools().definitions())
                    },
                };
                self.hooks.fire(&HookEvent::BeforeRequest {
                    pending: request.messages.clone(),
                    model: request.model.clone(),
                    tools: request.tools.clone().unwrap_or_default(),
                });

                let stream = tokio::select! {
                    _ = cancel.cancelled() => break 'request,
                    result = self.backend.stream_complete(&request) => result,
                };
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.hooks.fire(&HookEvent::OnError {
                            error: err.to_string(),
                            phase: "request".to_string(),
                        });
                        self.hooks.fire(&HookEvent::AfterResponse { success: false });
                        yield Err(err);
                        break 'request;
                    }
                };

                let idle_timeout = self
                    .config
                    .stream_idle_timeout_ms
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis);
                let mut tool_uses: Vec<ToolUse> = Vec::new();
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break 'request,
                        item = next_item(&mut stream, idle_timeout) => item,
                    };
                    match next {
                        None => break,
                        Some(Ok(message)) => {
                            self.session.push(message.clone());
                            self.hooks.fire(&HookEvent::OnMessage {
                                message: message.clone(),
                            });
                            tool_uses.extend(message.tool_uses().into_iter().cloned());
                            yield Ok(message);
                        }
                        Some(Err(err)) => {
                            self.hooks.fire(&HookEvent::OnError {
                                error: err.to_string(),
                                phase: "stream".to_string(),
                            });
                            self.hooks.fire(&HookEvent::AfterResponse { success: false });
                            yield Err(err);
                            break 'request;
                        }
                    }
                }

                if tool_uses.is_empty() {
                    self.hooks.fire(&HookEvent::AfterResponse { success: true });
                    break 'request;
                }

                // Sequential, in emission order: the result append order must
                // match the tool-use order exactly.
                for tool_use in &tool_uses {
                    if cancel.is_cancelled() {
                        break 'request;
                    }
                    let result = self.gate.execute(&self.hooks, tool_use).await;
                    let message = Message::tool_result(result);
                    self.session.push(message.clone());
                    yield Ok(message);
                }
            }

            self.session.finish_turn();
            tracing::debug!(
                session_id = %self.session.id(),
                state = ?self.session.state(),
                messages = self.session.messages().len(),
                "query end"
            );
        }
    }
}

/// Await the next streamed message, applying the optional idle timeout.
/// A timeout surfaces as a stream error so the caller handles it like any
/// other backend communication failure.
async fn next_item(
    stream: &mut crate::backend::MessageStream,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message, TychoError>> {
    match idle_timeout {
        None => stream.next().await,
        Some(duration) => match time::timeout(duration, stream.next()).await {
            Ok(item) => item,
            Err(_) => Some(Err(TychoError::Timeout(duration.as_millis() as u64))),
        },
    }
}
