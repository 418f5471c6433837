//! Session state: conversation history, turn counter, cancellation.
//!
//! A `Session` is exclusively owned by one [`AgentEngine`](crate::engine::AgentEngine)
//! instance; nothing else mutates it. The cancellation state is monotonic:
//! `Idle -> Active -> Cancelled`, never backwards. A cancelled session is
//! terminal and must be discarded.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TychoError;
use crate::types::{Message, Role};

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Cancelled,
}

/// Cloneable handle for cancelling a session from outside the owning loop.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation. The loop stops at its next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Mutable conversation state owned by a single agent loop.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    messages: Vec<Message>,
    turns: usize,
    state: SessionState,
    cancel: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            turns: 0,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            self.state
        }
    }

    /// Handle for cancelling this session from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Begin a turn: increments the turn counter exactly once and returns
    /// the session's cancellation token for the loop to observe.
    ///
    /// Fails on a cancelled session; cancellation is terminal.
    pub(crate) fn begin_turn(&mut self) -> Result<CancellationToken, TychoError> {
        if self.state() == SessionState::Cancelled {
            return Err(TychoError::Cancelled);
        }
        self.turns += 1;
        self.state = SessionState::Active;
        Ok(self.cancel.clone())
    }

    /// Finish the active turn, settling into `Idle` or `Cancelled`.
    pub(crate) fn finish_turn(&mut self) {
        self.state = if self.cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Idle
        };
    }

    /// Append a message. History is append-only within a turn.
    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the whole history. Only the compactor may do this.
    pub(crate) fn rewrite(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Export the history as an ordered, serializable message array.
    pub fn export(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Export the history as JSON.
    pub fn export_json(&self) -> Result<String, TychoError> {
        Ok(serde_json::to_string(&self.messages)?)
    }

    /// Replace the history wholesale. The turn counter is re-derived as the
    /// number of user messages in the imported sequence.
    pub fn import(&mut self, messages: Vec<Message>) {
        self.turns = messages.iter().filter(|m| m.role == Role::User).count();
        self.messages = messages;
    }

    /// Import a history previously produced by [`export_json`](Self::export_json).
    pub fn import_json(&mut self, json: &str) -> Result<(), TychoError> {
        let messages: Vec<Message> = serde_json::from_str(json)?;
        self.import(messages);
        Ok(())
    }

    /// Clear history and turn counter. Cancellation state is untouched.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.turns = 0;
    }
}
