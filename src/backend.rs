//! Model backend collaborator trait.
//!
//! The engine never speaks HTTP itself; it drives an injected
//! [`ModelBackend`] that turns a request into an ordered, finite stream of
//! messages. One `stream_complete` call per loop iteration; `complete` is
//! the non-streaming variant used by the history compactor.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TychoError;
use crate::types::Message;

/// Tool definition sent to the backend alongside the request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A request to the model backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Ordered, finite, non-restartable message stream from the backend.
pub type MessageStream = BoxStream<'static, Result<Message, TychoError>>;

/// Core trait implemented by all model backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Stream one exchange: terminates normally or with an error.
    async fn stream_complete(&self, request: &BackendRequest) -> Result<MessageStream, TychoError>;

    /// Single-shot completion (used for history summarization).
    async fn complete(&self, request: &BackendRequest) -> Result<Message, TychoError>;
}
