pub mod dispatcher;
pub mod http;
pub mod registry;
pub mod stream;

use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// One message in a chat transcript.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Caller-facing completion request. `model` is `provider/model_name`;
/// the provider prefix selects the key pool.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Request a streaming response.
    pub stream: bool,
    /// Extra provider parameters merged into the request body verbatim.
    pub extra: Option<serde_json::Value>,
    /// Cooperative caller-side cancellation. Locks are still released and
    /// accounting still happens when this fires.
    pub cancellation: Option<CancellationToken>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: false,
            extra: None,
            cancellation: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Caller-facing embedding request.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
    pub extra: Option<serde_json::Value>,
    pub cancellation: Option<CancellationToken>,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: Vec<String>) -> Self {
        Self {
            model: model.into(),
            input,
            extra: None,
            cancellation: None,
        }
    }
}

/// What the client sees for one completion attempt: the bare model name
/// plus body parameters and the absolute deadline for the whole request.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub extra: Option<serde_json::Value>,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct EmbeddingParams {
    pub input: Vec<String>,
    pub extra: Option<serde_json::Value>,
    pub deadline: Instant,
}

/// Non-streaming completion result, with the provider's native payload
/// preserved in `raw`.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub raw: serde_json::Value,
}

/// Raw provider stream: arbitrary byte chunks, SSE-framed by the
/// completion stream wrapper.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// The cross-provider transport capability. Implementations own the HTTP
/// mechanics; raised errors are classified by the dispatcher to decide
/// retry vs rotate vs surface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &CompletionParams,
    ) -> Result<CompletionResponse, ProviderError>;

    async fn stream_complete(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &CompletionParams,
    ) -> Result<ByteStream, ProviderError>;

    async fn embed(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &EmbeddingParams,
    ) -> Result<EmbeddingResponse, ProviderError>;
}
