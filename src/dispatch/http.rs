use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::{
    ByteStream, CompletionParams, CompletionResponse, EmbeddingParams, EmbeddingResponse,
    LlmClient,
};
use crate::error::ProviderError;

/// Cap on accumulated response bodies, streaming or not.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// How much of a provider error body survives into the error message.
const ERROR_EXCERPT_BYTES: usize = 2048;

/// Ceiling on time spent draining an error body.
const ERROR_BODY_WINDOW: Duration = Duration::from_secs(5);

/// Maximum time to wait for response headers after sending the request,
/// before the request deadline clamps it further.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAI-compatible chat/embeddings endpoints per provider. The engine is
/// format-agnostic behind [`LlmClient`]; this default implementation
/// covers the compatible providers.
fn default_base_urls() -> HashMap<String, String> {
    [
        ("openai", "https://api.openai.com/v1"),
        ("openrouter", "https://openrouter.ai/api/v1"),
        ("xai", "https://api.x.ai/v1"),
        ("deepseek", "https://api.deepseek.com"),
        ("mistral", "https://api.mistral.ai/v1"),
        ("together", "https://api.together.xyz/v1"),
        ("gemini", "https://generativelanguage.googleapis.com/v1beta/openai"),
    ]
    .into_iter()
    .map(|(provider, url)| (provider.to_string(), url.to_string()))
    .collect()
}

/// Default transport: one shared reqwest client, sized so the connection
/// pool never becomes the concurrency bottleneck.
pub struct HttpClient {
    client: Client,
    base_urls: HashMap<String, String>,
}

/// SSE streaming chunk from an OpenAI-compatible chat completions API.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    /// Some providers stream reasoning separately alongside content.
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct EmbeddingPayload {
    data: Vec<EmbeddingRow>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_urls: default_base_urls(),
        }
    }

    /// Point a provider at a different base URL (proxies, self-hosted
    /// compatible endpoints, tests).
    pub fn with_base_url(mut self, provider: &str, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(provider.to_string(), base_url.into());
        self
    }

    fn base_url(&self, provider: &str) -> Result<&str, ProviderError> {
        self.base_urls
            .get(provider)
            .map(String::as_str)
            .ok_or_else(|| ProviderError::Other(format!("no endpoint known for provider {provider}")))
    }

    /// Remaining budget, refusing to start work with under 100ms left.
    fn remaining(deadline: Instant) -> Result<Duration, ProviderError> {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(ProviderError::Timeout(0))
    }

    /// Collect at most `cap` bytes of a non-SSE body for the error
    /// message, discarding the rest. A transport error mid-body just ends
    /// the excerpt; whatever arrived is still worth classifying.
    async fn read_body_excerpt(response: &mut reqwest::Response, cap: usize) -> (Bytes, bool) {
        let mut excerpt = BytesMut::with_capacity(cap.min(1024));
        while let Ok(Some(mut chunk)) = response.chunk().await {
            let room = cap - excerpt.len();
            if chunk.len() > room {
                excerpt.extend_from_slice(&chunk.split_to(room));
                return (excerpt.freeze(), true);
            }
            excerpt.extend_from_slice(&chunk);
        }
        (excerpt.freeze(), false)
    }

    /// POST a JSON body and normalize non-success statuses into
    /// `ProviderError::Http` with a capped, truncated body excerpt.
    async fn post_json(
        &self,
        url: &str,
        key: &str,
        body: &serde_json::Value,
        deadline: Instant,
    ) -> Result<reqwest::Response, ProviderError> {
        let started = Instant::now();
        let remaining = Self::remaining(deadline)?;

        // Scoped timeout around send() covers the gap between connection
        // and first response header; connect_timeout handles TCP/TLS.
        let headers_timeout = remaining.min(HEADERS_TIMEOUT);
        let send_future = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
            .json(body)
            .send();

        let mut response = tokio::time::timeout(headers_timeout, send_future)
            .await
            .map_err(|_| ProviderError::Timeout(started.elapsed().as_millis() as u64))?
            .map_err(ProviderError::from)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Error responses are not SSE. Keep only a short excerpt for the
        // message, and give up quickly if the upstream withholds the body.
        let window = deadline
            .saturating_duration_since(Instant::now())
            .min(ERROR_BODY_WINDOW);
        let (excerpt, clipped) = tokio::time::timeout(
            window,
            Self::read_body_excerpt(&mut response, ERROR_EXCERPT_BYTES),
        )
        .await
        .unwrap_or_default();

        let mut message = String::from_utf8_lossy(&excerpt).into_owned();
        if clipped {
            message.push_str(" [truncated]");
        }

        Err(ProviderError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn completion_body(model: &str, params: &CompletionParams, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": params.messages,
            "stream": stream,
        });
        if stream {
            // Ask compatible providers to attach usage to the final chunk.
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        if let Some(temp) = params.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        merge_extra(&mut body, params.extra.as_ref());
        body
    }
}

/// Merge caller-supplied provider parameters into the request body.
/// Top-level keys override the generated ones.
fn merge_extra(body: &mut serde_json::Value, extra: Option<&serde_json::Value>) {
    let (Some(serde_json::Value::Object(extra)), Some(target)) = (extra, body.as_object_mut())
    else {
        return;
    };
    for (k, v) in extra {
        target.insert(k.clone(), v.clone());
    }
}

#[async_trait]
impl LlmClient for HttpClient {
    /// Non-streaming completion. The request still streams on the wire
    /// (accumulating SSE deltas avoids a separate idle-timeout story for
    /// long generations), but callers get one assembled response.
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &CompletionParams,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url(provider)?);
        let body = Self::completion_body(model, params, true);
        let response = self.post_json(&url, key, &body, params.deadline).await?;

        let mut stream = response.bytes_stream().eventsource();
        let mut accumulated = String::new();
        let mut usage: Option<UsagePayload> = None;

        let remaining = params
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let generation_deadline = tokio::time::Instant::now() + remaining;

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = tokio::time::sleep_until(generation_deadline) => {
                    if accumulated.is_empty() {
                        return Err(ProviderError::Timeout(remaining.as_millis() as u64));
                    }
                    // Partial output beats nothing at the deadline.
                    tracing::warn!(provider, model, bytes = accumulated.len(),
                        "deadline mid-stream — returning partial completion");
                    break;
                }
            };

            match event {
                Some(Ok(ev)) => {
                    if ev.data.trim() == "[DONE]" {
                        break;
                    }
                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(&ev.data) else {
                        continue;
                    };
                    if let Some(u) = chunk.usage {
                        usage = Some(u);
                    }
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    for piece in [&choice.delta.reasoning_content, &choice.delta.content] {
                        if let Some(text) = piece {
                            if accumulated.len() + text.len() > MAX_RESPONSE_BYTES {
                                return Err(ProviderError::Stream(format!(
                                    "streaming response too large: >{MAX_RESPONSE_BYTES}B"
                                )));
                            }
                            accumulated.push_str(text);
                        }
                    }
                }
                Some(Err(e)) => {
                    if accumulated.is_empty() {
                        return Err(ProviderError::Stream(e.to_string()));
                    }
                    tracing::warn!(provider, model, "SSE error after partial data: {e}");
                    break;
                }
                None => {
                    if accumulated.is_empty() {
                        return Err(ProviderError::Stream(
                            "stream ended without content".to_string(),
                        ));
                    }
                    break;
                }
            }
        }

        if accumulated.is_empty() {
            return Err(ProviderError::Stream("empty streaming response".to_string()));
        }

        let usage = usage.unwrap_or(UsagePayload {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        Ok(CompletionResponse {
            raw: serde_json::json!({
                "model": model,
                "choices": [{"message": {"role": "assistant", "content": accumulated.as_str()}}],
                "usage": {
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                },
            }),
            content: accumulated,
            model: model.to_string(),
            provider: provider.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    /// Streaming completion: hand back the raw byte stream; framing and
    /// accounting belong to the stream wrapper.
    async fn stream_complete(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &CompletionParams,
    ) -> Result<ByteStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url(provider)?);
        let body = Self::completion_body(model, params, true);
        let response = self.post_json(&url, key, &body, params.deadline).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProviderError::from));
        Ok(Box::pin(stream))
    }

    async fn embed(
        &self,
        provider: &str,
        model: &str,
        key: &str,
        params: &EmbeddingParams,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let url = format!("{}/embeddings", self.base_url(provider)?);
        let mut body = serde_json::json!({
            "model": model,
            "input": params.input,
        });
        merge_extra(&mut body, params.extra.as_ref());

        let response = self.post_json(&url, key, &body, params.deadline).await?;

        let remaining = params
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let raw: serde_json::Value = tokio::time::timeout(remaining, response.json())
            .await
            .map_err(|_| ProviderError::Timeout(remaining.as_millis() as u64))?
            .map_err(ProviderError::from)?;

        let payload: EmbeddingPayload = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Other(format!("malformed embedding response: {e}")))?;

        Ok(EmbeddingResponse {
            embeddings: payload.data.into_iter().map(|row| row.embedding).collect(),
            model: model.to_string(),
            provider: provider.to_string(),
            prompt_tokens: payload.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            raw,
        })
    }
}
