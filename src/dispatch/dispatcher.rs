use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock, until_local_midnight};
use crate::config::{Config, Settings};
use crate::dispatch::http::HttpClient;
use crate::dispatch::registry::{ProviderRegistry, StaticCatalog};
use crate::dispatch::stream::{CompletionStream, SseDecoder, content_delta};
use crate::dispatch::{
    ByteStream, CompletionParams, CompletionRequest, CompletionResponse, EmbeddingParams,
    EmbeddingRequest, EmbeddingResponse, LlmClient,
};
use crate::error::{ErrorKind, KeywheelError, classify, classify_event};
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::usage::store::{JsonFileStore, PersistentStore};
use crate::usage::{Lease, NoKey, UsageManager};

/// Successful completion: a whole response, or a live stream of events.
/// The stream is boxed: it carries the lease and decoder state and would
/// otherwise dwarf the non-streaming variant.
pub enum CompletionReply {
    Full(CompletionResponse),
    Stream(Box<CompletionStream>),
}

impl std::fmt::Debug for CompletionReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionReply::Full(r) => f.debug_tuple("Full").field(r).finish(),
            CompletionReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// What to do after a failed attempt on the current key.
enum FailureAction {
    /// Back off, then retry the same key.
    RetryAfter(Duration),
    /// Give the key up for this request; maybe charge it a cooldown first.
    Rotate(Option<ErrorKind>),
    /// Not recoverable by retry or rotation; the caller must see it.
    Fatal(KeywheelError),
}

/// Why a bounded operation stopped before producing a result.
enum Interrupt {
    Deadline,
    Cancelled,
}

/// Outcome of reading a provider stream up to its first content event.
enum Probe {
    /// Content arrived; hand the stream to the consumer.
    Content,
    /// The stream failed before any content was delivered.
    Failed(ErrorKind, String),
    Interrupted(Interrupt),
}

/// The request engine: accepts `provider/model` completion and embedding
/// requests, selects an eligible key, dispatches through the injected
/// [`LlmClient`], and rotates keys on credential failures, all inside one
/// end-to-end deadline per request.
pub struct Dispatcher {
    usage: Arc<UsageManager>,
    client: Arc<dyn LlmClient>,
    counter: Arc<dyn TokenCounter>,
    clock: Arc<dyn Clock>,
    registry: Arc<dyn ProviderRegistry>,
    store: Arc<dyn PersistentStore>,
    settings: Settings,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Construction-time wiring. Every capability has a production default;
/// tests swap in mocks through the setters.
pub struct DispatcherBuilder {
    config: Config,
    client: Option<Arc<dyn LlmClient>>,
    clock: Option<Arc<dyn Clock>>,
    counter: Option<Arc<dyn TokenCounter>>,
    registry: Option<Arc<dyn ProviderRegistry>>,
    store: Option<Arc<dyn PersistentStore>>,
}

impl DispatcherBuilder {
    pub fn client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Dispatcher {
        let settings = self.config.settings.clone();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client = self.client.unwrap_or_else(|| Arc::new(HttpClient::new()));
        let counter = self
            .counter
            .unwrap_or_else(|| Arc::new(HeuristicTokenCounter));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticCatalog::new()));
        let store: Arc<dyn PersistentStore> = self
            .store
            .unwrap_or_else(|| Arc::new(JsonFileStore::new(settings.usage_path.clone())));

        let usage = Arc::new(UsageManager::new(
            &self.config.pools,
            settings.clone(),
            Arc::clone(&clock),
        ));

        match store.load().await {
            Ok(Some(snapshot)) => usage.restore(&snapshot),
            Ok(None) => {}
            Err(e) => tracing::warn!("usage snapshot load failed: {e}"),
        }

        let dispatcher = Dispatcher {
            usage,
            client,
            counter,
            clock,
            registry,
            store,
            settings,
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        dispatcher.spawn_background_tasks();
        dispatcher
    }
}

impl Dispatcher {
    pub fn builder(config: Config) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            client: None,
            clock: None,
            counter: None,
            registry: None,
            store: None,
        }
    }

    /// Production wiring: HTTP client, system clock, JSON snapshot store.
    pub async fn new(config: Config) -> Self {
        Self::builder(config).build().await
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");

        // Snapshot writer: single writer, debounced. Every dirty mark within
        // the coalescing window folds into one save.
        let usage = Arc::clone(&self.usage);
        let store = Arc::clone(&self.store);
        let token = self.shutdown.clone();
        let debounce = self.settings.persist_debounce;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = usage.dirty_wait() => {
                        tokio::select! {
                            _ = tokio::time::sleep(debounce) => {}
                            // Shutdown during the debounce window: the close
                            // path does its own final flush.
                            _ = token.cancelled() => break,
                        }
                        if let Err(e) = store.save(&usage.snapshot()).await {
                            tracing::warn!("usage snapshot save failed: {e}");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        }));

        // Midnight ticker: the reactive check in select_key covers active
        // traffic; this covers idle processes.
        let usage = Arc::clone(&self.usage);
        let clock = Arc::clone(&self.clock);
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let wait = until_local_midnight(clock.local_now()) + Duration::from_secs(1);
                tokio::select! {
                    _ = clock.sleep_until(clock.now() + wait) => usage.daily_reset_if_needed(),
                    _ = token.cancelled() => break,
                }
            }
        }));
    }

    /// Flush the usage snapshot and stop background tasks. Idempotent;
    /// requests issued after this return [`KeywheelError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.store.save(&self.usage.snapshot()).await {
            tracing::warn!("final usage snapshot save failed: {e}");
        }
    }

    /// Shared key-lifecycle state, for observability and tests.
    pub fn usage(&self) -> &UsageManager {
        &self.usage
    }

    /// Every model the wired registry reports across configured providers.
    pub async fn available_models(&self) -> Vec<String> {
        let mut out = Vec::new();
        for provider in self.usage.providers() {
            let Some(key) = self.usage.any_key(provider) else {
                continue;
            };
            match self.registry.get_models(provider, &key).await {
                Ok(models) => out.extend(models),
                Err(e) => tracing::warn!(provider, "model discovery failed: {e}"),
            }
        }
        out.sort();
        out
    }

    /// Dispatch a completion. `Ok(None)` means the deadline or the key pool
    /// was exhausted by transient/credential causes; those are never
    /// surfaced as errors.
    pub async fn acompletion(
        &self,
        request: CompletionRequest,
    ) -> Result<Option<CompletionReply>, KeywheelError> {
        self.ensure_open()?;
        let (provider, model) = split_model(&request.model)?;
        if !self.usage.has_provider(provider) {
            return Err(KeywheelError::UnknownProvider(provider.to_string()));
        }

        let deadline = self.clock.now() + self.settings.global_timeout;
        let params = CompletionParams {
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            extra: request.extra,
            deadline,
        };
        let cancel = request.cancellation;

        if request.stream {
            self.dispatch_stream(provider, model, &params, cancel.as_ref())
                .await
                .map(|opt| opt.map(|stream| CompletionReply::Stream(Box::new(stream))))
        } else {
            self.dispatch_complete(provider, model, &params, cancel.as_ref())
                .await
                .map(|opt| opt.map(CompletionReply::Full))
        }
    }

    /// Dispatch an embedding request. Same rotation semantics as
    /// completions, no streaming variant.
    pub async fn aembedding(
        &self,
        request: EmbeddingRequest,
    ) -> Result<Option<EmbeddingResponse>, KeywheelError> {
        self.ensure_open()?;
        let (provider, model) = split_model(&request.model)?;
        if !self.usage.has_provider(provider) {
            return Err(KeywheelError::UnknownProvider(provider.to_string()));
        }

        let deadline = self.clock.now() + self.settings.global_timeout;
        let params = EmbeddingParams {
            input: request.input,
            extra: request.extra,
            deadline,
        };
        let cancellation = request.cancellation;
        let cancel = cancellation.as_ref();

        let mut tried: HashSet<String> = HashSet::new();
        loop {
            let mut lease = match self.next_key(provider, model, deadline, &tried).await {
                Some(lease) => lease,
                None => return Ok(None),
            };
            tried.insert(lease.fingerprint().to_string());

            let mut attempt = 0u32;
            loop {
                let call = self
                    .client
                    .embed(provider, model, lease.secret(), &params);
                // Bind before matching so the attempt future (borrowing the
                // lease) is dropped before the arms touch the lease again.
                let outcome = self.bounded(call, deadline, cancel).await;
                match outcome {
                    Err(interrupt) => {
                        self.log_interrupt(&interrupt, provider, model);
                        lease.release();
                        return Ok(None);
                    }
                    Ok(Ok(response)) => {
                        self.usage.record_success(
                            lease.fingerprint(),
                            model,
                            response.prompt_tokens,
                            0,
                        );
                        lease.release();
                        return Ok(Some(response));
                    }
                    Ok(Err(e)) => {
                        let kind = classify(&e);
                        match self.failure_action(kind, &e.to_string(), attempt, deadline) {
                            FailureAction::RetryAfter(wait) => {
                                if self.backoff(wait, deadline, cancel).await.is_err() {
                                    lease.release();
                                    return Ok(None);
                                }
                                attempt += 1;
                            }
                            FailureAction::Rotate(record) => {
                                if let Some(kind) = record {
                                    self.usage.record_failure(lease.fingerprint(), model, kind);
                                }
                                lease.release();
                                break;
                            }
                            FailureAction::Fatal(err) => {
                                lease.release();
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_complete(
        &self,
        provider: &str,
        model: &str,
        params: &CompletionParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<CompletionResponse>, KeywheelError> {
        let deadline = params.deadline;
        let mut tried: HashSet<String> = HashSet::new();

        loop {
            let mut lease = match self.next_key(provider, model, deadline, &tried).await {
                Some(lease) => lease,
                None => return Ok(None),
            };
            tried.insert(lease.fingerprint().to_string());

            let mut attempt = 0u32;
            loop {
                let call = self
                    .client
                    .complete(provider, model, lease.secret(), params);
                let outcome = self.bounded(call, deadline, cancel).await;
                match outcome {
                    Err(interrupt) => {
                        self.log_interrupt(&interrupt, provider, model);
                        lease.release();
                        return Ok(None);
                    }
                    Ok(Ok(response)) => {
                        self.usage.record_success(
                            lease.fingerprint(),
                            model,
                            response.prompt_tokens,
                            response.completion_tokens,
                        );
                        lease.release();
                        return Ok(Some(response));
                    }
                    Ok(Err(e)) => {
                        let kind = classify(&e);
                        tracing::debug!(
                            provider,
                            model,
                            kind = kind.as_str(),
                            attempt,
                            "attempt failed: {e}"
                        );
                        match self.failure_action(kind, &e.to_string(), attempt, deadline) {
                            FailureAction::RetryAfter(wait) => {
                                if self.backoff(wait, deadline, cancel).await.is_err() {
                                    lease.release();
                                    return Ok(None);
                                }
                                attempt += 1;
                            }
                            FailureAction::Rotate(record) => {
                                if let Some(kind) = record {
                                    self.usage.record_failure(lease.fingerprint(), model, kind);
                                }
                                lease.release();
                                break;
                            }
                            FailureAction::Fatal(err) => {
                                lease.release();
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Streaming dispatch. The stream is probed up to its first content
    /// event while the dispatcher still owns it: credential failures seen
    /// before any content rotate to a fresh key inside the same deadline
    /// and the consumer never learns they happened.
    async fn dispatch_stream(
        &self,
        provider: &str,
        model: &str,
        params: &CompletionParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<CompletionStream>, KeywheelError> {
        let deadline = params.deadline;
        let mut tried: HashSet<String> = HashSet::new();

        loop {
            let mut lease = match self.next_key(provider, model, deadline, &tried).await {
                Some(lease) => lease,
                None => return Ok(None),
            };
            tried.insert(lease.fingerprint().to_string());

            let mut attempt = 0u32;
            loop {
                let call = self
                    .client
                    .stream_complete(provider, model, lease.secret(), params);
                let outcome = self.bounded(call, deadline, cancel).await;
                let upstream = match outcome {
                    Err(interrupt) => {
                        self.log_interrupt(&interrupt, provider, model);
                        lease.release();
                        return Ok(None);
                    }
                    Ok(Ok(upstream)) => upstream,
                    Ok(Err(e)) => {
                        let kind = classify(&e);
                        match self.failure_action(kind, &e.to_string(), attempt, deadline) {
                            FailureAction::RetryAfter(wait) => {
                                if self.backoff(wait, deadline, cancel).await.is_err() {
                                    lease.release();
                                    return Ok(None);
                                }
                                attempt += 1;
                                continue;
                            }
                            FailureAction::Rotate(record) => {
                                if let Some(kind) = record {
                                    self.usage.record_failure(lease.fingerprint(), model, kind);
                                }
                                lease.release();
                                break;
                            }
                            FailureAction::Fatal(err) => {
                                lease.release();
                                return Err(err);
                            }
                        }
                    }
                };

                let mut decoder = SseDecoder::new(self.settings.max_event_bytes);
                let mut buffered: VecDeque<Value> = VecDeque::new();
                let mut upstream = upstream;

                let probe = self
                    .probe_stream(&mut upstream, &mut decoder, &mut buffered, deadline, cancel)
                    .await;
                match probe {
                    Probe::Content => {
                        let prompt_estimate =
                            u64::from(self.counter.count_messages(model, &params.messages));
                        let stream = CompletionStream::new(
                            upstream,
                            decoder,
                            buffered,
                            lease,
                            Arc::clone(&self.usage),
                            Arc::clone(&self.counter),
                            model,
                            prompt_estimate,
                        );
                        return Ok(Some(stream));
                    }
                    Probe::Interrupted(interrupt) => {
                        self.log_interrupt(&interrupt, provider, model);
                        lease.release();
                        return Ok(None);
                    }
                    Probe::Failed(kind, message) => {
                        tracing::debug!(
                            provider,
                            model,
                            kind = kind.as_str(),
                            "stream failed before content: {message}"
                        );
                        match self.failure_action(kind, &message, attempt, deadline) {
                            FailureAction::RetryAfter(wait) => {
                                if self.backoff(wait, deadline, cancel).await.is_err() {
                                    lease.release();
                                    return Ok(None);
                                }
                                attempt += 1;
                            }
                            FailureAction::Rotate(record) => {
                                if let Some(kind) = record {
                                    self.usage.record_failure(lease.fingerprint(), model, kind);
                                }
                                lease.release();
                                break;
                            }
                            FailureAction::Fatal(err) => {
                                lease.release();
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read frames until the first content-bearing event. Buffered
    /// non-content events (role announcements and the like) ride along to
    /// the consumer on success.
    async fn probe_stream(
        &self,
        upstream: &mut ByteStream,
        decoder: &mut SseDecoder,
        buffered: &mut VecDeque<Value>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Probe {
        loop {
            while let Some(frame) = decoder.next_frame() {
                if frame.trim() == "[DONE]" {
                    return Probe::Failed(
                        ErrorKind::TransientServer,
                        "stream ended before any content".to_string(),
                    );
                }
                let Ok(event) = serde_json::from_str::<Value>(&frame) else {
                    continue;
                };
                if let Some(kind) = classify_event(&event) {
                    let message = event
                        .get("error")
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    return Probe::Failed(kind, message);
                }
                let has_content = content_delta(&event).is_some_and(|s| !s.is_empty());
                buffered.push_back(event);
                if has_content {
                    return Probe::Content;
                }
            }

            match self.bounded(upstream.next(), deadline, cancel).await {
                Err(interrupt) => return Probe::Interrupted(interrupt),
                Ok(Some(Ok(chunk))) => {
                    if let Err(e) = decoder.push(&chunk) {
                        return Probe::Failed(
                            ErrorKind::TransientServer,
                            format!("stream event exceeds {} buffered bytes", e.buffered),
                        );
                    }
                }
                Ok(Some(Err(e))) => return Probe::Failed(classify(&e), e.to_string()),
                Ok(None) => {
                    return Probe::Failed(
                        ErrorKind::TransientServer,
                        "stream ended before any content".to_string(),
                    );
                }
            }
        }
    }

    /// One rotation step. `None` ends the request with `Ok(None)` at the
    /// caller; both flavors are logged and counted inside the manager.
    async fn next_key(
        &self,
        provider: &str,
        model: &str,
        deadline: Instant,
        tried: &HashSet<String>,
    ) -> Option<Lease> {
        if self.clock.now() >= deadline {
            tracing::info!(provider, model, "request deadline reached");
            return None;
        }
        match self.usage.select_key(provider, model, deadline, tried).await {
            Ok(lease) => Some(lease),
            Err(NoKey::Exhausted) => {
                tracing::info!(provider, model, tried = tried.len(), "key pool exhausted");
                None
            }
            Err(NoKey::Deadline) => {
                tracing::info!(provider, model, "deadline while selecting key");
                None
            }
        }
    }

    /// Decide retry vs rotate vs surface for one failed attempt.
    fn failure_action(
        &self,
        kind: ErrorKind,
        message: &str,
        attempt: u32,
        deadline: Instant,
    ) -> FailureAction {
        match kind {
            ErrorKind::TransientServer | ErrorKind::Unknown => {
                // Unknown is transient-with-suspicion: one capped retry.
                let out_of_retries = attempt >= self.settings.max_retries
                    || (kind == ErrorKind::Unknown && attempt >= 1);
                if out_of_retries {
                    return FailureAction::Rotate(None);
                }
                let wait = self.settings.base_retry * 2u32.pow(attempt);
                if self.clock.now() + wait > deadline {
                    // The back-off would outlive the deadline; spend the
                    // remaining budget on a different key instead.
                    FailureAction::Rotate(None)
                } else {
                    FailureAction::RetryAfter(wait)
                }
            }
            ErrorKind::RateLimit | ErrorKind::Authentication | ErrorKind::QuotaExhausted => {
                FailureAction::Rotate(Some(kind))
            }
            ErrorKind::BadRequest => {
                FailureAction::Fatal(KeywheelError::BadRequest(message.to_string()))
            }
            ErrorKind::ContextLength => {
                FailureAction::Fatal(KeywheelError::ContextLength(message.to_string()))
            }
        }
    }

    /// Run a future against the deadline and the caller's cancellation.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = T>,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, Interrupt> {
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            out = fut => Ok(out),
            _ = self.clock.sleep_until(deadline) => Err(Interrupt::Deadline),
            _ = cancelled => Err(Interrupt::Cancelled),
        }
    }

    async fn backoff(
        &self,
        wait: Duration,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Interrupt> {
        let wake = self.clock.now() + wait;
        self.bounded(self.clock.sleep_until(wake), deadline, cancel)
            .await
    }

    fn log_interrupt(&self, interrupt: &Interrupt, provider: &str, model: &str) {
        match interrupt {
            Interrupt::Deadline => {
                tracing::info!(provider, model, "request deadline reached mid-attempt");
            }
            Interrupt::Cancelled => {
                tracing::info!(provider, model, "request cancelled by caller");
            }
        }
    }

    fn ensure_open(&self) -> Result<(), KeywheelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeywheelError::Closed);
        }
        Ok(())
    }
}

/// Split and validate a `provider/model_name` identifier. The provider
/// segment is lowercase alphanumerics plus `_`/`-`; the model segment just
/// has to be non-empty.
fn split_model(model: &str) -> Result<(&str, &str), KeywheelError> {
    let Some((provider, name)) = model.split_once('/') else {
        return Err(KeywheelError::InvalidModel(model.to_string()));
    };
    let provider_ok = !provider.is_empty()
        && provider
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !provider_ok || name.is_empty() {
        return Err(KeywheelError::InvalidModel(model.to_string()));
    }
    Ok((provider, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_splitting() {
        assert_eq!(split_model("openai/gpt-x").unwrap(), ("openai", "gpt-x"));
        assert_eq!(
            split_model("together/Qwen/Qwen3.5-72B").unwrap(),
            ("together", "Qwen/Qwen3.5-72B")
        );
        assert!(split_model("nodelimiter").is_err());
        assert!(split_model("/model").is_err());
        assert!(split_model("openai/").is_err());
        assert!(split_model("OpenAI/gpt-x").is_err());
    }
}
