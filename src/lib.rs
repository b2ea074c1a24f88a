//! Resilient API-key rotation and dispatch for LLM providers.
//!
//! Callers hand the [`Dispatcher`] a `provider/model` completion or
//! embedding request; the engine picks an eligible key from the provider's
//! pool, dispatches through an [`LlmClient`](dispatch::LlmClient), and
//! recovers from transient and credential failures by retrying and
//! rotating keys, all inside one end-to-end deadline. Transient provider
//! weather is never surfaced: callers see a response, a stream, `None`, or
//! a request-shape error, nothing else.
//!
//! A key may serve many different models at once (bounded by a per-key
//! gate), but at most one in-flight request per (key, model). Failures
//! charge per-(key, model) cooldowns with escalating back-off; repeated
//! auth failures across distinct models lock a key out entirely. Usage is
//! counted per key and snapshotted to disk, with a daily rollover at local
//! midnight.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pricing;
pub mod tokens;
pub mod usage;

pub use clock::{Clock, SystemClock};
pub use config::{Config, ProviderKeys, Settings};
pub use dispatch::dispatcher::{CompletionReply, Dispatcher, DispatcherBuilder};
pub use dispatch::stream::CompletionStream;
pub use dispatch::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    LlmClient,
};
pub use error::{ErrorKind, KeywheelError, ProviderError};
pub use tokens::TokenCounter;
pub use usage::{Lease, NoKey, UsageManager};
