use thiserror::Error;

/// Errors surfaced to callers of the dispatcher.
///
/// Everything transient or credential-specific is handled internally by
/// retry and rotation; callers only ever see request-shape problems and
/// programmer errors. Pool/deadline exhaustion is `Ok(None)`, not an error.
#[derive(Debug, Error)]
pub enum KeywheelError {
    #[error("invalid model identifier: {0} (expected provider/model)")]
    InvalidModel(String),

    #[error("no keys configured for provider: {0}")]
    UnknownProvider(String),

    #[error("dispatcher is closed")]
    Closed,

    #[error("provider rejected request: {0}")]
    BadRequest(String),

    #[error("input exceeds model context window: {0}")]
    ContextLength(String),
}

/// Error raised by an [`LlmClient`](crate::dispatch::LlmClient)
/// implementation. Classified into an [`ErrorKind`] to drive the
/// retry/rotate decision.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to provider failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("{0}")]
    Other(String),
}

/// Closed failure taxonomy. Policy per kind lives in the dispatcher
/// (retry vs rotate vs surface) and the usage manager (cooldown shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 5xx, network timeout, connection reset. Retry same key.
    TransientServer,
    /// 429 or provider quota-exhausted-for-now. Rotate with cooldown.
    RateLimit,
    /// 401/403, invalid key. Rotate with long cooldown.
    Authentication,
    /// Daily/monthly cap hit. Rotate, cooldown until next local midnight.
    QuotaExhausted,
    /// 400, schema error, unknown model. Surface to caller.
    BadRequest,
    /// Input too large. Surface to caller.
    ContextLength,
    /// Uncategorized. Treated as transient with a single capped retry.
    Unknown,
}

impl ErrorKind {
    /// Kinds that are the credential's fault; rotation candidates.
    pub fn is_credential(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Authentication | ErrorKind::QuotaExhausted
        )
    }

    /// Kinds the caller must see; retry and rotation cannot fix them.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::BadRequest | ErrorKind::ContextLength)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientServer => "transient_server",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Authentication => "authentication",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ContextLength => "context_length",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Provider-message substrings mapped to kinds, checked in order against
/// the lowercased message. More specific phrasings come first; absence of
/// a match means `Unknown`.
const MESSAGE_CLASSES: &[(&str, ErrorKind)] = &[
    ("context_length_exceeded", ErrorKind::ContextLength),
    ("context length", ErrorKind::ContextLength),
    ("maximum context", ErrorKind::ContextLength),
    ("prompt is too long", ErrorKind::ContextLength),
    ("insufficient_quota", ErrorKind::QuotaExhausted),
    ("exceeded your current quota", ErrorKind::QuotaExhausted),
    ("quota", ErrorKind::QuotaExhausted),
    ("billing", ErrorKind::QuotaExhausted),
    ("out of credits", ErrorKind::QuotaExhausted),
    ("invalid_api_key", ErrorKind::Authentication),
    ("invalid api key", ErrorKind::Authentication),
    ("incorrect api key", ErrorKind::Authentication),
    ("authentication_error", ErrorKind::Authentication),
    ("unauthorized", ErrorKind::Authentication),
    ("permission_denied", ErrorKind::Authentication),
    ("rate_limit", ErrorKind::RateLimit),
    ("rate limit", ErrorKind::RateLimit),
    ("too many requests", ErrorKind::RateLimit),
    ("overloaded", ErrorKind::TransientServer),
    ("model_not_found", ErrorKind::BadRequest),
    ("unknown model", ErrorKind::BadRequest),
    ("invalid_request_error", ErrorKind::BadRequest),
];

fn classify_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    MESSAGE_CLASSES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|&(_, kind)| kind)
}

fn classify_status(status: u16, message: &str) -> ErrorKind {
    match status {
        // 429 is rate limiting unless the body says the quota itself is gone.
        429 => match classify_message(message) {
            Some(ErrorKind::QuotaExhausted) => ErrorKind::QuotaExhausted,
            _ => ErrorKind::RateLimit,
        },
        401 | 403 => ErrorKind::Authentication,
        400 | 404 | 422 => match classify_message(message) {
            Some(ErrorKind::ContextLength) => ErrorKind::ContextLength,
            _ => ErrorKind::BadRequest,
        },
        500..=599 => ErrorKind::TransientServer,
        _ => classify_message(message).unwrap_or(ErrorKind::Unknown),
    }
}

/// Map a provider failure into the closed taxonomy.
///
/// HTTP status is authoritative when present; otherwise the message runs
/// through the substring table. Transport-level timeouts and connection
/// failures are transient by definition.
pub fn classify(err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::Transport(e) => {
            if e.is_timeout() || e.is_connect() {
                ErrorKind::TransientServer
            } else if let Some(status) = e.status() {
                classify_status(status.as_u16(), &e.to_string())
            } else {
                // Body/decode failure mid-transfer: retryable.
                ErrorKind::TransientServer
            }
        }
        ProviderError::Http { status, message } => classify_status(*status, message),
        ProviderError::Timeout(_) => ErrorKind::TransientServer,
        ProviderError::Stream(message) => {
            classify_message(message).unwrap_or(ErrorKind::TransientServer)
        }
        ProviderError::Other(message) => classify_message(message).unwrap_or(ErrorKind::Unknown),
    }
}

/// Classify a mid-stream event payload that carries a top-level `error`
/// field. Returns `None` for ordinary content events.
pub fn classify_event(event: &serde_json::Value) -> Option<ErrorKind> {
    let error = event.get("error")?;
    // Some providers emit `"error": null` on perfectly healthy events.
    if error.is_null() {
        return None;
    }

    // Some providers put an HTTP-equivalent status inside the error object.
    let status = error
        .get("status")
        .or_else(|| error.get("code"))
        .and_then(serde_json::Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());

    let mut text = String::new();
    for field in ["message", "type", "code"] {
        if let Some(s) = error.get(field).and_then(serde_json::Value::as_str) {
            text.push_str(s);
            text.push(' ');
        }
    }
    // Bare-string error payload: {"error": "invalid_api_key"}
    if let Some(s) = error.as_str() {
        text.push_str(s);
    }

    Some(match status {
        Some(code) => classify_status(code, &text),
        None => classify_message(&text).unwrap_or(ErrorKind::Unknown),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_drive_classification() {
        let err = ProviderError::Http {
            status: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(classify(&err), ErrorKind::RateLimit);

        let err = ProviderError::Http {
            status: 429,
            message: "You exceeded your current quota".to_string(),
        };
        assert_eq!(classify(&err), ErrorKind::QuotaExhausted);

        let err = ProviderError::Http {
            status: 401,
            message: String::new(),
        };
        assert_eq!(classify(&err), ErrorKind::Authentication);

        let err = ProviderError::Http {
            status: 503,
            message: "upstream unavailable".to_string(),
        };
        assert_eq!(classify(&err), ErrorKind::TransientServer);
    }

    #[test]
    fn message_substrings_drive_classification() {
        let err = ProviderError::Other("Rate limit reached for gpt-x".to_string());
        assert_eq!(classify(&err), ErrorKind::RateLimit);

        let err = ProviderError::Other("Incorrect API key provided".to_string());
        assert_eq!(classify(&err), ErrorKind::Authentication);

        let err = ProviderError::Http {
            status: 400,
            message: "This model's maximum context length is 8192 tokens".to_string(),
        };
        assert_eq!(classify(&err), ErrorKind::ContextLength);

        let err = ProviderError::Other("something nobody has seen before".to_string());
        assert_eq!(classify(&err), ErrorKind::Unknown);
    }

    #[test]
    fn timeouts_are_transient() {
        assert_eq!(
            classify(&ProviderError::Timeout(5000)),
            ErrorKind::TransientServer
        );
    }

    #[test]
    fn event_payloads_classify() {
        let ev = serde_json::json!({
            "error": {"message": "invalid_api_key", "type": "authentication_error"}
        });
        assert_eq!(classify_event(&ev), Some(ErrorKind::Authentication));

        let ev = serde_json::json!({"error": "rate limit exceeded"});
        assert_eq!(classify_event(&ev), Some(ErrorKind::RateLimit));

        let ev = serde_json::json!({"error": {"status": 500, "message": "boom"}});
        assert_eq!(classify_event(&ev), Some(ErrorKind::TransientServer));

        let ev = serde_json::json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(classify_event(&ev), None);
    }
}
