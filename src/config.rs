use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Providers the default HTTP client knows endpoints for. Key pools are
/// built from `<PROVIDER>_API_KEYS` (comma-separated, order preserved)
/// with `<PROVIDER>_API_KEY` as a single-key fallback.
const KNOWN_PROVIDERS: &[&str] = &[
    "openai",
    "openrouter",
    "xai",
    "deepseek",
    "mistral",
    "together",
    "gemini",
];

/// Ordered key pool for one provider.
#[derive(Clone)]
pub struct ProviderKeys {
    pub provider: String,
    pub keys: Vec<String>,
}

impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("provider", &self.provider)
            .field("key_count", &self.keys.len())
            .finish()
    }
}

/// Engine tunables. Defaults match the documented policy; the handful that
/// operators actually turn are env-overridable.
#[derive(Debug, Clone)]
pub struct Settings {
    /// End-to-end budget for one logical request.
    pub global_timeout: Duration,
    /// Retries on the same key for transient failures.
    pub max_retries: u32,
    /// Back-off base for same-key retries (doubles per attempt).
    pub base_retry: Duration,
    /// Cooldown base for rate-limit/auth strikes (doubles per strike).
    pub base_cooldown: Duration,
    /// Strike exponent cap: 30s * 2^6 ≈ 32 min worst case.
    pub strike_cap: u32,
    /// Distinct failed models before a key-wide lockout.
    pub distinct_failure_threshold: usize,
    /// Key-wide lockout length once the threshold trips.
    pub lockout_window: Duration,
    /// Concurrent distinct-model uses allowed per key.
    pub max_concurrent_models_per_key: usize,
    /// Largest buffered SSE event before the stream is declared broken.
    pub max_event_bytes: usize,
    /// Coalescing window for the snapshot writer.
    pub persist_debounce: Duration,
    /// Usage snapshot location.
    pub usage_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(30),
            max_retries: 2,
            base_retry: Duration::from_secs(1),
            base_cooldown: Duration::from_secs(30),
            strike_cap: 6,
            distinct_failure_threshold: 3,
            lockout_window: Duration::from_secs(15 * 60),
            max_concurrent_models_per_key: 8,
            max_event_bytes: 1024 * 1024,
            persist_debounce: Duration::from_secs(1),
            usage_path: PathBuf::from(".keywheel/usage.json"),
        }
    }
}

pub struct Config {
    pub pools: Vec<ProviderKeys>,
    pub settings: Settings,
}

impl Config {
    /// Build a config from explicit pools with default settings.
    pub fn new(pools: Vec<ProviderKeys>) -> Self {
        Self {
            pools,
            settings: Settings::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Read key pools and overrides from the environment. `.env` loading is
    /// the caller's business (the binary does it; libraries shouldn't).
    pub fn from_env() -> Self {
        let mut pools = Vec::new();

        for provider in KNOWN_PROVIDERS {
            let keys = keys_from_env(provider);
            if keys.is_empty() {
                tracing::warn!(provider, "no API keys configured — provider unavailable");
                continue;
            }
            tracing::info!(provider, count = keys.len(), "loaded key pool");
            pools.push(ProviderKeys {
                provider: (*provider).to_string(),
                keys,
            });
        }

        if pools.is_empty() {
            tracing::error!("no providers configured — every dispatch will fail");
        }

        let mut settings = Settings::default();
        if let Some(secs) = env_u64("KEYWHEEL_TIMEOUT_SECS") {
            settings.global_timeout = Duration::from_secs(secs);
        }
        if let Ok(path) = env::var("KEYWHEEL_USAGE_PATH") {
            settings.usage_path = PathBuf::from(path);
        }

        Config {
            pools,
            settings,
        }
    }
}

/// `OPENAI_API_KEYS=k1,k2` beats `OPENAI_API_KEY=k1`. Blank segments from
/// trailing commas are dropped; order is the configured rotation order.
fn keys_from_env(provider: &str) -> Vec<String> {
    let upper = provider.to_uppercase();

    if let Ok(joined) = env::var(format!("{upper}_API_KEYS")) {
        let keys: Vec<String> = joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !keys.is_empty() {
            return keys;
        }
    }

    match env::var(format!("{upper}_API_KEY")) {
        Ok(key) if !key.trim().is_empty() => vec![key.trim().to_string()],
        _ => Vec::new(),
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(name, raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let s = Settings::default();
        assert_eq!(s.global_timeout, Duration::from_secs(30));
        assert_eq!(s.max_retries, 2);
        assert_eq!(s.strike_cap, 6);
        assert_eq!(s.distinct_failure_threshold, 3);
        assert_eq!(s.max_concurrent_models_per_key, 8);
        // 30s * 2^6 stays within the ~32 minute ceiling.
        assert_eq!(s.base_cooldown * 2u32.pow(s.strike_cap), Duration::from_secs(1920));
    }

    #[test]
    fn key_lists_split_and_trim() {
        // Env mutation is process-global; keep it to one test.
        unsafe {
            env::set_var("MISTRAL_API_KEYS", " a , b ,, c ,");
        }
        assert_eq!(keys_from_env("mistral"), vec!["a", "b", "c"]);
        unsafe {
            env::remove_var("MISTRAL_API_KEYS");
            env::set_var("MISTRAL_API_KEY", "solo");
        }
        assert_eq!(keys_from_env("mistral"), vec!["solo"]);
        unsafe {
            env::remove_var("MISTRAL_API_KEY");
        }
        assert!(keys_from_env("mistral").is_empty());
    }
}
