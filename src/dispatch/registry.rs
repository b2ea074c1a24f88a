use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Model discovery capability, wired at dispatcher construction. Replaces
/// runtime plugin scanning with an explicit seam: implementations may ask
/// the provider (`GET /models` and friends) or answer from configuration.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Model identifiers (`provider/model_name`) a key on this provider
    /// can serve.
    async fn get_models(&self, provider: &str, key: &str) -> Result<Vec<String>, ProviderError>;
}

/// Configuration-backed catalog: providers map to fixed model lists, keys
/// are irrelevant to the answer.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    models: HashMap<String, Vec<String>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register models for a provider. Names may be bare ("gpt-x") or
    /// already prefixed ("openai/gpt-x"); both normalize to prefixed.
    pub fn with_models<I, S>(mut self, provider: &str, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let normalized = models
            .into_iter()
            .map(|m| {
                let m = m.into();
                if m.starts_with(&format!("{provider}/")) {
                    m
                } else {
                    format!("{provider}/{m}")
                }
            })
            .collect();
        self.models.insert(provider.to_string(), normalized);
        self
    }
}

#[async_trait]
impl ProviderRegistry for StaticCatalog {
    async fn get_models(&self, provider: &str, _key: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.models.get(provider).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_normalizes_prefixes() {
        let catalog = StaticCatalog::new()
            .with_models("openai", ["gpt-x", "openai/gpt-y"])
            .with_models("xai", ["grok-4"]);

        let models = catalog.get_models("openai", "k").await.unwrap();
        assert_eq!(models, vec!["openai/gpt-x", "openai/gpt-y"]);

        assert!(catalog.get_models("nope", "k").await.unwrap().is_empty());
    }
}
