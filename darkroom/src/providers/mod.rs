//! Provider adapter abstraction layer.
//!
//! This module defines the `ImageProvider` trait which abstracts image
//! generation across different inference providers, and the registry that
//! maps a `(provider, model)` catalog pair to an adapter. Adding a provider
//! means adding one adapter module and one arm in [`ProviderRegistry::from_config`];
//! no other component changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProvidersConfig;

pub mod dummy;
pub mod fal;
pub mod openai;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors surfaced by provider adapters.
///
/// The split drives the retry policy: `Transient` failures are retried up
/// to the attempt budget, `Permanent` failures refund immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Upstream hiccup (network, timeout, 429/5xx); worth retrying.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// The provider rejected the request outright; retrying cannot help.
    #[error("Permanent provider failure: {0}")]
    Permanent(String),
}

/// Provider-specific generation parameters, opaque to the core.
///
/// Each adapter deserializes this into its own input shape during
/// `validate`, which runs before any funds are reserved or jobs queued.
pub type GenerateInput = serde_json::Value;

/// Outcome of the cheap, synchronous input check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub message: String,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            ok: true,
            message: "Validation passed".to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// What a generation call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutput {
    /// The provider hosts the output at an (often ephemeral) URL.
    Url {
        url: String,
        provider_request_id: Option<String>,
    },
    /// The provider returned the image bytes inline, base64-encoded.
    Inline {
        b64: String,
        provider_request_id: Option<String>,
    },
    /// The provider accepted the job and will deliver the result to our
    /// webhook endpoint; only the correlation id exists so far.
    Submitted { provider_request_id: String },
}

/// Abstract image generation provider.
///
/// Adapters are stateless aside from upstream client configuration.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Validate provider-specific input. Cheap and synchronous in spirit
    /// (no upstream calls); runs on the request path before any funds are
    /// reserved or any job queued.
    fn validate(&self, input: &GenerateInput) -> ValidationResult;

    /// Perform (or start) the generation. Expensive: may take seconds to
    /// minutes, may poll an upstream job to completion, or may
    /// submit-and-return for webhook delivery.
    async fn generate(&self, input: &GenerateInput) -> Result<GenerateOutput>;
}

/// Pure strategy lookup from `(provider, model)` to an adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<(String, String), Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a `(provider, model)` key.
    pub fn register(
        &mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        adapter: Arc<dyn ImageProvider>,
    ) {
        self.adapters
            .insert((provider.into(), model.into()), adapter);
    }

    /// Look up the adapter for a `(provider, model)` pair.
    pub fn resolve(&self, provider: &str, model: &str) -> Option<Arc<dyn ImageProvider>> {
        self.adapters
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
    }

    /// Build the registry from configuration.
    ///
    /// This is the single point where configuration turns into adapter
    /// instances; a new provider needs one entry here.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();

        if let Some(openai) = &config.openai {
            registry.register(
                "openai",
                "gpt-image-1",
                Arc::new(openai::OpenAiImageProvider::new(openai.clone())),
            );
        }

        if let Some(fal) = &config.fal {
            registry.register(
                "fal",
                "flux-lora",
                Arc::new(fal::FalQueueProvider::new(fal.clone())),
            );
        }

        if config.dummy_enabled {
            registry.register("dummy", "checkerboard", Arc::new(dummy::DummyProvider::new()));
        }

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_pair_returns_none() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("openai", "gpt-image-1").is_none());
    }

    #[test]
    fn registered_adapter_is_resolvable() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "dummy",
            "checkerboard",
            Arc::new(dummy::DummyProvider::new()),
        );
        assert!(registry.resolve("dummy", "checkerboard").is_some());
        assert!(registry.resolve("dummy", "other-model").is_none());
    }
}
