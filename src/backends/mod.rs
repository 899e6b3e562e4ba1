//! Provider adapters and the unified dispatch interface over them.
//!
//! [`ProviderAdapter`] is a closed enum over concrete adapters chosen at
//! registry-build time from a [`ModelEntry::provider_kind`]. All routing
//! code interacts with the same `generate`/`health_probe` pair; adapter-
//! specific protocol differences — request shape, auth headers, response
//! parsing — are fully encapsulated in the adapter modules. A closed enum
//! is used instead of `dyn Trait` so the full set of backends is visible
//! at a single match site and the compiler catches an unhandled kind.

mod anthropic;
mod google;
mod llamacpp_http;
mod ollama;
mod openai;

#[cfg(feature = "embedded-llama")]
mod llamacpp_embedded;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use llamacpp_http::LlamaCppHttpAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

#[cfg(feature = "embedded-llama")]
pub use llamacpp_embedded::LlamaCppEmbeddedAdapter;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ModelEntry, ProviderKind};
use crate::error::AdapterError;

/// Per-call generation parameters. `system_prompt` is translated into
/// whatever shape each wire protocol expects (a `system` field for
/// Anthropic, a leading `system` message for OpenAI-compatible, and so
/// on).
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Result of one successful adapter call. Token counts are `None` when the
/// wire protocol doesn't report usage and no local estimate was computed.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
}

/// Outcome of a health probe. `Degraded` covers a reachable
/// backend responding with something other than a clean 2xx — e.g. a
/// model file missing on an otherwise-live llama.cpp server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum HealthState {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthState {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded(_))
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(detail) => write!(f, "degraded: {detail}"),
            Self::Unhealthy(detail) => write!(f, "unhealthy: {detail}"),
        }
    }
}

/// Closed union of every backend this build knows how to call.
pub enum ProviderAdapter {
    Ollama(OllamaAdapter),
    OpenAiCompatible(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Google(GoogleAdapter),
    LlamaCppHttp(LlamaCppHttpAdapter),
    #[cfg(feature = "embedded-llama")]
    LlamaCppEmbedded(LlamaCppEmbeddedAdapter),
}

impl ProviderAdapter {
    /// Builds the adapter named by `entry.provider_kind`, resolving the
    /// credential and endpoint from the entry. Returns a human-readable
    /// reason string on failure — the caller (Model Registry) wraps it
    /// into `FabricError::AdapterBuild { model_id, reason }`.
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        match entry.provider_kind {
            ProviderKind::Ollama => OllamaAdapter::build(entry, min_chars).map(Self::Ollama),
            ProviderKind::OpenAiCompatible => {
                OpenAiAdapter::build(entry, min_chars).map(Self::OpenAiCompatible)
            }
            ProviderKind::Anthropic => AnthropicAdapter::build(entry, min_chars).map(Self::Anthropic),
            ProviderKind::Google => GoogleAdapter::build(entry, min_chars).map(Self::Google),
            ProviderKind::LlamaCppHttp => {
                LlamaCppHttpAdapter::build(entry, min_chars).map(Self::LlamaCppHttp)
            }
            #[cfg(feature = "embedded-llama")]
            ProviderKind::LlamaCppEmbedded => {
                LlamaCppEmbeddedAdapter::build(entry, min_chars).map(Self::LlamaCppEmbedded)
            }
            #[cfg(not(feature = "embedded-llama"))]
            ProviderKind::LlamaCppEmbedded => Err("feature_not_compiled".to_string()),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        match self {
            Self::Ollama(a) => a.generate(prompt, params).await,
            Self::OpenAiCompatible(a) => a.generate(prompt, params).await,
            Self::Anthropic(a) => a.generate(prompt, params).await,
            Self::Google(a) => a.generate(prompt, params).await,
            Self::LlamaCppHttp(a) => a.generate(prompt, params).await,
            #[cfg(feature = "embedded-llama")]
            Self::LlamaCppEmbedded(a) => a.generate(prompt, params).await,
        }
    }

    pub async fn health_probe(&self, deadline: Duration) -> HealthState {
        match self {
            Self::Ollama(a) => a.health_probe(deadline).await,
            Self::OpenAiCompatible(a) => a.health_probe(deadline).await,
            Self::Anthropic(a) => a.health_probe(deadline).await,
            Self::Google(a) => a.health_probe(deadline).await,
            Self::LlamaCppHttp(a) => a.health_probe(deadline).await,
            #[cfg(feature = "embedded-llama")]
            Self::LlamaCppEmbedded(a) => a.health_probe(deadline).await,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Ollama(a) => &a.model_id,
            Self::OpenAiCompatible(a) => &a.model_id,
            Self::Anthropic(a) => &a.model_id,
            Self::Google(a) => &a.model_id,
            Self::LlamaCppHttp(a) => &a.model_id,
            #[cfg(feature = "embedded-llama")]
            Self::LlamaCppEmbedded(a) => &a.model_id,
        }
    }
}

/// Shared token estimator for adapters whose wire format omits usage
/// counts (Ollama's non-streaming endpoint, llama.cpp's raw completion
/// endpoint). Falls back to a whitespace-split heuristic if the BPE
/// encoder can't be loaded.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    use std::sync::OnceLock;
    static ENCODER: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();

    let encoder = ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok());
    match encoder {
        Some(bpe) => bpe.encode_ordinary(text).len() as u32,
        None => text.split_whitespace().count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_display_includes_detail() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(
            HealthState::Unhealthy("connection refused".to_string()).to_string(),
            "unhealthy: connection refused"
        );
    }

    #[test]
    fn estimate_tokens_is_nonzero_for_nonempty_text() {
        assert!(estimate_tokens("hello there, general kenobi") > 0);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn build_rejects_embedded_kind_without_feature() {
        #[cfg(not(feature = "embedded-llama"))]
        {
            use std::collections::{HashMap, HashSet};
            let entry = ModelEntry {
                id: "local-llama".to_string(),
                provider_kind: ProviderKind::LlamaCppEmbedded,
                endpoint: None,
                model_name: None,
                model_path: Some(std::path::PathBuf::from("/models/m.gguf")),
                api_key: None,
                api_key_env: None,
                tags: HashSet::new(),
                parameters: HashMap::new(),
                locality: None,
            };
            let err = ProviderAdapter::build(&entry, 1).unwrap_err();
            assert_eq!(err, "feature_not_compiled");
        }
    }
}
