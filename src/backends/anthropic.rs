//! Anthropic Messages API adapter. Unlike the OpenAI-compatible path this
//! one translates request/response shape rather than forwarding verbatim:
//! Anthropic puts the system prompt in its own top-level field and wraps
//! usage under `usage.input_tokens`/`usage.output_tokens`.

use std::time::Duration;

use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::json;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{GenerateOutput, GenerateParams, HealthState};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    pub(crate) model_id: String,
    client: Client,
    base_url: String,
    model_name: String,
    has_api_key: bool,
    min_chars: usize,
}

impl AnthropicAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let base_url = entry
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let model_name = entry
            .model_name
            .clone()
            .ok_or("anthropic requires `model_name`")?;
        let api_key = entry
            .resolve_api_key()
            .ok_or("anthropic requires an api_key, api_key_env, or ANTHROPIC_API_KEY")?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key).map_err(|e| format!("invalid api key characters: {e}"))?,
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| format!("building http client: {e}"))?;

        Ok(Self {
            model_id: entry.id.clone(),
            client,
            base_url,
            model_name,
            has_api_key: !api_key.is_empty(),
            min_chars,
        })
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model_name));
        body.insert(
            "max_tokens".to_string(),
            json!(params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        body.insert(
            "messages".to_string(),
            json!([{ "role": "user", "content": prompt }]),
        );
        if let Some(system) = &params.system_prompt {
            body.insert("system".to_string(), json!(system));
        }
        if let Some(temperature) = params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&self.model_id, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::Auth {
                model_id: self.model_id.clone(),
            });
        }
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                model_id: self.model_id.clone(),
                code: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(|e| network_error(&self.model_id, &e))?;

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(default)]
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            input_tokens: Option<u32>,
            #[serde(default)]
            output_tokens: Option<u32>,
        }
        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<ContentBlock>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| AdapterError::Protocol {
            model_id: self.model_id.clone(),
            detail: e.to_string(),
        })?;

        let combined = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if combined.chars().count() < self.min_chars {
            return Err(AdapterError::EmptyResponse {
                model_id: self.model_id.clone(),
            });
        }

        Ok(GenerateOutput {
            tokens_in: parsed.usage.as_ref().and_then(|u| u.input_tokens),
            tokens_out: parsed.usage.as_ref().and_then(|u| u.output_tokens),
            text: combined,
        })
    }

    /// No dedicated health endpoint is worth spending quota on: the only
    /// thing checked is that a key is configured at all.
    pub async fn health_probe(&self, _deadline: Duration) -> HealthState {
        if self.has_api_key {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy("no api key configured".to_string())
        }
    }
}

fn network_error(model_id: &str, err: &reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout {
            model_id: model_id.to_string(),
        }
    } else {
        AdapterError::Network {
            model_id: model_id.to_string(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer) -> ModelEntry {
        ModelEntry {
            id: "claude".to_string(),
            provider_kind: crate::config::ProviderKind::Anthropic,
            endpoint: Some(server.uri()),
            model_name: Some("claude-3-5-sonnet".to_string()),
            model_path: None,
            api_key: Some("sk-ant-test".to_string()),
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        }
    }

    #[test]
    fn build_requires_api_key() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let entry = ModelEntry {
            id: "claude".to_string(),
            provider_kind: crate::config::ProviderKind::Anthropic,
            endpoint: None,
            model_name: Some("claude-3-5-sonnet".to_string()),
            model_path: None,
            api_key: None,
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        };
        assert!(AnthropicAdapter::build(&entry, 1).is_err());
    }

    #[tokio::test]
    async fn generate_joins_content_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "hel" }, { "type": "text", "text": "lo" }],
                "usage": { "input_tokens": 4, "output_tokens": 2 },
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::build(&entry_for(&server), 1).unwrap();
        let out = adapter
            .generate("hi", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.tokens_in, Some(4));
    }

    #[tokio::test]
    async fn generate_rejects_response_shorter_than_min_chars() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "hi" }],
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::build(&entry_for(&server), 5).unwrap();
        let err = adapter
            .generate("hi", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn health_probe_checks_key_presence_without_a_network_call() {
        let server = MockServer::start().await;
        // No mock mounted at all: a probe that made a real HTTP call would
        // get back wiremock's default 404, not Healthy.
        let adapter = AnthropicAdapter::build(&entry_for(&server), 1).unwrap();
        let state = adapter.health_probe(Duration::from_secs(5)).await;
        assert_eq!(state, HealthState::Healthy);
    }
}
