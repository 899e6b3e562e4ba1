//! Adapter for any backend speaking the OpenAI `/v1/chat/completions`
//! protocol — OpenRouter, LM Studio, vLLM, LocalAI, and plain OpenAI
//! itself when pointed at `api.openai.com`.

use std::time::Duration;

use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::json;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{GenerateOutput, GenerateParams, HealthState};

pub struct OpenAiAdapter {
    pub(crate) model_id: String,
    client: Client,
    base_url: String,
    model_name: String,
    min_chars: usize,
}

impl OpenAiAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let base_url = entry
            .endpoint
            .as_ref()
            .ok_or("openai-compatible requires `endpoint`")?
            .trim_end_matches('/')
            .to_string();
        let model_name = entry
            .model_name
            .clone()
            .ok_or("openai-compatible requires `model_name`")?;

        let mut headers = header::HeaderMap::new();
        if let Some(key) = entry.resolve_api_key() {
            let value = format!("Bearer {key}");
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .map_err(|e| format!("invalid api key characters: {e}"))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| format!("building http client: {e}"))?;

        Ok(Self {
            model_id: entry.id.clone(),
            client,
            base_url,
            model_name,
            min_chars,
        })
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        let mut messages = Vec::new();
        if let Some(system) = &params.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model_name));
        body.insert("messages".to_string(), json!(messages));
        if let Some(max_tokens) = params.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
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
        struct Usage {
            #[serde(default)]
            prompt_tokens: Option<u32>,
            #[serde(default)]
            completion_tokens: Option<u32>,
        }
        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| AdapterError::Protocol {
            model_id: self.model_id.clone(),
            detail: e.to_string(),
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.chars().count() < self.min_chars {
            return Err(AdapterError::EmptyResponse {
                model_id: self.model_id.clone(),
            });
        }

        let usage = parsed.usage;
        Ok(GenerateOutput {
            tokens_in: usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: usage.as_ref().and_then(|u| u.completion_tokens),
            text: content,
        })
    }

    pub async fn health_probe(&self, deadline: Duration) -> HealthState {
        let url = format!("{}/v1/models", self.base_url);
        let call = self.client.get(&url).send();

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(response)) if response.status().is_success() => HealthState::Healthy,
            Ok(Ok(response)) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                HealthState::Unhealthy("authentication rejected".to_string())
            }
            Ok(Ok(response)) => HealthState::Degraded(format!("HTTP {}", response.status())),
            Ok(Err(e)) => HealthState::Unhealthy(e.to_string()),
            Err(_) => HealthState::Unhealthy("probe timed out".to_string()),
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
    use wiremock::matchers::{header as wm_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer) -> ModelEntry {
        ModelEntry {
            id: "gpt".to_string(),
            provider_kind: crate::config::ProviderKind::OpenAiCompatible,
            endpoint: Some(server.uri()),
            model_name: Some("gpt-4o-mini".to_string()),
            model_path: None,
            api_key: Some("sk-test".to_string()),
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        }
    }

    #[tokio::test]
    async fn generate_sends_bearer_token_and_parses_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(wm_header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hi there" } }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 2 },
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::build(&entry_for(&server), 1).unwrap();
        let out = adapter
            .generate("hello", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(out.text, "hi there");
        assert_eq!(out.tokens_in, Some(3));
    }

    #[tokio::test]
    async fn generate_maps_401_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::build(&entry_for(&server), 1).unwrap();
        let err = adapter
            .generate("hello", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Auth { .. }));
    }
}
