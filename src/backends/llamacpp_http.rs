//! Adapter for a `llama.cpp` server process (`llama-server`) reached over
//! HTTP — its native `/completion` endpoint, not an OpenAI-compat shim.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{estimate_tokens, GenerateOutput, GenerateParams, HealthState};

pub struct LlamaCppHttpAdapter {
    pub(crate) model_id: String,
    client: Client,
    base_url: String,
    min_chars: usize,
}

impl LlamaCppHttpAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let base_url = entry
            .endpoint
            .as_ref()
            .ok_or("llamacpp-http requires `endpoint`")?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .build()
            .map_err(|e| format!("building http client: {e}"))?;

        Ok(Self {
            model_id: entry.id.clone(),
            client,
            base_url,
            min_chars,
        })
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        let full_prompt = match &params.system_prompt {
            Some(system) => format!("{system}\n\n{prompt}"),
            None => prompt.to_string(),
        };

        let mut body = serde_json::Map::new();
        body.insert("prompt".to_string(), json!(full_prompt));
        body.insert(
            "n_predict".to_string(),
            json!(params.max_tokens.unwrap_or(512)),
        );
        if let Some(temperature) = params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }

        let url = format!("{}/completion", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&self.model_id, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                model_id: self.model_id.clone(),
                code: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(|e| network_error(&self.model_id, &e))?;

        #[derive(Deserialize)]
        struct CompletionResponse {
            content: String,
            #[serde(default)]
            tokens_evaluated: Option<u32>,
            #[serde(default)]
            tokens_predicted: Option<u32>,
        }

        let parsed: CompletionResponse = serde_json::from_str(&text).map_err(|e| AdapterError::Protocol {
            model_id: self.model_id.clone(),
            detail: e.to_string(),
        })?;

        if parsed.content.chars().count() < self.min_chars {
            return Err(AdapterError::EmptyResponse {
                model_id: self.model_id.clone(),
            });
        }

        Ok(GenerateOutput {
            tokens_in: parsed.tokens_evaluated.or_else(|| Some(estimate_tokens(&full_prompt))),
            tokens_out: parsed.tokens_predicted.or_else(|| Some(estimate_tokens(&parsed.content))),
            text: parsed.content,
        })
    }

    pub async fn health_probe(&self, deadline: Duration) -> HealthState {
        let url = format!("{}/health", self.base_url);
        let call = self.client.get(&url).send();

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(response)) if response.status().is_success() => HealthState::Healthy,
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer) -> ModelEntry {
        ModelEntry {
            id: "local-gguf".to_string(),
            provider_kind: crate::config::ProviderKind::LlamaCppHttp,
            endpoint: Some(server.uri()),
            model_name: None,
            model_path: None,
            api_key: None,
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        }
    }

    #[tokio::test]
    async fn generate_parses_completion_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": "generated text",
                "tokens_evaluated": 4,
                "tokens_predicted": 3,
            })))
            .mount(&server)
            .await;

        let adapter = LlamaCppHttpAdapter::build(&entry_for(&server), 1).unwrap();
        let out = adapter
            .generate("hi", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(out.text, "generated text");
        assert_eq!(out.tokens_in, Some(4));
    }

    #[tokio::test]
    async fn health_probe_healthy_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = LlamaCppHttpAdapter::build(&entry_for(&server), 1).unwrap();
        let state = adapter.health_probe(Duration::from_secs(2)).await;
        assert_eq!(state, HealthState::Healthy);
    }
}
