//! Ollama local inference server adapter (native `/api/generate` protocol,
//! not the OpenAI-compat shim Ollama also exposes — this talks the
//! original wire format directly).

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{estimate_tokens, GenerateOutput, GenerateParams, HealthState};

pub struct OllamaAdapter {
    pub(crate) model_id: String,
    client: Client,
    base_url: String,
    model_name: String,
    min_chars: usize,
}

impl OllamaAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let base_url = entry
            .endpoint
            .as_ref()
            .ok_or("ollama requires `endpoint`")?
            .trim_end_matches('/')
            .to_string();
        let model_name = entry
            .model_name
            .clone()
            .ok_or("ollama requires `model_name`")?;

        let client = Client::builder()
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
        let full_prompt = match &params.system_prompt {
            Some(system) => format!("{system}\n\n{prompt}"),
            None => prompt.to_string(),
        };

        let mut options = serde_json::Map::new();
        if let Some(temp) = params.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tokens) = params.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }

        let body = json!({
            "model": self.model_name,
            "prompt": full_prompt,
            "stream": false,
            "options": options,
        });

        let url = format!("{}/api/generate", self.base_url);
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

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
            #[serde(default)]
            prompt_eval_count: Option<u32>,
            #[serde(default)]
            eval_count: Option<u32>,
        }

        let text = response.text().await.map_err(|e| network_error(&self.model_id, &e))?;
        let parsed: OllamaResponse = serde_json::from_str(&text).map_err(|e| AdapterError::Protocol {
            model_id: self.model_id.clone(),
            detail: e.to_string(),
        })?;

        if parsed.response.chars().count() < self.min_chars {
            return Err(AdapterError::EmptyResponse {
                model_id: self.model_id.clone(),
            });
        }

        Ok(GenerateOutput {
            tokens_in: parsed
                .prompt_eval_count
                .or_else(|| Some(estimate_tokens(&full_prompt))),
            tokens_out: parsed.eval_count.or_else(|| Some(estimate_tokens(&parsed.response))),
            text: parsed.response,
        })
    }

    pub async fn health_probe(&self, deadline: Duration) -> HealthState {
        let url = format!("{}/api/tags", self.base_url);
        let call = self.client.get(&url).send();

        #[derive(Deserialize, Default)]
        struct TagsResponse {
            #[serde(default)]
            models: Vec<serde_json::Value>,
        }

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(response)) if response.status().is_success() => {
                let status = response.status();
                match response.json::<TagsResponse>().await {
                    Ok(tags) if tags.models.is_empty() => {
                        HealthState::Degraded("server has no models loaded".to_string())
                    }
                    Ok(_) => HealthState::Healthy,
                    Err(_) => HealthState::Degraded(format!("HTTP {status} with unparseable body")),
                }
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
