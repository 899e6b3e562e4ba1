//! Google Gemini `generateContent` adapter. Like Anthropic, the request
//! shape is Google's own — `contents`/`parts` nesting, `systemInstruction`
//! as a sibling field, the API key carried as a query parameter rather
//! than a header.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{GenerateOutput, GenerateParams, HealthState};

pub struct GoogleAdapter {
    pub(crate) model_id: String,
    client: Client,
    base_url: String,
    model_name: String,
    api_key: String,
    min_chars: usize,
}

impl GoogleAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let base_url = entry
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
            .trim_end_matches('/')
            .to_string();
        let model_name = entry
            .model_name
            .clone()
            .ok_or("google requires `model_name`")?;
        let api_key = entry
            .resolve_api_key()
            .ok_or("google requires an api_key, api_key_env, or GOOGLE_API_KEY")?;

        let client = Client::builder()
            .build()
            .map_err(|e| format!("building http client: {e}"))?;

        Ok(Self {
            model_id: entry.id.clone(),
            client,
            base_url,
            model_name,
            api_key,
            min_chars,
        })
    }

    fn url(&self, action: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{action}?key={}",
            self.base_url, self.model_name, self.api_key
        )
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        let mut body = serde_json::Map::new();
        body.insert(
            "contents".to_string(),
            json!([{ "parts": [{ "text": prompt }] }]),
        );
        if let Some(system) = &params.system_prompt {
            body.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = params.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = params.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if !generation_config.is_empty() {
            body.insert("generationConfig".to_string(), json!(generation_config));
        }

        let response = self
            .client
            .post(self.url("generateContent"))
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
        struct Part {
            #[serde(default)]
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct Content {
            #[serde(default)]
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Content,
        }
        #[derive(Deserialize)]
        struct UsageMetadata {
            #[serde(default, rename = "promptTokenCount")]
            prompt_token_count: Option<u32>,
            #[serde(default, rename = "candidatesTokenCount")]
            candidates_token_count: Option<u32>,
        }
        #[derive(Deserialize)]
        struct GenerateContentResponse {
            #[serde(default)]
            candidates: Vec<Candidate>,
            #[serde(default, rename = "usageMetadata")]
            usage_metadata: Option<UsageMetadata>,
        }

        let parsed: GenerateContentResponse =
            serde_json::from_str(&text).map_err(|e| AdapterError::Protocol {
                model_id: self.model_id.clone(),
                detail: e.to_string(),
            })?;

        let combined = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if combined.chars().count() < self.min_chars {
            return Err(AdapterError::EmptyResponse {
                model_id: self.model_id.clone(),
            });
        }

        Ok(GenerateOutput {
            tokens_in: parsed.usage_metadata.as_ref().and_then(|u| u.prompt_token_count),
            tokens_out: parsed
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count),
            text: combined,
        })
    }

    /// No dedicated health endpoint is worth spending quota on: the only
    /// thing checked is that a key is configured at all.
    pub async fn health_probe(&self, _deadline: Duration) -> HealthState {
        if self.api_key.is_empty() {
            HealthState::Unhealthy("no api key configured".to_string())
        } else {
            HealthState::Healthy
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
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer) -> ModelEntry {
        ModelEntry {
            id: "gemini".to_string(),
            provider_kind: crate::config::ProviderKind::Google,
            endpoint: Some(server.uri()),
            model_name: Some("gemini-1.5-flash".to_string()),
            model_path: None,
            api_key: Some("test-key".to_string()),
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        }
    }

    #[tokio::test]
    async fn generate_parses_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 1 },
            })))
            .mount(&server)
            .await;

        let adapter = GoogleAdapter::build(&entry_for(&server), 1).unwrap();
        let out = adapter
            .generate("hello", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(out.text, "hi");
        assert_eq!(out.tokens_in, Some(3));
    }

    #[tokio::test]
    async fn generate_rejects_empty_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let adapter = GoogleAdapter::build(&entry_for(&server), 1).unwrap();
        let err = adapter
            .generate("hello", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn health_probe_checks_key_presence_without_a_network_call() {
        let server = MockServer::start().await;
        // No mock mounted at all: a probe that made a real HTTP call would
        // get back wiremock's default 404, not Healthy.
        let adapter = GoogleAdapter::build(&entry_for(&server), 1).unwrap();
        let state = adapter.health_probe(Duration::from_secs(5)).await;
        assert_eq!(state, HealthState::Healthy);
    }
}
