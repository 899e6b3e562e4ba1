//! In-process `llama.cpp` adapter (the `embedded-llama` feature). Unlike
//! every other adapter this one never touches the network — it loads a
//! GGUF file directly into this process via `llama-cpp-2` and runs
//! inference on a blocking thread.
//!
//! The model is loaded lazily on first use, not at construction, so
//! registry build stays cheap even when a chain lists an embedded model
//! that never ends up called.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use crate::config::ModelEntry;
use crate::error::AdapterError;

use super::{GenerateOutput, GenerateParams, HealthState};

const DEFAULT_N_CTX: u32 = 4096;
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_TEMPERATURE: f32 = 0.7;

struct LoadedModel {
    backend: LlamaBackend,
    model: LlamaModel,
}

// Safety: LlamaBackend/LlamaModel are not Send/Sync by default in some
// llama-cpp-2 versions because of raw pointers into the C++ side; we only
// ever touch them from the single blocking thread that holds the Arc for
// the duration of one generation call, serialized behind `loaded`'s lock
// during the load itself.
unsafe impl Send for LoadedModel {}
unsafe impl Sync for LoadedModel {}

pub struct LlamaCppEmbeddedAdapter {
    pub(crate) model_id: String,
    model_path: PathBuf,
    n_ctx: u32,
    n_threads: i32,
    n_gpu_layers: u32,
    min_chars: usize,
    loaded: Arc<RwLock<Option<Arc<LoadedModel>>>>,
}

impl LlamaCppEmbeddedAdapter {
    pub fn build(entry: &ModelEntry, min_chars: usize) -> Result<Self, String> {
        let model_path = entry
            .model_path
            .clone()
            .ok_or("llamacpp-embedded requires `model_path`")?;
        if !model_path.exists() {
            return Err(format!("model file not found: {}", model_path.display()));
        }

        let n_ctx = entry
            .parameters
            .get("n_ctx")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_N_CTX);
        let n_gpu_layers = entry
            .parameters
            .get("n_gpu_layers")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(0);
        let n_threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32 - 1)
            .unwrap_or(4)
            .max(1);

        Ok(Self {
            model_id: entry.id.clone(),
            model_path,
            n_ctx,
            n_threads,
            n_gpu_layers,
            min_chars,
            loaded: Arc::new(RwLock::new(None)),
        })
    }

    /// Loads the backend and GGUF weights on first use, off the async
    /// executor thread: a multi-second GGUF load run inline here would
    /// stall every other task on the same tokio worker. Failures are
    /// accumulated with `anyhow::Context` on the way out since loading
    /// spans several distinct steps (backend init, file load) that each
    /// need their own explanation in the final message; the caller only
    /// sees the flattened string, matching every other adapter's
    /// `build`/`generate` error contract.
    async fn ensure_loaded(&self) -> Result<Arc<LoadedModel>, String> {
        if let Some(existing) = self.loaded.read().unwrap().clone() {
            return Ok(existing);
        }

        let loaded_lock = Arc::clone(&self.loaded);
        let model_path = self.model_path.clone();
        let n_gpu_layers = self.n_gpu_layers;

        let join_result = tokio::task::spawn_blocking(move || {
            let mut guard = loaded_lock.write().unwrap();
            if let Some(existing) = guard.clone() {
                return Ok(existing);
            }
            let loaded = load_model(&model_path, n_gpu_layers).map_err(|e| format!("{e:#}"))?;
            *guard = Some(Arc::clone(&loaded));
            Ok(loaded)
        })
        .await;

        match join_result {
            Ok(result) => result,
            Err(join_err) => Err(format!("model load task panicked: {join_err}")),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<GenerateOutput, AdapterError> {
        let model_id = self.model_id.clone();
        let full_prompt = match &params.system_prompt {
            Some(system) => format!("{system}\n\n{prompt}"),
            None => prompt.to_string(),
        };
        let max_tokens = params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let temperature = params.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let n_ctx = self.n_ctx;
        let n_threads = self.n_threads;
        let min_chars = self.min_chars;

        let loaded = self
            .ensure_loaded()
            .await
            .map_err(|detail| AdapterError::Protocol {
                model_id: model_id.clone(),
                detail,
            })?;

        let join_result = tokio::task::spawn_blocking(move || {
            run_generation(&loaded, &full_prompt, max_tokens, temperature, n_ctx, n_threads, min_chars)
        })
        .await;

        match join_result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(detail)) => Err(AdapterError::Protocol { model_id, detail }),
            Err(join_err) => Err(AdapterError::Protocol {
                model_id,
                detail: format!("generation task panicked: {join_err}"),
            }),
        }
    }

    /// `ensure_loaded` has no caller-supplied timeout of its own (unlike
    /// `generate`, which rides the Fallback Executor's per-attempt
    /// deadline), so this is the one call site that has to enforce
    /// `deadline` itself.
    pub async fn health_probe(&self, deadline: Duration) -> HealthState {
        if !self.model_path.exists() {
            return HealthState::Unhealthy(format!("model file missing: {}", self.model_path.display()));
        }
        match tokio::time::timeout(deadline, self.ensure_loaded()).await {
            Ok(Ok(_)) => HealthState::Healthy,
            Ok(Err(detail)) => HealthState::Unhealthy(detail),
            Err(_) => HealthState::Unhealthy("probe timed out".to_string()),
        }
    }
}

fn load_model(model_path: &std::path::Path, n_gpu_layers: u32) -> anyhow::Result<Arc<LoadedModel>> {
    use anyhow::Context;

    let backend = LlamaBackend::init().context("initializing llama.cpp backend")?;
    let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
    let model = LlamaModel::load_from_file(&backend, model_path, &model_params)
        .with_context(|| format!("loading model from {}", model_path.display()))?;

    Ok(Arc::new(LoadedModel { backend, model }))
}

fn run_generation(
    loaded: &LoadedModel,
    prompt: &str,
    max_tokens: u32,
    temperature: f32,
    n_ctx: u32,
    n_threads: i32,
    min_chars: usize,
) -> Result<GenerateOutput, String> {
    let model = &loaded.model;
    let backend = &loaded.backend;

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_threads(n_threads)
        .with_n_threads_batch(n_threads);
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("creating context: {e}"))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| format!("tokenizing prompt: {e}"))?;
    let tokens_in = tokens.len() as u32;

    let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
    for (pos, token) in tokens.iter().enumerate() {
        let is_last = pos == tokens.len() - 1;
        batch
            .add(*token, pos as i32, &[0], is_last)
            .map_err(|e| format!("queuing prompt token: {e}"))?;
    }
    ctx.decode(&mut batch).map_err(|e| format!("decoding prompt: {e}"))?;

    let mut sampler = if temperature > 0.0 {
        LlamaSampler::chain_simple(vec![
            LlamaSampler::temp(temperature),
            LlamaSampler::top_p(0.9, 1),
            LlamaSampler::top_k(40),
            LlamaSampler::dist(42),
        ])
    } else {
        LlamaSampler::chain_simple(vec![LlamaSampler::greedy()])
    };

    let eos = model.token_eos();
    let mut output_tokens = Vec::new();
    let mut pos = tokens.len() as i32;

    for _ in 0..max_tokens {
        let token = sampler.sample(&ctx, -1);
        if token == eos {
            break;
        }
        sampler.accept(token);
        output_tokens.push(token);

        batch.clear();
        batch
            .add(token, pos, &[0], true)
            .map_err(|e| format!("queuing generated token: {e}"))?;
        ctx.decode(&mut batch).map_err(|e| format!("decoding generated token: {e}"))?;
        pos += 1;
    }

    let text = model
        .tokens_to_str(&output_tokens, Special::Plaintext)
        .map_err(|e| format!("detokenizing output: {e}"))?;
    if text.chars().count() < min_chars {
        return Err("model produced no output tokens".to_string());
    }

    Ok(GenerateOutput {
        text,
        tokens_in: Some(tokens_in),
        tokens_out: Some(output_tokens.len() as u32),
    })
}
