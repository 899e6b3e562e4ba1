//! Configuration Store: loads `auraconfig.yaml`, applies the
//! defaults → file → manifest-overlay → environment precedence chain,
//! validates the result, and holds it behind a lock-free-read snapshot so
//! in-flight requests never observe a half-applied reload.
//!
//! Reload and mutation both go through [`ConfigHandle::save`], which is the
//! only path that ever touches disk or swaps the live snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "AURAROUTER_";
const REQUIRED_ROLES: [&str; 3] = ["router", "reasoning", "coding"];

/// Which backend wire protocol a model entry speaks. The set of required
/// fields per kind is enforced by [`ModelEntry::validate_shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    #[serde(rename = "llamacpp-http")]
    LlamaCppHttp,
    #[serde(rename = "llamacpp-embedded")]
    LlamaCppEmbedded,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    Google,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::LlamaCppHttp => "llamacpp-http",
            Self::LlamaCppEmbedded => "llamacpp-embedded",
            Self::OpenAiCompatible => "openai-compatible",
            Self::Google => "google",
            Self::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a model actually runs. Drives the Privacy Auditor's cloud/local
/// split when a chain must be narrowed for a privacy-flagged prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    Cloud,
}

/// One entry in `models:`. `id` is filled in from the map key during load
/// so a `ModelEntry` handed out on its own (e.g. by the registry) is still
/// self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub id: String,
    pub provider_kind: ProviderKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub locality: Option<Locality>,
}

impl ModelEntry {
    /// `true` once the `private` tag is set — the Privacy Auditor treats
    /// this as an affirmative "never send flagged prompts elsewhere" mark,
    /// not a locality computation.
    pub fn is_private(&self) -> bool {
        self.tags.contains("private")
    }

    /// An explicit `locality:` wins, otherwise
    /// a loopback/unix-socket endpoint implies `local`, embedded llama.cpp
    /// is always `local`, and everything else defaults to `cloud`.
    pub fn resolved_locality(&self) -> Locality {
        if let Some(l) = self.locality {
            return l;
        }
        if let Some(endpoint) = &self.endpoint {
            return if is_loopback_endpoint(endpoint) {
                Locality::Local
            } else {
                Locality::Cloud
            };
        }
        match self.provider_kind {
            ProviderKind::LlamaCppEmbedded => Locality::Local,
            _ => Locality::Cloud,
        }
    }

    /// Resolves the credential to use for this model: an inline `api_key`
    /// wins, then `api_key_env`, then the provider's conventional
    /// environment variable. Empty strings are treated as absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        let conventional = match self.provider_kind {
            ProviderKind::Google => Some("GOOGLE_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            _ => None,
        };
        conventional
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }

    /// Static per-kind required-field check, minus the parts — credential
    /// resolvability — that need I/O and belong to registry build instead.
    pub fn validate_shape(&self) -> Result<(), String> {
        match self.provider_kind {
            ProviderKind::Ollama | ProviderKind::OpenAiCompatible => {
                if self.endpoint.is_none() {
                    return Err(format!(
                        "model `{}`: provider_kind {} requires `endpoint`",
                        self.id, self.provider_kind
                    ));
                }
                if self.model_name.is_none() {
                    return Err(format!(
                        "model `{}`: provider_kind {} requires `model_name`",
                        self.id, self.provider_kind
                    ));
                }
            }
            ProviderKind::LlamaCppHttp => {
                if self.endpoint.is_none() {
                    return Err(format!(
                        "model `{}`: provider_kind llamacpp-http requires `endpoint`",
                        self.id
                    ));
                }
            }
            ProviderKind::LlamaCppEmbedded => {
                if self.model_path.is_none() {
                    return Err(format!(
                        "model `{}`: provider_kind llamacpp-embedded requires `model_path`",
                        self.id
                    ));
                }
            }
            ProviderKind::Google | ProviderKind::Anthropic => {
                if self.model_name.is_none() {
                    return Err(format!(
                        "model `{}`: provider_kind {} requires `model_name`",
                        self.id, self.provider_kind
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_loopback_endpoint(endpoint: &str) -> bool {
    let lower = endpoint.to_lowercase();
    lower.contains("localhost") || lower.contains("127.0.0.1") || lower.contains("::1") || lower.starts_with("unix://")
}

/// An ordered, duplicate-free list of model ids for one role. Accepts
/// either the flat list form or the legacy `{ models: [...] }` nested
/// form on read; always serializes back out flat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoleChain(pub Vec<String>);

impl RoleChain {
    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn has_duplicates(&self) -> bool {
        let unique: HashSet<&String> = self.0.iter().collect();
        unique.len() != self.0.len()
    }
}

impl<'de> Deserialize<'de> for RoleChain {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Flat(Vec<String>),
            Nested { models: Vec<String> },
        }
        let shape = Shape::deserialize(deserializer)?;
        Ok(RoleChain(match shape {
            Shape::Flat(ids) => ids,
            Shape::Nested { models } => models,
        }))
    }
}

/// Ambient knobs that aren't per-model but still need to live somewhere
/// other than hardcoded constants: timeouts, health-cache tuning, planner
/// guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "defaults::health_cache_ttl_seconds")]
    pub health_cache_ttl_seconds: u64,
    #[serde(default = "defaults::health_probe_deadline_seconds")]
    pub health_probe_deadline_seconds: u64,
    #[serde(default = "defaults::health_max_concurrency")]
    pub health_max_concurrency: usize,
    #[serde(default = "defaults::max_plan_steps")]
    pub max_plan_steps: usize,
    #[serde(default = "defaults::min_chars")]
    pub min_chars: usize,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            default_timeout_seconds: defaults::default_timeout_seconds(),
            health_cache_ttl_seconds: defaults::health_cache_ttl_seconds(),
            health_probe_deadline_seconds: defaults::health_probe_deadline_seconds(),
            health_max_concurrency: defaults::health_max_concurrency(),
            max_plan_steps: defaults::max_plan_steps(),
            min_chars: defaults::min_chars(),
        }
    }
}

mod defaults {
    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn default_timeout_seconds() -> u64 {
        30
    }
    pub fn health_cache_ttl_seconds() -> u64 {
        30
    }
    pub fn health_probe_deadline_seconds() -> u64 {
        5
    }
    pub fn health_max_concurrency() -> usize {
        8
    }
    pub fn max_plan_steps() -> usize {
        12
    }
    pub fn min_chars() -> usize {
        1
    }
}

/// The whole of `auraconfig.yaml`, once loaded, merged and validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub system: SystemSettings,
    #[serde(default)]
    pub models: HashMap<String, ModelEntry>,
    #[serde(default)]
    pub roles: HashMap<String, RoleChain>,
    #[serde(default)]
    pub semantic_verbs: HashMap<String, HashSet<String>>,
}

impl SystemConfig {
    /// Fills each `ModelEntry::id` from its map key and guarantees the
    /// three canonical roles always have a `semantic_verbs` entry, even if
    /// config.yaml never mentions them.
    fn normalize(&mut self) {
        for (id, entry) in self.models.iter_mut() {
            entry.id = id.clone();
        }
        for role in REQUIRED_ROLES {
            self.semantic_verbs.entry(role.to_string()).or_default();
        }
    }

    /// Full static validation: every id in a chain must
    /// name a known model, the three required roles must be non-empty,
    /// chains must be duplicate-free, and each model's provider fields
    /// must match its kind.
    pub fn validate(&self) -> Result<(), String> {
        for entry in self.models.values() {
            entry.validate_shape()?;
        }

        for role in REQUIRED_ROLES {
            match self.roles.get(role) {
                Some(chain) if !chain.ids().is_empty() => {}
                _ => return Err(format!("required role `{role}` has no models configured")),
            }
        }

        for (role, chain) in &self.roles {
            if chain.has_duplicates() {
                return Err(format!("role `{role}` lists the same model more than once"));
            }
            for id in chain.ids() {
                if !self.models.contains_key(id) {
                    return Err(format!("role `{role}` references unknown model `{id}`"));
                }
            }
        }

        Ok(())
    }
}

fn merge_json(base: &mut Value, overlay: Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut *base, &overlay) {
        for (key, value) in overlay_map {
            match base_map.get_mut(key) {
                Some(existing) => merge_json(existing, value.clone()),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    *base = overlay;
}

fn parse_env_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_nested(root: &mut Value, path: &[String], value: Value) {
    if !root.is_object() {
        *root = serde_json::json!({});
    }
    let obj = root.as_object_mut().expect("just coerced to object");
    if path.len() == 1 {
        obj.insert(path[0].clone(), value);
        return;
    }
    let slot = obj
        .entry(path[0].clone())
        .or_insert_with(|| serde_json::json!({}));
    set_nested(slot, &path[1..], value);
}

/// Applies `AURAROUTER_FOO__BAR=1` style overrides on top of `base`.
/// `__` splits path segments, each segment is lowercased to match the YAML
/// key casing, and values are parsed as JSON scalars when possible so
/// `AURAROUTER_SYSTEM__DEFAULT_TIMEOUT_SECONDS=45` becomes a number, not
/// the string `"45"`.
fn apply_env_overrides(base: &mut Value) {
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let path: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
        if path.iter().any(|seg| seg.is_empty()) {
            continue;
        }
        set_nested(base, &path, parse_env_scalar(&value));
    }
}

/// Loads and validates a `SystemConfig` from `path`, applying the
/// defaults → file → manifest-overlay → environment precedence chain.
pub fn load_system_config(path: &Path, manifest_overlay: Option<Value>) -> Result<SystemConfig, ConfigError> {
    let mut merged =
        serde_json::to_value(SystemConfig::default()).expect("SystemConfig always serializes");

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file_value: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    merge_json(&mut merged, file_value);

    if let Some(overlay) = manifest_overlay {
        merge_json(&mut merged, overlay);
    }

    apply_env_overrides(&mut merged);

    let mut config: SystemConfig =
        serde_json::from_value(merged).map_err(|e| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    config.normalize();
    config
        .validate()
        .map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;

    Ok(config)
}

/// Live, swap-on-save view of the system config. Readers call
/// [`ConfigHandle::current`] and hold the returned `Arc` for the lifetime
/// of one request; a concurrent `save()` never mutates that snapshot out
/// from under them.
pub struct ConfigHandle {
    path: PathBuf,
    live: RwLock<Arc<SystemConfig>>,
    draft: Mutex<SystemConfig>,
    on_reload: Mutex<Vec<Box<dyn Fn(Arc<SystemConfig>) + Send + Sync>>>,
}

impl ConfigHandle {
    pub fn load(path: impl Into<PathBuf>, manifest_overlay: Option<Value>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = load_system_config(&path, manifest_overlay)?;
        Ok(Self {
            path,
            live: RwLock::new(Arc::new(config.clone())),
            draft: Mutex::new(config),
            on_reload: Mutex::new(Vec::new()),
        })
    }

    /// Registers a callback invoked with the new snapshot after every
    /// successful `save()`. The Model Registry uses this to rebuild its
    /// adapter map without the Configuration Store knowing it exists.
    pub fn on_reload(&self, callback: impl Fn(Arc<SystemConfig>) + Send + Sync + 'static) {
        self.on_reload.lock().unwrap().push(Box::new(callback));
    }

    pub fn current(&self) -> Arc<SystemConfig> {
        Arc::clone(&self.live.read().unwrap())
    }

    pub fn set_model(&self, id: impl Into<String>, entry: ModelEntry) {
        let id = id.into();
        let mut draft = self.draft.lock().unwrap();
        let mut entry = entry;
        entry.id = id.clone();
        draft.models.insert(id, entry);
    }

    pub fn remove_model(&self, id: &str) {
        self.draft.lock().unwrap().models.remove(id);
    }

    pub fn set_role_chain(&self, role: impl Into<String>, ids: Vec<String>) {
        self.draft
            .lock()
            .unwrap()
            .roles
            .insert(role.into(), RoleChain(ids));
    }

    pub fn set_semantic_verbs(&self, role: impl Into<String>, synonyms: HashSet<String>) {
        self.draft
            .lock()
            .unwrap()
            .semantic_verbs
            .insert(role.into(), synonyms);
    }

    /// Validates the staged draft, writes it to disk atomically, and — only
    /// once the write lands — swaps it in as the live snapshot and fires
    /// reload callbacks. On a validation failure the draft and the live
    /// snapshot are both left exactly as they were; there is no partial
    /// state a caller can observe.
    pub fn save(&self) -> Result<Arc<SystemConfig>, ConfigError> {
        let mut draft = self.draft.lock().unwrap().clone();
        draft.normalize();
        draft.validate().map_err(|reason| ConfigError::Invalid {
            path: self.path.clone(),
            reason,
        })?;

        let yaml = serde_yaml::to_string(&draft).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        crate::util::atomic_write(&self.path, yaml.as_bytes()).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        let snapshot = Arc::new(draft.clone());
        *self.live.write().unwrap() = Arc::clone(&snapshot);
        *self.draft.lock().unwrap() = draft;

        for callback in self.on_reload.lock().unwrap().iter() {
            callback(Arc::clone(&snapshot));
        }

        Ok(snapshot)
    }

    /// Re-reads the file from disk, discarding any unsaved draft mutations,
    /// and swaps it in on success. Used by the file-watch reload path.
    pub fn reload_from_disk(&self, manifest_overlay: Option<Value>) -> Result<Arc<SystemConfig>, ConfigError> {
        let config = load_system_config(&self.path, manifest_overlay)?;
        let snapshot = Arc::new(config.clone());
        *self.live.write().unwrap() = Arc::clone(&snapshot);
        *self.draft.lock().unwrap() = config;

        for callback in self.on_reload.lock().unwrap().iter() {
            callback(Arc::clone(&snapshot));
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_yaml(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("auraconfig.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
models:
  ollama-llama3:
    provider_kind: ollama
    endpoint: "http://localhost:11434"
    model_name: "llama3"
roles:
  router: ["ollama-llama3"]
  reasoning: ["ollama-llama3"]
  coding: ["ollama-llama3"]
"#;

    #[test]
    fn loads_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        let config = load_system_config(&path, None).unwrap();
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models["ollama-llama3"].id, "ollama-llama3");
        assert!(config.semantic_verbs.contains_key("router"));
    }

    #[test]
    fn missing_required_role_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            r#"
models:
  m1:
    provider_kind: ollama
    endpoint: "http://localhost:11434"
    model_name: "llama3"
roles:
  router: ["m1"]
"#,
        );
        let err = load_system_config(&path, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn chain_referencing_unknown_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            r#"
models:
  m1:
    provider_kind: ollama
    endpoint: "http://localhost:11434"
    model_name: "llama3"
roles:
  router: ["m1"]
  reasoning: ["does-not-exist"]
  coding: ["m1"]
"#,
        );
        let err = load_system_config(&path, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn provider_field_contradiction_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            r#"
models:
  m1:
    provider_kind: llamacpp-embedded
roles:
  router: ["m1"]
  reasoning: ["m1"]
  coding: ["m1"]
"#,
        );
        let err = load_system_config(&path, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn role_chain_accepts_legacy_nested_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            r#"
models:
  m1:
    provider_kind: ollama
    endpoint: "http://localhost:11434"
    model_name: "llama3"
roles:
  router:
    models: ["m1"]
  reasoning: ["m1"]
  coding: ["m1"]
"#,
        );
        let config = load_system_config(&path, None).unwrap();
        assert_eq!(config.roles["router"].ids(), &["m1".to_string()]);
    }

    #[test]
    fn manifest_overlay_applies_between_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        let overlay = serde_json::json!({ "system": { "log_level": "debug" } });
        let config = load_system_config(&path, Some(overlay)).unwrap();
        assert_eq!(config.system.log_level, "debug");
    }

    #[test]
    fn env_override_wins_over_file_and_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        std::env::set_var("AURAROUTER_SYSTEM__LOG_LEVEL", "trace");
        let overlay = serde_json::json!({ "system": { "log_level": "debug" } });
        let config = load_system_config(&path, Some(overlay)).unwrap();
        std::env::remove_var("AURAROUTER_SYSTEM__LOG_LEVEL");
        assert_eq!(config.system.log_level, "trace");
    }

    #[test]
    fn env_override_parses_numeric_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        std::env::set_var("AURAROUTER_SYSTEM__DEFAULT_TIMEOUT_SECONDS", "45");
        let config = load_system_config(&path, None).unwrap();
        std::env::remove_var("AURAROUTER_SYSTEM__DEFAULT_TIMEOUT_SECONDS");
        assert_eq!(config.system.default_timeout_seconds, 45);
    }

    #[test]
    fn handle_mutation_is_not_visible_until_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        let handle = ConfigHandle::load(&path, None).unwrap();

        handle.set_role_chain("router", vec!["ollama-llama3".to_string(), "ollama-llama3".to_string()]);
        assert_eq!(handle.current().roles["router"].ids().len(), 1);

        let err = handle.save().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert_eq!(handle.current().roles["router"].ids().len(), 1);
    }

    #[test]
    fn save_persists_and_notifies_reload_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, MINIMAL);
        let handle = ConfigHandle::load(&path, None).unwrap();

        let seen = Arc::new(Mutex::new(false));
        let seen_clone = Arc::clone(&seen);
        handle.on_reload(move |_| *seen_clone.lock().unwrap() = true);

        handle.set_model(
            "m2",
            ModelEntry {
                id: String::new(),
                provider_kind: ProviderKind::Ollama,
                endpoint: Some("http://localhost:11434".to_string()),
                model_name: Some("llama3".to_string()),
                model_path: None,
                api_key: None,
                api_key_env: None,
                tags: HashSet::new(),
                parameters: HashMap::new(),
                locality: None,
            },
        );
        handle.save().unwrap();

        assert!(*seen.lock().unwrap());
        let reloaded = load_system_config(&path, None).unwrap();
        assert!(reloaded.models.contains_key("m2"));
    }

    #[test]
    fn resolve_api_key_prefers_inline_then_env_then_convention() {
        let mut entry = ModelEntry {
            id: "gemini".to_string(),
            provider_kind: ProviderKind::Google,
            endpoint: None,
            model_name: Some("gemini-pro".to_string()),
            model_path: None,
            api_key: None,
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        };

        std::env::set_var("GOOGLE_API_KEY", "from-convention");
        assert_eq!(entry.resolve_api_key().as_deref(), Some("from-convention"));

        entry.api_key_env = Some("CUSTOM_GOOGLE_KEY".to_string());
        std::env::set_var("CUSTOM_GOOGLE_KEY", "from-env-var");
        assert_eq!(entry.resolve_api_key().as_deref(), Some("from-env-var"));

        entry.api_key = Some("inline-key".to_string());
        assert_eq!(entry.resolve_api_key().as_deref(), Some("inline-key"));

        std::env::remove_var("GOOGLE_API_KEY");
        std::env::remove_var("CUSTOM_GOOGLE_KEY");
    }

    #[test]
    fn resolved_locality_falls_back_to_endpoint_then_kind() {
        let cloud = ModelEntry {
            id: "m".to_string(),
            provider_kind: ProviderKind::OpenAiCompatible,
            endpoint: Some("https://api.example.com".to_string()),
            model_name: Some("gpt".to_string()),
            model_path: None,
            api_key: None,
            api_key_env: None,
            tags: HashSet::new(),
            parameters: HashMap::new(),
            locality: None,
        };
        assert_eq!(cloud.resolved_locality(), Locality::Cloud);

        let local = ModelEntry {
            endpoint: Some("http://localhost:8080".to_string()),
            ..cloud.clone()
        };
        assert_eq!(local.resolved_locality(), Locality::Local);

        let embedded = ModelEntry {
            provider_kind: ProviderKind::LlamaCppEmbedded,
            endpoint: None,
            model_path: Some(PathBuf::from("/models/m.gguf")),
            ..cloud
        };
        assert_eq!(embedded.resolved_locality(), Locality::Local);
    }
}
