//! `aura_fabric`: the routing core for AuraRouter.
//!
//! A caller loads a [`config::ConfigHandle`], hands it to [`Fabric::new`],
//! and from then on only talks to [`Fabric::execute`], [`Fabric::health`]
//! and [`Fabric::register_asset`]. Everything in between — classifying the
//! request, planning it into steps, resolving roles to model chains,
//! walking each chain with privacy/health/budget skip rules, probing
//! provider health, and persisting config or asset changes — is owned by
//! the modules this crate re-exports.
//!
//! This crate has no binary and opens no network listener of its own; it
//! is a library embedded by a host process (CLI, service, desktop app).
//! The host owns process lifecycle, its own transport, and initializing
//! `tracing_subscriber` — this crate only emits `tracing` events under the
//! `aura_fabric` target.

pub mod assets;
pub mod backends;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod pipeline;
pub mod registry;
pub mod role;
pub mod privacy;
mod util;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use assets::{AssetEntry, AssetRegistry};
use backends::HealthState;
use config::ConfigHandle;
use error::{AssetError, FabricError};
use health::{AlwaysRunning, HealthProber, ServiceStateProvider};
use pipeline::{ExecutionResult, PipelineOrchestrator, RequestBudget};
use privacy::PrivacyAuditorConfig;
use registry::ModelRegistry;

/// Environment variable naming an override config path, consulted before
/// the default `~/.auracore/aurarouter/auraconfig.yaml`.
pub const CONFIG_PATH_ENV: &str = "AURACORE_ROUTER_CONFIG";

fn default_config_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".auracore")
        .join("aurarouter")
        .join("auraconfig.yaml")
}

/// Loads config from, in priority order: `path`, `AURACORE_ROUTER_CONFIG`,
/// then the default `~/.auracore/aurarouter/auraconfig.yaml`.
pub fn load_config(
    path: Option<&Path>,
    manifest_overlay: Option<serde_json::Value>,
) -> Result<ConfigHandle, error::ConfigError> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => match std::env::var_os(CONFIG_PATH_ENV) {
            Some(p) => std::path::PathBuf::from(p),
            None => default_config_path(),
        },
    };
    ConfigHandle::load(resolved, manifest_overlay)
}

/// The top-level handle a host collaborator embeds: ties the Configuration
/// Store, Model Registry, Health Prober and Pipeline Orchestrator together
/// and keeps the registry in sync with every successful config save.
pub struct Fabric {
    config: ConfigHandle,
    registry: Arc<ModelRegistry>,
    health: Arc<HealthProber>,
    orchestrator: PipelineOrchestrator,
    assets: Option<AssetRegistry>,
    service_state: Arc<dyn ServiceStateProvider>,
}

impl Fabric {
    /// Builds the registry from `config`'s current snapshot (fail-fast)
    /// and wires a reload callback so future `save()` calls rebuild it in
    /// place (fail-soft).
    pub fn new(config: ConfigHandle) -> Result<Self, FabricError> {
        let snapshot = config.current();
        let registry = Arc::new(ModelRegistry::build(&snapshot)?);

        let health = Arc::new(HealthProber::new(
            Duration::from_secs(snapshot.system.health_cache_ttl_seconds),
            snapshot.system.health_max_concurrency,
            Duration::from_secs(snapshot.system.health_probe_deadline_seconds),
        ));

        let reload_registry = Arc::clone(&registry);
        config.on_reload(move |new_config| {
            reload_registry.rebuild_or_log(&new_config);
        });

        let orchestrator = PipelineOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            PrivacyAuditorConfig::default(),
        );

        Ok(Self {
            config,
            registry,
            health,
            orchestrator,
            assets: None,
            service_state: Arc::new(AlwaysRunning),
        })
    }

    /// Reports health probes as unconditionally unhealthy (naming the
    /// service state) instead of calling out to providers, for as long as
    /// `provider` reports anything other than [`health::ServiceState::Running`].
    /// Defaults to [`AlwaysRunning`] if never called.
    pub fn with_service_state(mut self, provider: Arc<dyn ServiceStateProvider>) -> Self {
        self.service_state = provider;
        self
    }

    /// Attaches an [`AssetRegistry`] rooted at `models_dir`, enabling
    /// [`Fabric::register_asset`]. Not required for `execute`/`health`.
    pub fn with_assets(mut self, models_dir: impl Into<std::path::PathBuf>) -> Result<Self, AssetError> {
        self.assets = Some(AssetRegistry::load(models_dir)?);
        Ok(self)
    }

    /// Runs `task` through the pipeline. Pass `"router"` to let the
    /// classifier pick a role, or a known non-router role to run `task` as
    /// a single direct step under that role.
    pub async fn execute(
        &self,
        role: &str,
        task: &str,
        context: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, FabricError> {
        let config = self.config.current();
        let budget = RequestBudget::unbounded();
        let prompt = match context {
            Some(ctx) if !ctx.is_empty() => format!("{ctx}\n\n{task}"),
            _ => task.to_string(),
        };

        info!(role, "fabric execute");
        self.orchestrator
            .run(&prompt, Some(role), &config, &budget, &cancel)
            .await
    }

    /// Probes every configured model concurrently and returns the refreshed
    /// health snapshot. Short-circuits to an unhealthy result for every
    /// model, without any network calls, while the configured
    /// [`health::ServiceStateProvider`] reports anything other than
    /// `Running`.
    pub async fn health(&self) -> HashMap<String, HealthState> {
        let snapshot = self.registry.snapshot();
        self.health
            .probe_all(&snapshot, self.service_state.as_ref())
            .await
            .into_iter()
            .collect()
    }

    /// Registers a newly downloaded GGUF asset and a matching
    /// `llamacpp-embedded` model entry, saving the config so the model is
    /// immediately usable. Requires [`Fabric::with_assets`] to have been
    /// called first.
    pub async fn register_asset(
        &self,
        path: &Path,
        repo: &str,
        tags: Vec<String>,
        id: Option<String>,
    ) -> Result<AssetEntry, AssetError> {
        let assets = self
            .assets
            .as_ref()
            .ok_or_else(|| AssetError::NotFound(path.to_path_buf()))?;

        let entry = assets.register(
            path,
            repo,
            tags.into_iter().collect(),
            id,
            &self.config,
        )?;
        self.config.save()?;
        Ok(entry)
    }

    /// Direct access to the Configuration Store for mutation/reload flows
    /// a host wants to drive itself (e.g. a settings UI).
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }
}
