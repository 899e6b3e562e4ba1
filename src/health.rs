//! Health Prober: keeps a time-bounded cache of per-model
//! health so the Fallback Executor can skip a model it already knows is
//! down without paying for a fresh probe on every request.
//!
//! Concurrent probing is capped with `buffer_unordered` rather than a
//! semaphore crate — the fan-out here is bounded and short-lived, so a
//! stream adaptor is enough.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::backends::HealthState;
use crate::fallback::{Outcome, SkipPolicy};
use crate::registry::AdapterMap;

/// Lifecycle state of the process hosting this fabric. Reported by the
/// host via a [`ServiceStateProvider`]; `probe_all` trusts it rather than
/// inferring it from anything it can observe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Host-implemented accessor so [`HealthProber::probe_all`] can short-
/// circuit without making any network calls while the owning service
/// isn't `Running` — an "all green" health report from a stopped service
/// would be actively misleading.
pub trait ServiceStateProvider: Send + Sync {
    fn current_state(&self) -> ServiceState;
}

/// Reports `Running` unconditionally. The default a host that has no
/// lifecycle state of its own to report can use.
pub struct AlwaysRunning;

impl ServiceStateProvider for AlwaysRunning {
    fn current_state(&self) -> ServiceState {
        ServiceState::Running
    }
}

struct CacheEntry {
    state: HealthState,
    checked_at: Instant,
}

/// TTL cache over per-model [`HealthState`]. A cache miss (never probed,
/// or probed longer ago than `ttl`) is treated as "unknown" rather than
/// "unhealthy" — a model that has simply never been checked yet should
/// not be skipped.
pub struct HealthCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get_fresh(&self, model_id: &str) -> Option<HealthState> {
        self.entries.get(model_id).and_then(|entry| {
            if entry.checked_at.elapsed() < self.ttl {
                Some(entry.state.clone())
            } else {
                None
            }
        })
    }

    pub fn set(&self, model_id: &str, state: HealthState) {
        self.entries.insert(
            model_id.to_string(),
            CacheEntry {
                state,
                checked_at: Instant::now(),
            },
        );
    }
}

/// Probes adapters and keeps their results in a [`HealthCache`].
pub struct HealthProber {
    cache: HealthCache,
    max_concurrency: usize,
    probe_deadline: Duration,
}

impl HealthProber {
    pub fn new(ttl: Duration, max_concurrency: usize, probe_deadline: Duration) -> Self {
        Self {
            cache: HealthCache::new(ttl),
            max_concurrency: max_concurrency.max(1),
            probe_deadline,
        }
    }

    /// Cached state only — never blocks on a network call. Used by the
    /// skip policy so a request's latency never depends on a live probe.
    pub fn cached_state(&self, model_id: &str) -> Option<HealthState> {
        self.cache.get_fresh(model_id)
    }

    /// Probes every adapter in `adapters` concurrently (bounded by
    /// `max_concurrency`) and refreshes the cache with the results. When
    /// `state_provider` reports anything other than `Running`, this
    /// short-circuits to an unhealthy result naming the service state for
    /// every model without making a single network call.
    pub async fn probe_all(
        &self,
        adapters: &AdapterMap,
        state_provider: &dyn ServiceStateProvider,
    ) -> Vec<(String, HealthState)> {
        let state = state_provider.current_state();
        if state != ServiceState::Running {
            return adapters
                .keys()
                .map(|id| (id.clone(), HealthState::Unhealthy(format!("service state: {state}"))))
                .collect();
        }

        let results: Vec<(String, HealthState)> = stream::iter(adapters.iter())
            .map(|(id, adapter)| {
                let id = id.clone();
                let adapter = Arc::clone(adapter);
                let deadline = self.probe_deadline;
                async move {
                    let state = adapter.health_probe(deadline).await;
                    (id, state)
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (id, state) in &results {
            self.cache.set(id, state.clone());
        }
        results
    }

    /// Probes a single model on demand and refreshes its cache entry.
    pub async fn probe_one(&self, model_id: &str, adapter: &crate::backends::ProviderAdapter) -> HealthState {
        let state = adapter.health_probe(self.probe_deadline).await;
        self.cache.set(model_id, state.clone());
        state
    }
}

/// Skip policy backed by the Health Prober's cache: a model cached as
/// unhealthy is skipped; anything else (healthy, degraded, or never
/// probed) proceeds.
pub struct HealthSkipPolicy<'a> {
    prober: &'a HealthProber,
}

impl<'a> HealthSkipPolicy<'a> {
    pub fn new(prober: &'a HealthProber) -> Self {
        Self { prober }
    }
}

impl<'a> SkipPolicy for HealthSkipPolicy<'a> {
    fn should_skip(&self, model_id: &str) -> Option<Outcome> {
        match self.prober.cached_state(model_id) {
            Some(state) if !state.is_usable() => Some(Outcome::SkippedUnhealthy),
            _ => None,
        }
    }
}
