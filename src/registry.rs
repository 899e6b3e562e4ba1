//! Model Registry: builds a [`ProviderAdapter`] for every
//! configured model up front, so a bad credential or missing GGUF file is
//! caught at build time rather than on the first request that needs it.
//!
//! On reload the whole map is rebuilt and then swapped in under a write
//! lock — in-flight requests keep using the `Arc` snapshot they already
//! hold, they never see a half-rebuilt map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::backends::ProviderAdapter;
use crate::config::SystemConfig;
use crate::error::FabricError;

pub type AdapterMap = HashMap<String, Arc<ProviderAdapter>>;

pub struct ModelRegistry {
    adapters: RwLock<Arc<AdapterMap>>,
}

impl ModelRegistry {
    /// Builds every adapter named in `config.models`. Fails fast: the
    /// first model that can't be constructed aborts the whole build.
    pub fn build(config: &SystemConfig) -> Result<Self, FabricError> {
        let map = build_adapter_map(config)?;
        Ok(Self {
            adapters: RwLock::new(Arc::new(map)),
        })
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<ProviderAdapter>> {
        self.adapters.read().unwrap().get(model_id).cloned()
    }

    pub fn snapshot(&self) -> Arc<AdapterMap> {
        Arc::clone(&self.adapters.read().unwrap())
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.adapters.read().unwrap().keys().cloned().collect()
    }

    /// Rebuilds the adapter map from `config` and swaps it in on success.
    /// A failure here (e.g. a newly-added model with an unresolvable
    /// credential) is logged and the previous, still-good map is kept —
    /// a bad mutation never takes down an already-running fabric.
    pub fn rebuild_or_log(&self, config: &SystemConfig) {
        match build_adapter_map(config) {
            Ok(map) => {
                *self.adapters.write().unwrap() = Arc::new(map);
            }
            Err(err) => {
                error!(error = %err, "model registry rebuild failed, keeping previous adapter map");
            }
        }
    }
}

fn build_adapter_map(config: &SystemConfig) -> Result<AdapterMap, FabricError> {
    let mut map = HashMap::with_capacity(config.models.len());
    for (id, entry) in &config.models {
        let adapter = ProviderAdapter::build(entry, config.system.min_chars).map_err(|reason| FabricError::AdapterBuild {
            model_id: id.clone(),
            reason,
        })?;
        map.insert(id.clone(), Arc::new(adapter));
    }
    Ok(map)
}
