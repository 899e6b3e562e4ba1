//! Asset Registry: tracks GGUF files that have been downloaded
//! into a local models directory, persisting entries to `models.json`
//! alongside the directory using the same atomic-write protocol as the
//! Configuration Store.
//!
//! `register()` also hands a matching `ModelEntry` to the Configuration
//! Store so the file becomes usable as a `llamacpp-embedded` model, but it
//! never touches role chains — wiring a registered asset into a role is
//! left to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigHandle, ModelEntry, ProviderKind};
use crate::error::AssetError;

/// One locally downloaded model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEntry {
    pub repo: String,
    pub filename: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub registered_at: DateTime<Utc>,
    pub tags: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: Vec<AssetEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }
}

/// Persists `AssetEntry` rows to `<models_dir>/models.json`. `filename` is
/// the idempotency key: registering the same filename twice replaces the
/// existing row rather than duplicating it.
pub struct AssetRegistry {
    models_dir: PathBuf,
    registry_path: PathBuf,
    entries: Mutex<Vec<AssetEntry>>,
}

impl AssetRegistry {
    /// Loads `<models_dir>/models.json` if present, or starts empty. Does
    /// not create `models_dir` itself — callers are expected to have
    /// provisioned it already.
    pub fn load(models_dir: impl Into<PathBuf>) -> Result<Self, AssetError> {
        let models_dir = models_dir.into();
        let registry_path = models_dir.join("models.json");

        let entries = if registry_path.exists() {
            let raw = std::fs::read_to_string(&registry_path).map_err(AssetError::Io)?;
            let file: RegistryFile = serde_json::from_str(&raw).map_err(AssetError::Parse)?;
            file.entries
        } else {
            Vec::new()
        };

        Ok(Self {
            models_dir,
            registry_path,
            entries: Mutex::new(entries),
        })
    }

    pub fn list(&self) -> Vec<AssetEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Verifies `path` exists, computes its size, and upserts an
    /// `AssetEntry` keyed on filename. Also adds a corresponding
    /// `llamacpp-embedded` `ModelEntry` to `config` (left unsaved — the
    /// caller decides when to persist the config change).
    pub fn register(
        &self,
        path: &Path,
        repo: impl Into<String>,
        tags: HashSet<String>,
        id: Option<String>,
        config: &ConfigHandle,
    ) -> Result<AssetEntry, AssetError> {
        let metadata = std::fs::metadata(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AssetError::NotFound(path.to_path_buf())
            } else {
                AssetError::Io(source)
            }
        })?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AssetError::NotFound(path.to_path_buf()))?;

        let entry = AssetEntry {
            repo: repo.into(),
            filename: filename.clone(),
            absolute_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            registered_at: Utc::now(),
            tags: tags.clone(),
        };

        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|e| e.filename != filename);
            entries.push(entry.clone());
            self.persist(&entries)?;
        }

        let model_id = id.unwrap_or_else(|| filename.clone());
        config.set_model(
            model_id,
            ModelEntry {
                id: String::new(),
                provider_kind: ProviderKind::LlamaCppEmbedded,
                endpoint: None,
                model_name: None,
                model_path: Some(path.to_path_buf()),
                api_key: None,
                api_key_env: None,
                tags,
                parameters: std::collections::HashMap::new(),
                locality: None,
            },
        );

        Ok(entry)
    }

    /// Removes the entry for `filename`. When `keep_file` is `false`, also
    /// deletes the underlying file from disk.
    pub fn remove(&self, filename: &str, keep_file: bool) -> Result<(), AssetError> {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            let removed_path = entries
                .iter()
                .find(|e| e.filename == filename)
                .map(|e| e.absolute_path.clone());
            entries.retain(|e| e.filename != filename);
            self.persist(&entries)?;
            (before != entries.len(), removed_path)
        };

        if !keep_file {
            if let (true, Some(path)) = removed {
                if path.exists() {
                    std::fs::remove_file(path).map_err(AssetError::Io)?;
                }
            }
        }

        Ok(())
    }

    fn persist(&self, entries: &[AssetEntry]) -> Result<(), AssetError> {
        let file = RegistryFile {
            version: 1,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(AssetError::Parse)?;
        crate::util::atomic_write(&self.registry_path, &json).map_err(AssetError::Io)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}
