//! Closed-set error types for the fabric.
//!
//! Every fallible boundary in this crate returns one of the enums below
//! instead of an opaque error type — callers match on a stable kind rather
//! than parsing a message string. `anyhow::Context` is used internally
//! where a single String-returning boundary (an adapter's `build`, the
//! embedded llama.cpp loader) spans several steps worth separately
//! explaining; it never crosses the boundary as `anyhow::Error` itself.

use std::path::PathBuf;

use thiserror::Error;

use crate::fallback::Attempt;

/// Config load/validate/save failures. No partial state is ever exposed on
/// an `Err` — callers either get a fully-validated `SystemConfig` or this.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config at {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Role Resolver failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("role `{0}` is not a canonical role or a recognised synonym")]
    Unknown(String),
    #[error("required role `{0}` is absent from configuration")]
    Missing(String),
}

/// One provider-call failure kind. Never thrown across the adapter boundary —
/// always captured into `Attempt::error_kind` by the Fallback Executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("network error calling {model_id}: {detail}")]
    Network { model_id: String, detail: String },
    #[error("timeout calling {model_id}")]
    Timeout { model_id: String },
    #[error("{model_id} returned HTTP {code}")]
    HttpStatus { model_id: String, code: u16 },
    #[error("protocol error from {model_id}: {detail}")]
    Protocol { model_id: String, detail: String },
    #[error("{model_id} returned an empty response")]
    EmptyResponse { model_id: String },
    #[error("authentication failure for {model_id}")]
    Auth { model_id: String },
    #[error("cancelled during call to {model_id}")]
    Cancelled { model_id: String },
}

impl AdapterError {
    pub fn model_id(&self) -> &str {
        match self {
            Self::Network { model_id, .. }
            | Self::Timeout { model_id }
            | Self::HttpStatus { model_id, .. }
            | Self::Protocol { model_id, .. }
            | Self::EmptyResponse { model_id }
            | Self::Auth { model_id }
            | Self::Cancelled { model_id } => model_id,
        }
    }

    /// Stable string form stored in `Attempt::error_kind`.
    pub fn kind_str(&self) -> String {
        match self {
            Self::Network { detail, .. } => format!("network:{detail}"),
            Self::Timeout { .. } => "timeout".to_string(),
            Self::HttpStatus { code, .. } => format!("http_status:{code}"),
            Self::Protocol { detail, .. } => format!("protocol:{detail}"),
            Self::EmptyResponse { .. } => "empty_response".to_string(),
            Self::Auth { .. } => "auth".to_string(),
            Self::Cancelled { .. } => "cancelled".to_string(),
        }
    }
}

/// Asset Registry failures.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset file does not exist: {0}")]
    NotFound(PathBuf),
    #[error("reading asset registry: {0}")]
    Io(#[source] std::io::Error),
    #[error("parsing asset registry: {0}")]
    Parse(#[source] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top-level error returned from `Fabric::execute` and friends.
///
/// This is the closed set of top-level failures. Adapter-level failures never
/// appear here directly — they are folded into `AllFailed(attempts)`.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error("could not build adapter for model `{model_id}`: {reason}")]
    AdapterBuild { model_id: String, reason: String },

    #[error("all models in the `{stage}` chain failed ({} attempts)", attempts.len())]
    AllFailed { stage: String, attempts: Vec<Attempt> },

    #[error("cancelled during `{stage}`")]
    Cancelled { stage: String },

    #[error("privacy policy eliminated every model in the `{stage}` chain")]
    PiiNoViableModel { stage: String },

    #[error(transparent)]
    Asset(#[from] AssetError),
}
