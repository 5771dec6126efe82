//! Error types for manifest and logger-options handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manifest must contain at least one plugin")]
    EmptyManifest,

    #[error("plugin path cannot be empty")]
    EmptyPluginPath,

    #[error("plugin path {0:?} cannot contain '..'")]
    ForbiddenPluginPath(PathBuf),

    #[error("duplicate plugin name {0:?}")]
    DuplicateName(String),

    #[error("duplicate plugin path {0:?}")]
    DuplicatePath(PathBuf),

    #[error("manifest path cannot be empty")]
    EmptyManifestPath,

    #[error("manifest path {0:?} cannot contain '..'")]
    ForbiddenManifestPath(PathBuf),

    #[error("failed to read manifest file at {path:?}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    ManifestParse(#[from] serde_yaml::Error),

    #[error("failed to encode logger options: {0}")]
    LoggerEncode(#[source] serde_json::Error),

    #[error("failed to decode logger options: {0}")]
    LoggerDecode(#[source] serde_json::Error),
}
