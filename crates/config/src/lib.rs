//! Configuration types for the gantry plugin runtime: the plugin manifest
//! and the logger-options record handed to plugin subprocesses.

mod error;
mod logger;
mod manifest;

pub use error::ConfigError;
pub use logger::LoggerOptions;
pub use manifest::{
    ManifestConfig, ManifestPlugin, ManifestSource, PluginDescriptor, PluginKind, TlsOptions,
    ALLOW_DOUBLE_DOT_ENV_VAR,
};
