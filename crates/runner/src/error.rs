//! Error types for the runner.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading, supervising, or tearing down plugins.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Manifest(#[from] gantry_config::ConfigError),

    #[error(transparent)]
    Transport(#[from] gantry_transport::TransportError),

    #[error("failed to find available port after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    #[error("port {port} is outside the managed range [{start}, {end})")]
    InvalidPort { port: u16, start: u16, end: u16 },

    #[error("port {port} still in use after {waited:?}")]
    PortStillInUse { port: u16, waited: Duration },

    #[error("plugin {plugin} failed to start within {timeout:?}")]
    StartTimeout { plugin: String, timeout: Duration },

    #[error("plugin loading cancelled")]
    Cancelled,

    #[error("failed to spawn plugin {plugin} process")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up client for plugin {plugin}: {message}")]
    ClientSetup { plugin: String, message: String },

    #[error("plugin {0:?} not found")]
    NotFound(String),

    #[error("failed to terminate plugin {plugin} process group {pgid}")]
    Teardown {
        plugin: String,
        pgid: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, RunnerError>;
