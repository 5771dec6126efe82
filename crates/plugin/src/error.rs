//! Error types for the plugin bootstrap.

use thiserror::Error;

/// Fatal startup and serve errors inside a plugin process.
#[derive(Debug, Error)]
pub enum StubError {
    #[error("missing or empty tls_key_and_cert argument")]
    MissingCredential,

    #[error(transparent)]
    Transport(#[from] gantry_transport::TransportError),

    #[error("failed to bind plugin listener on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// Result type alias for the plugin bootstrap.
pub type Result<T> = std::result::Result<T, StubError>;
