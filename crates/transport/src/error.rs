//! Error types for credential issuance and TLS configuration.

use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("custom TLS is not supported yet")]
    CustomTlsUnsupported,

    #[error("failed to generate private key: {0}")]
    KeyGeneration(String),

    #[error("failed to build certificate: {0}")]
    CertificateGeneration(#[from] rcgen::Error),

    #[error("invalid role {0:?}, must be \"server\" or \"client\"")]
    InvalidRole(String),

    #[error("failed to decode credential: {0}")]
    CredentialDecode(String),

    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to build client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}
