//! Credential generator owned by a single registry instance.

use gantry_config::TlsOptions;
use tracing::{debug, error};

use crate::error::TransportError;
use crate::pki::{LeafCredential, PrivateCa, Role};

/// Owns the per-registry CA and issues all credentials for its plugins.
pub struct TransportGenerator {
    ca: PrivateCa,
}

impl TransportGenerator {
    /// Create a generator with a fresh CA. Manifests requesting custom TLS
    /// material are rejected here, before any plugin is touched.
    pub fn new(options: &TlsOptions) -> Result<Self, TransportError> {
        debug!("creating transport generator");

        if options.use_custom_tls {
            error!("custom TLS is not supported");
            return Err(TransportError::CustomTlsUnsupported);
        }

        let ca = PrivateCa::generate()?;
        debug!("transport generator created");
        Ok(Self { ca })
    }

    /// Issue a leaf credential for the given subject and role.
    pub fn generate_credential(
        &self,
        subject: &str,
        role: Role,
    ) -> Result<LeafCredential, TransportError> {
        self.ca.issue(subject, role)
    }

    pub fn ca(&self) -> &PrivateCa {
        &self.ca
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_tls_is_rejected() {
        let options = TlsOptions {
            use_custom_tls: true,
        };
        assert!(matches!(
            TransportGenerator::new(&options),
            Err(TransportError::CustomTlsUnsupported)
        ));
    }

    #[test]
    fn credentials_share_the_generator_ca() {
        let generator = TransportGenerator::new(&TlsOptions::default()).unwrap();
        let leaf = generator.generate_credential("alpha", Role::Server).unwrap();
        assert_eq!(leaf.ca_cert_der(), generator.ca().cert_der());
    }
}
