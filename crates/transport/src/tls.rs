//! Pinned TLS configurations built from leaf credentials.
//!
//! Both sides pin TLS 1.3 exactly, trust only the CA embedded in the
//! credential, require and verify the peer certificate, and advertise `h2`
//! so the channel carries gRPC directly.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::error::TransportError;
use crate::pki::LeafCredential;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl LeafCredential {
    fn root_store(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(self.ca_cert_der().to_vec()))?;
        Ok(roots)
    }

    fn identity(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let chain = vec![CertificateDer::from(self.cert_der().to_vec())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der().to_vec()));
        (chain, key)
    }

    /// Server-side TLS config: TLS 1.3 only, client certificates required
    /// and verified against the embedded CA.
    pub fn server_tls_config(&self) -> Result<ServerConfig, TransportError> {
        debug!(cn = self.common_name(), "building server TLS config");

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider())
                .build()?;
        let (chain, key) = self.identity();

        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(config)
    }

    /// Client-side TLS config: TLS 1.3 only, server verified against the
    /// embedded CA, leaf presented for client authentication.
    pub fn client_tls_config(&self) -> Result<ClientConfig, TransportError> {
        debug!(cn = self.common_name(), "building client TLS config");

        let (chain, key) = self.identity();

        let mut config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(chain, key)?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use crate::pki::{PrivateCa, Role};
    use crate::LeafCredential;

    #[test]
    fn configs_pin_h2() {
        let ca = PrivateCa::generate().unwrap();
        let server = ca.issue("alpha", Role::Server).unwrap();
        let client = ca.issue("alpha_client", Role::Client).unwrap();
        assert_eq!(
            server.server_tls_config().unwrap().alpn_protocols,
            vec![b"h2".to_vec()]
        );
        assert_eq!(
            client.client_tls_config().unwrap().alpn_protocols,
            vec![b"h2".to_vec()]
        );
    }

    /// A deserialized server credential and a freshly issued client
    /// credential complete a mutually authenticated TLS 1.3 handshake over
    /// loopback.
    #[tokio::test]
    async fn mutual_handshake_negotiates_tls13() {
        let ca = PrivateCa::generate().unwrap();
        let server_leaf = ca.issue("alpha", Role::Server).unwrap();
        let server_leaf =
            LeafCredential::deserialize(&server_leaf.serialize().unwrap()).unwrap();
        let client_leaf = ca.issue("alpha_client", Role::Client).unwrap();

        let acceptor = TlsAcceptor::from(Arc::new(server_leaf.server_tls_config().unwrap()));
        let connector = TlsConnector::from(Arc::new(client_leaf.client_tls_config().unwrap()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            let (_, connection) = tls.get_ref();
            assert_eq!(
                connection.protocol_version(),
                Some(rustls::ProtocolVersion::TLSv1_3)
            );
            // Mutual auth: the client presented a certificate.
            assert!(connection
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()));
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(server_name, stream).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();

        let (_, connection) = tls.get_ref();
        assert_eq!(
            connection.protocol_version(),
            Some(rustls::ProtocolVersion::TLSv1_3)
        );

        server_task.await.unwrap();
    }

    /// A client trusting a different CA is rejected by the server.
    #[tokio::test]
    async fn foreign_ca_client_is_rejected() {
        let ca = PrivateCa::generate().unwrap();
        let other_ca = PrivateCa::generate().unwrap();
        let server_leaf = ca.issue("alpha", Role::Server).unwrap();
        let foreign_client = other_ca.issue("intruder", Role::Client).unwrap();

        let acceptor = TlsAcceptor::from(Arc::new(server_leaf.server_tls_config().unwrap()));
        let connector =
            TlsConnector::from(Arc::new(foreign_client.client_tls_config().unwrap()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            acceptor.accept(stream).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        // One side or the other must fail: the client rejects the server's
        // unknown CA before the server can reject the client certificate.
        let client_result = connector.connect(server_name, stream).await;
        let server_result = server_task.await.unwrap();
        assert!(client_result.is_err() || server_result.is_err());
    }
}
