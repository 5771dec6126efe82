//! Builds the mutually authenticated gRPC channel for one plugin and adapts
//! it to the caller's typed client.

use std::sync::Arc;

use gantry_transport::LeafCredential;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Caller-supplied constructor turning a channel into a typed client.
pub type ClientFactory<T> = Arc<dyn Fn(Channel) -> T + Send + Sync>;

/// Create the typed client for a plugin listening on `localhost:port`.
///
/// The channel dials through a pinned-TLS connector and is lazy: readiness
/// was already probed by the supervisor, and a plugin that dies later fails
/// per-call rather than at setup.
pub(crate) fn connect_plugin_client<T>(
    plugin: &str,
    port: u16,
    credential: &LeafCredential,
    factory: &ClientFactory<T>,
) -> Result<T> {
    debug!(plugin, port, "creating plugin client channel");

    let tls = Arc::new(
        credential
            .client_tls_config()
            .map_err(|error| client_setup(plugin, error))?,
    );
    let server_name =
        ServerName::try_from("localhost").map_err(|error| client_setup(plugin, error))?;
    let endpoint = Endpoint::from_shared(format!("https://localhost:{port}"))
        .map_err(|error| client_setup(plugin, error))?;

    let connector = service_fn(move |_: Uri| {
        let tls = tls.clone();
        let server_name = server_name.clone();
        async move {
            let stream = TcpStream::connect(("localhost", port)).await?;
            let tls_stream = TlsConnector::from(tls).connect(server_name, stream).await?;
            Ok::<_, std::io::Error>(TokioIo::new(tls_stream))
        }
    });

    let channel = endpoint.connect_with_connector_lazy(connector);
    debug!(plugin, port, "plugin client channel created");
    Ok(factory(channel))
}

fn client_setup(plugin: &str, error: impl std::fmt::Display) -> RunnerError {
    RunnerError::ClientSetup {
        plugin: plugin.to_string(),
        message: error.to_string(),
    }
}
