//! The plugin-side serve loop: TLS listener, signal handling, graceful stop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gantry_transport::LeafCredential;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::args::StubArgs;
use crate::error::{Result, StubError};
use crate::{Plugin, PluginOptions};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the plugin server until a termination signal arrives.
///
/// Fails fast on any startup problem (credential, listener, TLS); once
/// serving, a termination signal initiates a graceful stop with a five
/// second deadline before the server is stopped forcibly.
pub async fn serve<P: Plugin>(mut plugin: P, args: StubArgs) -> Result<()> {
    let raw_credential = args.tls_key_and_cert.trim();
    if raw_credential.is_empty() {
        return Err(StubError::MissingCredential);
    }
    let credential = LeafCredential::deserialize(raw_credential)?;
    debug!(cn = credential.common_name(), "server credential deserialized");

    // Bind all interfaces; the parent's readiness probe dials localhost.
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .map_err(|source| StubError::Bind {
            port: args.port,
            source,
        })?;
    info!(port = args.port, "plugin server listening");

    let acceptor = TlsAcceptor::from(Arc::new(credential.server_tls_config()?));

    let router = plugin.start(PluginOptions {
        plugin_name: args.plugin_name.clone().unwrap_or_default(),
        server: Server::builder(),
    });
    debug!("plugin services registered");

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let incoming = TcpListenerStream::new(listener).filter_map(move |connection| {
        let acceptor = acceptor.clone();
        async move {
            match connection {
                Ok(stream) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => Some(Ok::<_, std::io::Error>(tls_stream)),
                    Err(handshake_error) => {
                        // The parent's readiness probe connects and hangs up
                        // without handshaking; skip and keep serving.
                        debug!(error = %handshake_error, "tls handshake failed");
                        None
                    }
                },
                Err(accept_error) => {
                    warn!(error = %accept_error, "failed to accept connection");
                    None
                }
            }
        }
    });

    let serve_fut =
        router.serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned());
    tokio::pin!(serve_fut);

    tokio::select! {
        result = &mut serve_fut => {
            result?;
        }
        _ = shutdown.cancelled() => {
            info!("initiating graceful shutdown");
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut serve_fut).await {
                Ok(result) => {
                    result?;
                    info!("graceful shutdown completed");
                }
                Err(_) => warn!("graceful shutdown timed out, forcing stop"),
            }
        }
    }

    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_termination().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(install_error) => {
            error!(error = %install_error, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(install_error) => {
            error!(error = %install_error, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    if let Err(ctrl_c_error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %ctrl_c_error, "failed to listen for shutdown signal");
    } else {
        info!("received shutdown signal");
    }
}
