//! The plugin registry: all-or-nothing load, lookup by name, coordinated
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use gantry_config::{LoggerOptions, ManifestSource, PluginDescriptor};
use gantry_transport::{Role, TransportGenerator};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{connect_plugin_client, ClientFactory};
use crate::error::{Result, RunnerError};
use crate::ports::PortBroker;
use crate::supervisor::{spawn_plugin, SupervisedPlugin};

/// Everything the caller supplies to load a set of plugins.
pub struct RunnerConfig<T> {
    /// The plugin manifest, as a file path or an inline value.
    pub manifest: ManifestSource,
    /// Logger configuration forwarded to every plugin subprocess.
    pub logger_options: Option<LoggerOptions>,
    /// Constructor for the caller's typed client.
    pub client_factory: ClientFactory<T>,
}

struct LoadedPlugin<T> {
    client: T,
    supervised: Arc<SupervisedPlugin>,
}

/// The set of plugins produced by one [`load_all`] call.
///
/// Owns the CA (through the transport generator) and the port broker; both
/// die with the registry. Reads proceed in parallel; `close` serializes.
pub struct PluginRegistry<T> {
    plugins: RwLock<HashMap<String, LoadedPlugin<T>>>,
    broker: PortBroker,
    transport: TransportGenerator,
}

/// Load every plugin in the manifest, in manifest order.
///
/// On any failure the already-loaded plugins are torn down in reverse order
/// and the original error is surfaced; a failed load leaves no subprocess
/// alive and no port leased.
pub async fn load_all<T>(
    config: RunnerConfig<T>,
    cancel: CancellationToken,
) -> Result<PluginRegistry<T>> {
    debug!("starting plugin load");

    let manifest = config.manifest.load()?;
    let descriptors = manifest.resolve()?;
    let transport = TransportGenerator::new(&manifest.tls)?;
    let broker = PortBroker::new();

    let mut loaded: Vec<(String, LoadedPlugin<T>)> = Vec::with_capacity(descriptors.len());

    for descriptor in &descriptors {
        if cancel.is_cancelled() {
            error!("plugin loading cancelled");
            teardown(&loaded, &broker);
            return Err(RunnerError::Cancelled);
        }

        debug!(
            plugin = %descriptor.name,
            path = %descriptor.path.display(),
            "loading plugin"
        );
        match load_plugin(descriptor, &transport, &broker, &config, &cancel).await {
            Ok(plugin) => {
                info!(plugin = %descriptor.name, "plugin loaded");
                loaded.push((descriptor.name.clone(), plugin));
            }
            Err(load_error) => {
                error!(plugin = %descriptor.name, error = %load_error, "failed to load plugin");
                teardown(&loaded, &broker);
                return Err(load_error);
            }
        }
    }

    info!(plugin_count = loaded.len(), "all plugins loaded");
    Ok(PluginRegistry {
        plugins: RwLock::new(loaded.into_iter().collect()),
        broker,
        transport,
    })
}

async fn load_plugin<T>(
    descriptor: &PluginDescriptor,
    transport: &TransportGenerator,
    broker: &PortBroker,
    config: &RunnerConfig<T>,
    cancel: &CancellationToken,
) -> Result<LoadedPlugin<T>> {
    let server_credential = transport.generate_credential(&descriptor.name, Role::Server)?;
    let port = broker.acquire()?;

    let supervised = match spawn_plugin(
        descriptor,
        server_credential,
        port,
        config.logger_options.as_ref(),
        cancel,
    )
    .await
    {
        Ok(supervised) => supervised,
        Err(spawn_error) => {
            if let Err(release_error) = broker.release(port) {
                error!(
                    plugin = %descriptor.name,
                    port,
                    error = %release_error,
                    "failed to release port after spawn failure"
                );
            }
            return Err(spawn_error);
        }
    };

    match issue_and_connect(descriptor, transport, port, &config.client_factory) {
        Ok(client) => Ok(LoadedPlugin {
            client,
            supervised: Arc::new(supervised),
        }),
        Err(client_error) => {
            if let Err(close_error) = supervised.close() {
                error!(
                    plugin = %descriptor.name,
                    error = %close_error,
                    "failed to terminate plugin after client setup failure"
                );
            }
            if let Err(release_error) = broker.release(port) {
                error!(
                    plugin = %descriptor.name,
                    port,
                    error = %release_error,
                    "failed to release port after client setup failure"
                );
            }
            Err(client_error)
        }
    }
}

fn issue_and_connect<T>(
    descriptor: &PluginDescriptor,
    transport: &TransportGenerator,
    port: u16,
    factory: &ClientFactory<T>,
) -> Result<T> {
    let client_credential = transport
        .generate_credential(&format!("{}_client", descriptor.name), Role::Client)
        .map_err(|error| RunnerError::ClientSetup {
            plugin: descriptor.name.clone(),
            message: error.to_string(),
        })?;
    connect_plugin_client(&descriptor.name, port, &client_credential, factory)
}

/// Best-effort teardown of partially loaded plugins, in reverse load order.
/// Failures are logged; they never mask the original load error.
fn teardown<T>(loaded: &[(String, LoadedPlugin<T>)], broker: &PortBroker) {
    for (name, plugin) in loaded.iter().rev() {
        debug!(plugin = %name, "tearing down partially loaded plugin");
        if let Err(close_error) = plugin.supervised.close() {
            error!(plugin = %name, error = %close_error, "failed to close plugin during teardown");
        }
        if let Err(release_error) = broker.release(plugin.supervised.port()) {
            error!(plugin = %name, error = %release_error, "failed to release port during teardown");
        }
    }
}

impl<T> PluginRegistry<T> {
    /// Typed client for the named plugin.
    pub async fn get(&self, name: &str) -> Result<T>
    where
        T: Clone,
    {
        let plugins = self.plugins.read().await;
        plugins
            .get(name)
            .map(|plugin| plugin.client.clone())
            .ok_or_else(|| RunnerError::NotFound(name.to_string()))
    }

    /// Snapshot of every typed client. Iteration order is unspecified.
    pub async fn all(&self) -> Vec<T>
    where
        T: Clone,
    {
        let plugins = self.plugins.read().await;
        plugins.values().map(|plugin| plugin.client.clone()).collect()
    }

    /// Supervisor handle for the named plugin, for callers that need raw
    /// lifecycle control.
    pub async fn get_supervised(&self, name: &str) -> Result<Arc<SupervisedPlugin>> {
        let plugins = self.plugins.read().await;
        plugins
            .get(name)
            .map(|plugin| plugin.supervised.clone())
            .ok_or_else(|| RunnerError::NotFound(name.to_string()))
    }

    /// Snapshot of every supervisor handle.
    pub async fn all_supervised(&self) -> Vec<Arc<SupervisedPlugin>> {
        let plugins = self.plugins.read().await;
        plugins
            .values()
            .map(|plugin| plugin.supervised.clone())
            .collect()
    }

    /// The credential generator (and CA) owned by this registry.
    pub fn transport(&self) -> &TransportGenerator {
        &self.transport
    }

    /// Close every plugin and release its port.
    ///
    /// The mapping is snapshotted and cleared under the exclusive lock, then
    /// the slow per-plugin teardown runs outside it. Every close is
    /// attempted; the last close error is reported. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let drained = {
            let mut plugins = self.plugins.write().await;
            std::mem::take(&mut *plugins)
        };
        debug!(plugin_count = drained.len(), "closing plugins");

        let mut last_error = None;
        for (name, plugin) in drained {
            if let Err(close_error) = plugin.supervised.close() {
                error!(plugin = %name, error = %close_error, "failed to close plugin");
                last_error = Some(close_error);
            }
            if let Err(release_error) = self.broker.release(plugin.supervised.port()) {
                error!(plugin = %name, error = %release_error, "failed to release port");
            }
        }

        match last_error {
            Some(close_error) => Err(close_error),
            None => {
                info!("all plugins closed");
                Ok(())
            }
        }
    }
}
