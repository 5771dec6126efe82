//! Parent-side orchestrator for the gantry plugin runtime.
//!
//! Given a manifest of plugin descriptors and a constructor for the caller's
//! typed gRPC client, [`load_all`] mints a fresh per-registry certificate
//! authority, leases a local port per plugin, spawns each plugin as a
//! subprocess in its own process group, probes it for readiness, and wires a
//! mutually authenticated TLS 1.3 channel to it. The resulting
//! [`PluginRegistry`] exposes the typed clients by name and tears every
//! subprocess and port lease down on [`PluginRegistry::close`].
//!
//! Loading is all-or-nothing: a failure part-way through closes the plugins
//! that already started, in reverse order, and surfaces the original error.

mod client;
mod error;
mod ports;
mod registry;
mod supervisor;

pub use client::ClientFactory;
pub use error::{Result, RunnerError};
pub use ports::PortBroker;
pub use registry::{load_all, PluginRegistry, RunnerConfig};
pub use supervisor::SupervisedPlugin;

pub use gantry_config::{
    LoggerOptions, ManifestConfig, ManifestPlugin, ManifestSource, PluginDescriptor, PluginKind,
    TlsOptions,
};
pub use gantry_transport::{LeafCredential, PrivateCa, Role, TransportGenerator};
