//! Bootstrap for gantry plugin processes.
//!
//! A plugin binary implements [`Plugin`] and hands it to [`run`]:
//!
//! ```ignore
//! struct Greeter;
//!
//! impl gantry_plugin::Plugin for Greeter {
//!     fn start(&mut self, options: gantry_plugin::PluginOptions) -> Router {
//!         let mut server = options.server;
//!         server.add_service(GreeterServer::new(GreeterService::default()))
//!     }
//! }
//!
//! fn main() {
//!     gantry_plugin::run(Greeter);
//! }
//! ```
//!
//! [`run`] parses the arguments injected by the runner, applies the logger
//! configuration, deserializes the server credential, binds the TLS
//! listener, registers the plugin's services, and serves until a
//! termination signal arrives. Any failure before serving exits non-zero.

mod args;
mod error;
mod logging;
mod serve;

use clap::Parser;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::Instrument;

pub use args::StubArgs;
pub use error::{Result, StubError};
pub use serve::serve;

/// What the bootstrap hands to the plugin's registration hook.
pub struct PluginOptions {
    /// Name the runner assigned to this instance.
    pub plugin_name: String,
    /// Server builder to register services on.
    pub server: Server,
}

/// Implemented by the plugin author; called exactly once at startup to
/// register the plugin's gRPC services.
pub trait Plugin {
    fn start(&mut self, options: PluginOptions) -> Router;
}

/// Entry point for plugin binaries: parse arguments, configure logging,
/// serve until signalled. Exits the process.
pub fn run<P: Plugin>(plugin: P) -> ! {
    let args = StubArgs::parse();
    logging::init(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(runtime_error) => {
            eprintln!("failed to start plugin runtime: {runtime_error}");
            std::process::exit(1);
        }
    };

    // Scope every record below by the runner-assigned plugin name.
    let result = match args.plugin_name.clone().filter(|name| !name.is_empty()) {
        Some(name) => {
            let span = tracing::info_span!("plugin", name = %name);
            runtime.block_on(serve::serve(plugin, args).instrument(span))
        }
        None => runtime.block_on(serve::serve(plugin, args)),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(startup_error) => {
            tracing::error!(error = %startup_error, "plugin startup failed");
            eprintln!("plugin startup failed: {startup_error}");
            std::process::exit(1);
        }
    }
}
