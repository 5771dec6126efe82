//! The argument protocol between the runner and a plugin process.

use clap::Parser;

/// Arguments the runner injects into every plugin subprocess.
#[derive(Debug, Clone, Parser)]
#[command(name = "gantry-plugin")]
pub struct StubArgs {
    /// Port the plugin server binds.
    #[arg(long = "port", default_value_t = 50051)]
    pub port: u16,

    /// Serialized server credential issued by the runner. Missing or empty
    /// is fatal.
    #[arg(long = "tls_key_and_cert", default_value = "")]
    pub tls_key_and_cert: String,

    /// Name the runner assigned to this plugin instance.
    #[arg(long = "plugin_name")]
    pub plugin_name: Option<String>,

    /// Encoded logger-options record.
    #[arg(long = "logger_options")]
    pub logger_options: Option<String>,
}
