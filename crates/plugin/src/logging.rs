//! Logger setup from the injected logger-options record.

use gantry_config::LoggerOptions;
use tracing::{debug, error, warn};

use crate::args::StubArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// Resolve the record's `type` field. Unknown values fall back to text; the
/// second element says whether a fallback happened.
fn resolve_format(kind: &str) -> (LogFormat, bool) {
    match kind {
        "json" => (LogFormat::Json, false),
        "text" => (LogFormat::Text, false),
        _ => (LogFormat::Text, true),
    }
}

/// Install the process-wide subscriber from the injected options. This is the
/// only process-global state the stub owns; it is set once here and never
/// reached for again.
pub(crate) fn init(args: &StubArgs) {
    let raw = args.logger_options.as_deref().unwrap_or("").trim();
    if raw.is_empty() {
        tracing_subscriber::fmt().try_init().ok();
        return;
    }

    let options = match LoggerOptions::decode(raw) {
        Ok(options) => options,
        Err(decode_error) => {
            tracing_subscriber::fmt().try_init().ok();
            error!(error = %decode_error, "failed to decode logger options");
            return;
        }
    };

    let filter = options.level_filter();
    let (format, fell_back) = resolve_format(&options.kind);
    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_max_level(filter)
                .try_init()
                .ok();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_max_level(filter).try_init().ok();
        }
    }

    if fell_back {
        warn!(kind = %options.kind, "no logger type specified, using text");
    }
    if let Some(attributes) = &options.attributes {
        if let Ok(encoded) = serde_json::to_string(attributes) {
            debug!(attributes = %encoded, "logger attributes applied");
        }
    }
}
