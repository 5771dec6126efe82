//! The logger-options record injected into plugin subprocesses.
//!
//! The record is a small self-describing JSON value: an output format
//! (`"text"` or `"json"`), an optional numeric level, and an optional map of
//! attributes the plugin attaches to its log records. Encode/decode must
//! round-trip all three fields; interpretation of unknown formats is left to
//! the consumer (the plugin stub falls back to text with a warning).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

/// Logger configuration forwarded from the runner to each plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggerOptions {
    /// Output format: `"text"` or `"json"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Numeric level on the conventional scale: -4 debug, 0 info, 4 warn,
    /// 8 error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    /// Arbitrary attributes the plugin scopes its records with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, serde_json::Value>>,
}

impl LoggerOptions {
    pub fn encode(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(ConfigError::LoggerEncode)
    }

    pub fn decode(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::LoggerDecode)
    }

    /// Map the numeric level onto a tracing level filter. Absent levels mean
    /// info.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level {
            None => LevelFilter::INFO,
            Some(level) if level < 0 => LevelFilter::DEBUG,
            Some(level) if level < 4 => LevelFilter::INFO,
            Some(level) if level < 8 => LevelFilter::WARN,
            Some(_) => LevelFilter::ERROR,
        }
    }
}
