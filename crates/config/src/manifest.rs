//! Plugin manifest: the ordered list of plugin descriptors plus TLS options,
//! supplied either as a YAML file or as an inline value.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Setting this to exactly `"true"` permits relative plugin paths that
/// contain the parent-directory token.
pub const ALLOW_DOUBLE_DOT_ENV_VAR: &str = "GRPC_PLUGINS_ALLOW_RELATIVE_PATHS_DOUBLE_DOT";

/// How a plugin's entry point is produced and launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Compile-and-run the sources at the plugin path with the ambient
    /// toolchain.
    BuildAndRun,
}

/// One plugin entry as written in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPlugin {
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
    pub kind: PluginKind,
}

impl ManifestPlugin {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPluginPath);
        }
        if !self.path.is_absolute()
            && contains_parent_dir(&self.path)
            && std::env::var(ALLOW_DOUBLE_DOT_ENV_VAR).as_deref() != Ok("true")
        {
            return Err(ConfigError::ForbiddenPluginPath(self.path.clone()));
        }
        Ok(())
    }

    fn resolved_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if let Some(base) = self.path.file_name().and_then(|b| b.to_str()) {
            return base.to_string();
        }
        random_plugin_name()
    }
}

fn contains_parent_dir(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

fn random_plugin_name() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("plugin_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// TLS section of the manifest. Custom TLS material is not supported; the
/// transport layer rejects `use_custom_tls` at load.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    #[serde(default)]
    pub use_custom_tls: bool,
}

/// A fully resolved plugin entry: the name is fixed and the path is known
/// to satisfy the manifest invariants.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub kind: PluginKind,
}

/// Parsed manifest contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default)]
    pub plugins: Vec<ManifestPlugin>,
    #[serde(default)]
    pub tls: TlsOptions,
}

impl ManifestConfig {
    /// Resolve every entry to a [`PluginDescriptor`], enforcing the manifest
    /// invariants: at least one plugin, unique names, unique absolute paths,
    /// no parent-directory tokens in relative paths (unless the escape hatch
    /// is set).
    pub fn resolve(&self) -> Result<Vec<PluginDescriptor>, ConfigError> {
        if self.plugins.is_empty() {
            return Err(ConfigError::EmptyManifest);
        }

        let mut seen_names = HashSet::new();
        let mut seen_paths = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.plugins.len());

        for plugin in &self.plugins {
            plugin.validate()?;

            let name = plugin.resolved_name();
            if !seen_names.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name));
            }

            let absolute = absolute_path(&plugin.path);
            if !seen_paths.insert(absolute.clone()) {
                return Err(ConfigError::DuplicatePath(absolute));
            }

            descriptors.push(PluginDescriptor {
                name,
                path: plugin.path.clone(),
                kind: plugin.kind,
            });
        }

        Ok(descriptors)
    }

    /// Check the manifest invariants without keeping the resolved entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve().map(|_| ())
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Where the manifest comes from. Both forms validate identically.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    /// Read and parse a YAML manifest file.
    File(PathBuf),
    /// Use an already constructed manifest value.
    Inline(ManifestConfig),
}

impl ManifestSource {
    /// Load and validate the manifest.
    pub fn load(&self) -> Result<ManifestConfig, ConfigError> {
        match self {
            ManifestSource::File(path) => {
                debug!(path = %path.display(), "loading manifest from file");
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::EmptyManifestPath);
                }
                if !path.is_absolute() && contains_parent_dir(path) {
                    return Err(ConfigError::ForbiddenManifestPath(path.clone()));
                }
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ManifestRead {
                        path: path.clone(),
                        source,
                    })?;
                let config: ManifestConfig = serde_yaml::from_str(&contents)?;
                config.validate()?;
                info!(
                    path = %path.display(),
                    plugin_count = config.plugins.len(),
                    use_custom_tls = config.tls.use_custom_tls,
                    "manifest file loaded"
                );
                Ok(config)
            }
            ManifestSource::Inline(config) => {
                debug!("loading inline manifest");
                config.validate()?;
                info!(
                    plugin_count = config.plugins.len(),
                    use_custom_tls = config.tls.use_custom_tls,
                    "inline manifest loaded"
                );
                Ok(config.clone())
            }
        }
    }
}
