//! Configuration for stackbd.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layer::Layer;
use crate::layers::{MemoryLayer, OffsetLayer, ReadonlyLayer};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    /// Filters stacked over the plugin, outermost first.
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub nbd: NbdConfig,
}

/// The export offered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_name")]
    pub name: String,
    #[serde(default)]
    pub readonly: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            name: default_export_name(),
            readonly: false,
        }
    }
}

/// The innermost layer of the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_plugin_name")]
    pub name: String,
    #[serde(default = "default_size_bytes")]
    pub size_bytes: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: default_plugin_name(),
            size_bytes: default_size_bytes(),
        }
    }
}

impl PluginConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "plugin.size_bytes",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    /// Instantiate the configured plugin.
    pub fn build_plugin(&self) -> Result<Arc<dyn Layer>, ConfigError> {
        match self.name.as_str() {
            "memory" => Ok(Arc::new(MemoryLayer::new(self.size_bytes))),
            _ => Err(ConfigError::UnknownLayer {
                name: self.name.clone(),
            }),
        }
    }
}

/// One filter of the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    /// Byte offset for the `offset` filter.
    #[serde(default)]
    pub offset: u64,
    /// Window length for the `offset` filter; the rest of the inner export
    /// when absent.
    #[serde(default)]
    pub range: Option<u64>,
}

impl FilterConfig {
    /// Instantiate the configured filter.
    pub fn build_filter(&self) -> Result<Arc<dyn Layer>, ConfigError> {
        match self.name.as_str() {
            "readonly" => Ok(Arc::new(ReadonlyLayer)),
            "offset" => Ok(Arc::new(OffsetLayer::new(self.offset, self.range))),
            _ => Err(ConfigError::UnknownLayer {
                name: self.name.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdConfig {
    #[serde(default = "default_nbd_address")]
    pub address: String,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            address: default_nbd_address(),
        }
    }
}

fn default_export_name() -> String {
    "stackbd".to_string()
}

fn default_plugin_name() -> String {
    "memory".to_string()
}

fn default_size_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_nbd_address() -> String {
    "127.0.0.1:10809".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.plugin.validate()?;
        Ok(config)
    }
}
