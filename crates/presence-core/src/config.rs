//! Node configuration.
//!
//! Every field has a default, so an empty YAML document is a valid config.
//! The same settings can be changed at runtime through the node's setters.

use crate::heartbeat::HeartbeatConfig;
use crate::message::DEFAULT_PREFIX;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid target address: {0:?}")]
    InvalidTarget(String),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Settings for one discovery node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name advertised to peers (default: host name)
    pub name: String,
    /// Groups this node belongs to
    pub groups: Vec<String>,
    /// Explicit request targets; `None` means every interface's broadcast
    pub targets: Option<Vec<Ipv4Addr>>,
    /// Protocol address prefix
    pub prefix: String,
    /// Accept our own broadcasts as a peer
    pub allow_loopback: bool,
    /// Shared key; `Some` enables secret mode
    pub secret: Option<String>,
    /// Heartbeat policy
    pub heartbeat: HeartbeatConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            groups: Vec::new(),
            targets: None,
            prefix: DEFAULT_PREFIX.to_string(),
            allow_loopback: false,
            secret: None,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not a map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Name to advertise, falling back to the host name.
    pub fn resolved_name(&self) -> String {
        if self.name.is_empty() {
            host_name()
        } else {
            self.name.clone()
        }
    }
}

/// Split a comma-separated list, dropping empty pieces.
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated list of IPv4 addresses.
pub fn parse_targets(list: &str) -> Result<Vec<Ipv4Addr>, ConfigError> {
    split_list(list)
        .into_iter()
        .map(|s| s.parse().map_err(|_| ConfigError::InvalidTarget(s)))
        .collect()
}

/// This machine's host name, or empty if it cannot be read.
pub fn host_name() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!("Failed to read host name: {}", e);
            String::new()
        }
    }
}
