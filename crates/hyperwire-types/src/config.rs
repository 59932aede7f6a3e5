//! Node configuration loaded from `~/.hyperwire/config.toml` with defaults.
//!
//! ```toml
//! node = "alice.os"
//! process = "chat:app:alice.os"
//! listen_addr = "0.0.0.0:9400"
//! shared_secret = "change-me"
//! default_timeout_secs = 30
//!
//! [[peers]]
//! node = "bob.os"
//! addr = "10.0.0.2:9400"
//! ```

use crate::address::{Address, ProcessId};
use crate::error::{ConfigError, ParseError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Process id used when the config does not name one.
pub const DEFAULT_PROCESS: &str = "hyperwire:hyperwire:sys";

/// A statically known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's node name.
    pub node: String,
    /// Where the peer listens.
    pub addr: SocketAddr,
}

/// Configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's name. Injected into every component that needs to know
    /// its own identity.
    pub node: String,
    /// The local process that sends and serves requests.
    pub process: ProcessId,
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Pre-shared key for HMAC-SHA256 connection authentication.
    /// Empty disables the HMAC check.
    pub shared_secret: String,
    /// Timeout applied when a caller does not give one.
    pub default_timeout_secs: u64,
    /// How often the correlator sweeps expired requests.
    pub sweep_interval_ms: u64,
    /// Peers reachable over TCP.
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: format!("node-{}", uuid::Uuid::new_v4().simple()),
            process: ProcessId {
                process_name: "hyperwire".to_string(),
                package_name: "hyperwire".to_string(),
                publisher: "sys".to_string(),
            },
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared_secret: String::new(),
            default_timeout_secs: 30,
            sweep_interval_ms: 250,
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// This node's own address.
    pub fn our(&self) -> Result<Address, ParseError> {
        Address::new(self.node.clone(), self.process.clone())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Check the values serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.our() {
            return Err(ConfigError::Invalid {
                field: "node".to_string(),
                reason: e.to_string(),
            });
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "default_timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        for peer in &self.peers {
            if peer.node.is_empty() || peer.node == self.node {
                return Err(ConfigError::Invalid {
                    field: "peers".to_string(),
                    reason: format!("invalid peer node name {:?}", peer.node),
                });
            }
        }
        Ok(())
    }
}

/// `~/.hyperwire/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".hyperwire"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load and validate a config file, reporting every failure.
pub fn try_load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: NodeConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is logged and replaced by
/// [`NodeConfig::default`].
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NodeConfig::default();
    }

    match try_load_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), node = %config.node, "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            NodeConfig::default()
        }
    }
}
