//! Node configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manifest::ApprovalPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub mirrors: MirrorConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
    #[serde(default)]
    pub updates: UpdateConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Our node name, e.g. `alice.os`
    pub id: String,

    /// Data directory (downloads, installed packages, state file)
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the chain indexer serving listing records
    #[serde(default = "default_indexer_url")]
    pub indexer_url: String,

    /// Listing cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Timeout for fetching metadata documents
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Base URL template for a node; `{node}` is replaced by the node name
    #[serde(default = "default_url_template")]
    pub url_template: String,

    /// Explicit node -> base URL overrides
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Mirror attempts per download before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Maximum wait for the next chunk of a transfer
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Run the background auto-update sweep
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Ceiling for per-package retry backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Whether an unchanged manifest carries approval over to a new version
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,

    /// Subscribe packages to auto-update when they are installed
    #[serde(default)]
    pub auto_update_on_install: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

// Defaults
fn default_indexer_url() -> String { "http://127.0.0.1:8090".to_string() }
fn default_cache_ttl() -> u64 { 300 }
fn default_metadata_timeout() -> u64 { 30 }
fn default_probe_timeout() -> u64 { 5000 }
fn default_url_template() -> String { "http://{node}".to_string() }
fn default_max_attempts() -> usize { 3 }
fn default_chunk_timeout() -> u64 { 120 }
fn default_true() -> bool { true }
fn default_check_interval() -> u64 { 3600 } // 1 hour
fn default_max_backoff() -> u64 { 6 * 3600 }
fn default_http_port() -> u16 { 8081 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            indexer_url: default_indexer_url(),
            cache_ttl_secs: default_cache_ttl(),
            metadata_timeout_secs: default_metadata_timeout(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            url_template: default_url_template(),
            nodes: BTreeMap::new(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            chunk_timeout_secs: default_chunk_timeout(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            max_backoff_secs: default_max_backoff(),
            approval_policy: ApprovalPolicy::default(),
            auto_update_on_install: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: "node.os".to_string(),
                data_dir: PathBuf::from("/var/lib/elohim/app-store"),
            },
            registry: RegistryConfig::default(),
            mirrors: MirrorConfig::default(),
            downloads: DownloadConfig::default(),
            updates: UpdateConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Where the persisted store state lives
    pub fn state_path(&self) -> PathBuf {
        self.node.data_dir.join("store-state.json")
    }
}

impl MirrorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl DownloadConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl RegistryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}
