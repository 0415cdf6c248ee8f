//! Cluster configuration
//!
//! Loaded from TOML. Every field has a default so a missing file, or a file
//! with only a handful of keys, still yields a usable single-node setup.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Human readable node name, used in logs only
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Host the discovery endpoint binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the discovery endpoint
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Minimum expected cluster size; drives replication settings
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,

    /// Node runs scheduled work
    #[serde(default)]
    pub scheduler: bool,

    /// Node is a client: a member that never owns partitions
    #[serde(default)]
    pub client: bool,

    /// Cloud-runner mode: no dedicated scheduler nodes exist
    #[serde(default)]
    pub cloud_runner: bool,

    /// How this node finds its peers
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub tls: ClusterTlsConfig,

    #[serde(default)]
    pub address_resolver: AddressResolverConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_node_name() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_discovery_port() -> u16 {
    47500
}

fn default_min_nodes() -> usize {
    1
}

pub(crate) fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bind_host: default_bind_host(),
            discovery_port: default_discovery_port(),
            discovery: DiscoveryConfig::default(),
            min_nodes: default_min_nodes(),
            scheduler: false,
            client: false,
            cloud_runner: false,
            tls: ClusterTlsConfig::default(),
            address_resolver: AddressResolverConfig::default(),
            lock: LockConfig::default(),
            messaging: MessagingConfig::default(),
            rpc: RpcConfig::default(),
            executor: ExecutorConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Replication mode for distributed caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Every node holds a full copy
    Replicated,
    /// Keyspace is sharded across nodes with backups
    Partitioned,
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, writing the defaults to `path` when it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let config = ClusterConfig::default();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(&config)?)?;
        tracing::info!(path = %path.display(), "Wrote default cluster configuration");
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.min_nodes == 0 {
            return Err(ClusterError::Config("min_nodes must be at least 1".into()));
        }
        if self.lock.retry_attempts == 0 {
            return Err(ClusterError::Config(
                "lock.retry_attempts must be at least 1".into(),
            ));
        }
        if self.executor.pool_size == 0 || self.executor.max_levels == 0 {
            return Err(ClusterError::Config(
                "executor.pool_size and executor.max_levels must be positive".into(),
            ));
        }
        if let DiscoveryConfig::Static { nodes } = &self.discovery {
            if nodes.is_empty() {
                return Err(ClusterError::Config(
                    "static discovery needs at least one node".into(),
                ));
            }
        }
        if self.tls.enabled && !self.tls.has_identity() {
            return Err(ClusterError::Config(
                "tls.enabled requires tls.cert_path and tls.key_path, or tls.keystore_path".into(),
            ));
        }
        if self.transfer.handshake_timeout_ms == 0 {
            return Err(ClusterError::Config(
                "transfer.handshake_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Number of backup copies kept for partitioned caches
    pub fn backups(&self) -> usize {
        std::cmp::max(2, self.min_nodes / 2 + 1)
    }

    /// Partitioned once the cluster is big enough to make sharding worthwhile
    pub fn cache_mode(&self) -> CacheMode {
        if self.min_nodes > 2 {
            CacheMode::Partitioned
        } else {
            CacheMode::Replicated
        }
    }

    /// Local discovery bind address as `host:port`
    pub fn discovery_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.discovery_port)
    }
}

/// Node discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    /// Stand-alone node, no peers
    Single,

    /// Multicast group discovery
    Multicast {
        #[serde(default = "default_multicast_group")]
        group: String,
        #[serde(default = "default_multicast_port")]
        port: u16,
    },

    /// Fixed list of peer addresses (host:port)
    Static { nodes: Vec<String> },

    /// Peers found through orchestration platform labels
    PlatformLabel {
        label: String,
        #[serde(default)]
        namespace: Option<String>,
    },
}

fn default_multicast_group() -> String {
    "228.1.2.4".to_string()
}

fn default_multicast_port() -> u16 {
    47400
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Single
    }
}

impl DiscoveryConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            DiscoveryConfig::Single => "single",
            DiscoveryConfig::Multicast { .. } => "multicast",
            DiscoveryConfig::Static { .. } => "static",
            DiscoveryConfig::PlatformLabel { .. } => "platform_label",
        }
    }
}

/// TLS material for cluster communication
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterTlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Node certificate (PEM)
    pub cert_path: Option<PathBuf>,

    /// Node private key (PEM)
    pub key_path: Option<PathBuf>,

    /// CA certificate; when set, peers must present a certificate it signed
    pub ca_cert_path: Option<PathBuf>,

    /// Certificate chain and private key in one PEM file; used when
    /// `cert_path`/`key_path` are not both set
    pub keystore_path: Option<PathBuf>,

    /// Extra trusted CA certificates (PEM bundle). Without this and
    /// `ca_cert_path` the platform roots are trusted.
    pub truststore_path: Option<PathBuf>,

    /// Skip peer certificate verification (INSECURE - for development only)
    #[serde(default)]
    pub skip_verify: bool,
}

impl ClusterTlsConfig {
    /// Whether a certificate and key can be found
    pub fn has_identity(&self) -> bool {
        (self.cert_path.is_some() && self.key_path.is_some()) || self.keystore_path.is_some()
    }
}

/// Mapping from local bind addresses to externally reachable ones
/// (NAT, containers)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AddressResolverConfig {
    /// Externally visible discovery port, if different from the bound one
    pub discovery_port_override: Option<u16>,

    /// Externally visible data-plane (transfer) port
    pub data_port_override: Option<u16>,

    #[serde(default)]
    pub mappings: Vec<AddressMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressMapping {
    /// Local host or host:port
    pub local: String,
    /// External host or host:port
    pub external: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_long_held_threshold")]
    pub long_held_threshold_secs: u64,

    #[serde(default = "default_watchdog_period")]
    pub watchdog_period_secs: u64,

    /// Upper bound on how long a parked writer sleeps between checks
    #[serde(default = "default_write_lock_poll")]
    pub write_lock_poll_ms: u64,
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_backoff() -> u64 {
    3000
}

fn default_long_held_threshold() -> u64 {
    600
}

fn default_watchdog_period() -> u64 {
    600
}

fn default_write_lock_poll() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            long_held_threshold_secs: default_long_held_threshold(),
            watchdog_period_secs: default_watchdog_period(),
            write_lock_poll_ms: default_write_lock_poll(),
        }
    }
}

impl LockConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn long_held_threshold(&self) -> Duration {
        Duration::from_secs(self.long_held_threshold_secs)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_secs(self.watchdog_period_secs)
    }

    pub fn write_lock_poll(&self) -> Duration {
        Duration::from_millis(self.write_lock_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingConfig {
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_ms: u64,

    /// Concurrent listener deliveries
    #[serde(default = "available_cores")]
    pub listener_workers: usize,
}

fn default_exchange_timeout() -> u64 {
    30_000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_ms: default_exchange_timeout(),
            listener_workers: available_cores(),
        }
    }
}

impl MessagingConfig {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    /// How long a caller waits for an affinity call reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    60_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Concurrent tasks per nesting level
    #[serde(default = "available_cores")]
    pub pool_size: usize,

    /// Levels with a dedicated pool; deeper levels share the last one
    #[serde(default = "default_max_levels")]
    pub max_levels: usize,
}

fn default_max_levels() -> usize {
    16
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: available_cores(),
            max_levels: default_max_levels(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Listen address for the transfer socket
    #[serde(default = "default_transfer_bind")]
    pub bind_addr: String,

    /// Where fetched files land; system temp dir when unset
    pub temp_dir: Option<PathBuf>,

    /// How long a connecting peer gets to finish TLS and send its handle
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_transfer_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_handshake_timeout() -> u64 {
    10_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_transfer_bind(),
            temp_dir: None,
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl TransferConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
