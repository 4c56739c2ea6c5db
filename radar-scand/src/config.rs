use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_DEADLINE_SECS, DEFAULT_MDNS_SERVICE_TYPES};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub upnp: UpnpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub public_network: PublicNetworkConfig,
}

/// Lifecycle knobs handed to the scan coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
    /// How long probes get to release their sockets after cancellation
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Also follow the DNS-SD meta-query and browse every announced type
    #[serde(default = "default_true")]
    pub browse_all: bool,
    /// Restrict the daemon to one interface (name or address)
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpnpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_search_targets")]
    pub search_targets: Vec<String>,
    #[serde(default = "default_mx")]
    pub mx: u8,
    #[serde(default = "default_search_interval")]
    pub search_interval_secs: u64,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    #[serde(default = "default_true")]
    pub fetch_descriptions: bool,
    #[serde(default = "default_description_timeout")]
    pub description_timeout_ms: u64,
    #[serde(default = "default_max_recv_errors")]
    pub max_recv_errors: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicNetworkConfig {
    #[serde(default = "default_public_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_public_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_deadline() -> u64 {
    DEFAULT_DEADLINE_SECS
}

fn default_grace_period() -> u64 {
    300
}

fn default_progress_interval() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_service_types() -> Vec<String> {
    DEFAULT_MDNS_SERVICE_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_search_targets() -> Vec<String> {
    vec!["upnp:rootdevice".to_string(), "ssdp:all".to_string()]
}

fn default_mx() -> u8 {
    2
}

fn default_search_interval() -> u64 {
    10
}

fn default_multicast_ttl() -> u32 {
    2
}

fn default_description_timeout() -> u64 {
    2000
}

fn default_max_recv_errors() -> u32 {
    8
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

fn default_public_endpoint() -> String {
    "http://ip-api.com/json/?fields=status,message,country,regionName,city,zip,lat,lon,timezone,isp,org,as,proxy,hosting,query".to_string()
}

fn default_public_timeout() -> u64 {
    5000
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline(),
            grace_period_ms: default_grace_period(),
            progress_interval_ms: default_progress_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ScanConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_types: default_service_types(),
            browse_all: true,
            interface: None,
        }
    }
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_targets: default_search_targets(),
            mx: default_mx(),
            search_interval_secs: default_search_interval(),
            multicast_ttl: default_multicast_ttl(),
            fetch_descriptions: true,
            description_timeout_ms: default_description_timeout(),
            max_recv_errors: default_max_recv_errors(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for PublicNetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_public_endpoint(),
            timeout_ms: default_public_timeout(),
            resolv_conf: default_resolv_conf(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
