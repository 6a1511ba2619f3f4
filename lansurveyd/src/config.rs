use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{DEFAULT_DOMAIN, META_QUERY_TYPE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub arp: ArpConfig,
    #[serde(default)]
    pub upnp: UpnpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_browse_interval")]
    pub browse_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Restrict mDNS to a single interface
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArpConfig {
    /// Interface used for probes; first usable one when unset
    pub interface: Option<String>,
    #[serde(default = "default_arp_attempts")]
    pub attempts: u32,
    #[serde(default = "default_arp_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpnpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay before the one-shot device report
    #[serde(default = "default_settle")]
    pub settle_secs: u64,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_search_interval")]
    pub search_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// HTTP view is only served when set
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
}

fn default_service_type() -> String {
    META_QUERY_TYPE.to_string()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_browse_interval() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_arp_attempts() -> u32 {
    3
}

fn default_arp_attempt_timeout() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_settle() -> u64 {
    10
}

fn default_search_timeout() -> u64 {
    3
}

fn default_search_interval() -> u64 {
    30
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            domain: default_domain(),
            browse_interval_ms: default_browse_interval(),
            channel_capacity: default_channel_capacity(),
            interface: None,
        }
    }
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            interface: None,
            attempts: default_arp_attempts(),
            attempt_timeout_ms: default_arp_attempt_timeout(),
        }
    }
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            settle_secs: default_settle(),
            search_timeout_secs: default_search_timeout(),
            search_interval_secs: default_search_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn browse_interval(&self) -> Duration {
        Duration::from_millis(self.browse_interval_ms)
    }
}

impl ArpConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Zero would stall or panic the channel, the re-browse timer or the prober
    fn validate(&self) -> Result<()> {
        if self.discovery.channel_capacity == 0 {
            bail!("discovery.channel_capacity must be greater than zero");
        }
        if self.discovery.browse_interval_ms == 0 {
            bail!("discovery.browse_interval_ms must be greater than zero");
        }
        if self.arp.attempts == 0 {
            bail!("arp.attempts must be greater than zero");
        }
        Ok(())
    }
}
