//! provmon.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::duration::parse_duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor: MonitorSection,
    pub selector: SelectorSection,
    pub peers: PeersSection,
    pub probe: ProbeSection,
    pub provision: ProvisionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub name: String,
    /// Advertised host address. Peers on the same host are avoided as backups.
    pub host: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            name: "provmon".to_string(),
            host: "127.0.0.1".to_string(),
            api_port: 9010,
            data_dir: PathBuf::from("/var/lib/provmon"),
        }
    }
}

/// Which candidate ordering the resource registry uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RoundRobin,
    #[default]
    LeastLoaded,
    CostOrdered,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersSection {
    /// `host:port` of sibling monitors to discover at startup.
    pub seeds: Vec<String>,
    pub discovery_interval: String,
    pub min_protocol_major: u64,
    /// Per-peer event queue capacity.
    pub event_queue_depth: usize,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            discovery_interval: "10s".to_string(),
            min_protocol_major: 1,
            event_queue_depth: 256,
        }
    }
}

/// Liveness strategy used for peer monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// Plain TCP connect to the peer's API port.
    #[default]
    Heartbeat,
    /// HTTP GET against the peer's ping endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub kind: ProbeKind,
    pub interval: String,
    pub timeout: String,
    pub unreachable_threshold: u32,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Heartbeat,
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            unreachable_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSection {
    pub retry_interval: String,
    pub redeploy_delay: String,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            retry_interval: "30s".to_string(),
            redeploy_delay: "0s".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would parse but can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Periods drive tickers and must be non-zero; a zero redeploy delay
        // means "now".
        for (field, value, periodic) in [
            ("peers.discovery_interval", &self.peers.discovery_interval, true),
            ("probe.interval", &self.probe.interval, true),
            ("probe.timeout", &self.probe.timeout, true),
            ("provision.retry_interval", &self.provision.retry_interval, true),
            ("provision.redeploy_delay", &self.provision.redeploy_delay, false),
        ] {
            let usable = parse_duration(value).is_some_and(|d| !(periodic && d.is_zero()));
            if !usable {
                return Err(ConfigError::Invalid {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.probe.unreachable_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "probe.unreachable_threshold",
                value: "0".to_string(),
            });
        }
        if self.peers.event_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "peers.event_queue_depth",
                value: "0".to_string(),
            });
        }
        for seed in &self.peers.seeds {
            if !seed.contains(':') {
                warn!(%seed, "peer seed has no port, the default api port will be assumed");
            }
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        period(&self.peers.discovery_interval, Duration::from_secs(10))
    }

    pub fn probe_interval(&self) -> Duration {
        period(&self.probe.interval, Duration::from_secs(5))
    }

    pub fn probe_timeout(&self) -> Duration {
        period(&self.probe.timeout, Duration::from_secs(2))
    }

    pub fn retry_interval(&self) -> Duration {
        period(&self.provision.retry_interval, Duration::from_secs(30))
    }

    pub fn redeploy_delay(&self) -> Duration {
        parse_duration(&self.provision.redeploy_delay).unwrap_or_default()
    }

    /// `host:port` this monitor advertises to its peers.
    pub fn advertised_endpoint(&self) -> String {
        format!("{}:{}", self.monitor.host, self.monitor.api_port)
    }

    /// Seeds with the default api port filled in where missing.
    pub fn seed_endpoints(&self) -> Vec<String> {
        self.peers
            .seeds
            .iter()
            .map(|s| {
                if s.contains(':') {
                    s.clone()
                } else {
                    format!("{s}:{}", self.monitor.api_port)
                }
            })
            .collect()
    }
}

/// A ticker period; zero or unparsable falls back to `default`.
fn period(value: &str, default: Duration) -> Duration {
    parse_duration(value).filter(|d| !d.is_zero()).unwrap_or(default)
}
