//! Configuration file parser for RevAgent
//!
//! Supports revagent.yml with the local agent address, reverse
//! connection tunables and the broker instances serving the check.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

use crate::check::ReverseUrl;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevAgentConfig {
    /// Local listener CONNECT requests are relayed to
    #[serde(default = "default_agent_address")]
    pub agent_address: String,

    /// Reverse connection tunables
    #[serde(default)]
    pub reverse: ReverseTuning,

    /// Check and the broker instances serving it
    pub check: CheckConfig,
}

/// Reverse connection tunables, as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseTuning {
    #[serde(default = "default_comm_timeout")]
    pub comm_timeout_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_metric_timeout")]
    pub metric_timeout_secs: u64,

    /// Consecutive read timeouts absorbed before resetting the connection
    #[serde(default = "default_max_comm_timeouts")]
    pub max_comm_timeouts: u32,

    /// Connect attempts before giving up (-1 = unlimited)
    #[serde(default = "default_max_conn_retry")]
    pub max_conn_retry: i64,

    /// Every N failed attempts force a check config refresh (0 = never)
    #[serde(default = "default_config_retry_limit")]
    pub config_retry_limit: u32,

    /// Recycle the connection after this channel id (-1 = unlimited)
    #[serde(default = "default_max_requests")]
    pub max_requests: i64,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_owner_retry_delay")]
    pub owner_retry_delay_secs: u64,
}

impl Default for ReverseTuning {
    fn default() -> Self {
        Self {
            comm_timeout_secs: default_comm_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            metric_timeout_secs: default_metric_timeout(),
            max_comm_timeouts: default_max_comm_timeouts(),
            max_conn_retry: default_max_conn_retry(),
            config_retry_limit: default_config_retry_limit(),
            max_requests: default_max_requests(),
            refresh_interval_secs: default_refresh_interval(),
            owner_retry_delay_secs: default_owner_retry_delay(),
        }
    }
}

/// Check definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Inactive checks stop the reverse feature
    #[serde(default = "default_true")]
    pub active: bool,

    /// Broker instances in the check's cluster
    #[serde(default)]
    pub brokers: Vec<BrokerConfig>,
}

/// Single broker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Certificate CN, also used as the TLS server name
    pub cn: String,

    /// Broker host:port
    pub address: String,

    /// e.g. mtev_reverse://10.0.0.1:43191/check/<uuid>#<secret>
    pub reverse_url: String,

    /// PEM file with the broker CA certificate
    pub ca_file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub tls: bool,

    pub instance_id: Option<String>,

    /// Marks the instance owning the check
    #[serde(default)]
    pub primary: bool,
}

/// Runtime view of [`ReverseTuning`]
#[derive(Debug, Clone)]
pub struct ReverseSettings {
    pub comm_timeout: Duration,
    pub dial_timeout: Duration,
    pub metric_timeout: Duration,
    pub max_comm_timeouts: u32,
    pub max_conn_retry: Option<u32>,
    pub config_retry_limit: u32,
    pub max_requests: Option<u16>,
    pub refresh_interval: Duration,
    pub owner_retry_delay: Duration,
}

impl Default for ReverseSettings {
    fn default() -> Self {
        ReverseTuning::default().settings()
    }
}

impl ReverseTuning {
    pub fn settings(&self) -> ReverseSettings {
        ReverseSettings {
            comm_timeout: Duration::from_secs(self.comm_timeout_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            metric_timeout: Duration::from_secs(self.metric_timeout_secs),
            max_comm_timeouts: self.max_comm_timeouts,
            max_conn_retry: u32::try_from(self.max_conn_retry).ok(),
            config_retry_limit: self.config_retry_limit,
            max_requests: u16::try_from(self.max_requests).ok(),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            owner_retry_delay: Duration::from_secs(self.owner_retry_delay_secs),
        }
    }
}

fn default_agent_address() -> String {
    "127.0.0.1:2609".to_string()
}

fn default_comm_timeout() -> u64 {
    10
}

fn default_dial_timeout() -> u64 {
    15
}

// under the broker's polling interval
fn default_metric_timeout() -> u64 {
    50
}

fn default_max_comm_timeouts() -> u32 {
    5
}

fn default_max_conn_retry() -> i64 {
    10
}

fn default_config_retry_limit() -> u32 {
    5
}

fn default_max_requests() -> i64 {
    -1
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_owner_retry_delay() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl RevAgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RevAgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent_address.is_empty() {
            anyhow::bail!("agent_address cannot be empty");
        }
        if self.reverse.comm_timeout_secs == 0
            || self.reverse.dial_timeout_secs == 0
            || self.reverse.metric_timeout_secs == 0
        {
            anyhow::bail!("Reverse timeouts must be greater than zero");
        }

        if self.check.brokers.is_empty() {
            anyhow::bail!("No brokers defined in configuration");
        }

        let mut seen = HashSet::new();
        for broker in &self.check.brokers {
            if broker.cn.is_empty() {
                anyhow::bail!("Broker cn cannot be empty");
            }
            if !seen.insert(broker.cn.as_str()) {
                anyhow::bail!("Duplicate broker cn '{}'", broker.cn);
            }
            if broker.address.is_empty() {
                anyhow::bail!("Broker '{}' has no address", broker.cn);
            }
            if broker.tls && broker.ca_file.is_none() {
                anyhow::bail!("Broker '{}' uses TLS but has no ca_file", broker.cn);
            }
            ReverseUrl::parse(&broker.reverse_url)
                .with_context(|| format!("Invalid reverse_url for broker '{}'", broker.cn))?;
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "revagent.yml",
            "revagent.yaml",
            ".revagent.yml",
            ".revagent.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
