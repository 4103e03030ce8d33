//! Check and broker configuration.
//!
//! Resolves the reverse connection settings for every broker instance
//! serving the check, and which of them currently owns it.

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, info};

use crate::config::{BrokerConfig, CheckConfig, RevAgentConfig};
use crate::error::{Error, Result};

/// Reverse configs keyed by broker CN
pub type ReverseConfigs = HashMap<String, Arc<ReverseConfig>>;

/// Parsed reverse URL: `<scheme>://<host>:<port>/<path>[#<secret>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseUrl {
    pub host: String,
    pub path: String,
    pub secret: Option<String>,
}

impl ReverseUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("reverse url '{}' has no scheme", url)))?;
        if scheme.is_empty() {
            return Err(Error::Config(format!("reverse url '{}' has no scheme", url)));
        }

        let (rest, secret) = match rest.split_once('#') {
            Some((rest, frag)) if !frag.is_empty() => (rest, Some(frag.to_string())),
            Some((rest, _)) => (rest, None),
            None => (rest, None),
        };

        let (host, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("reverse url '{}' has no host", url)));
        }

        Ok(Self {
            host: host.to_string(),
            path: path.to_string(),
            secret,
        })
    }

    /// Introduction line sent once after the TLS handshake
    pub fn intro(&self) -> String {
        match &self.secret {
            Some(secret) => format!("REVERSE {}#{} HTTP/1.1\r\n\r\n", self.path, secret),
            None => format!("REVERSE {} HTTP/1.1\r\n\r\n", self.path),
        }
    }
}

/// TLS parameters for one broker instance
#[derive(Debug, Clone)]
pub struct BrokerTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Connection parameters for one broker instance
#[derive(Debug, Clone)]
pub struct ReverseConfig {
    pub cn: String,
    pub instance_id: Option<String>,
    pub broker_addr: String,
    pub reverse_url: ReverseUrl,
    /// None dials plain TCP
    pub tls: Option<BrokerTls>,
}

impl ReverseConfig {
    pub fn from_broker(broker: &BrokerConfig) -> Result<Self> {
        let reverse_url = ReverseUrl::parse(&broker.reverse_url)?;
        let tls = if broker.tls {
            let ca_file = broker.ca_file.as_deref().ok_or_else(|| {
                Error::Config(format!("broker '{}' uses TLS but has no ca_file", broker.cn))
            })?;
            Some(BrokerTls {
                config: tls_client_config(ca_file)?,
                server_name: ServerName::try_from(broker.cn.clone()).map_err(|e| {
                    Error::Config(format!("broker cn '{}' is not a valid server name: {}", broker.cn, e))
                })?,
            })
        } else {
            None
        };

        Ok(Self {
            cn: broker.cn.clone(),
            instance_id: broker.instance_id.clone(),
            broker_addr: broker.address.clone(),
            reverse_url,
            tls,
        })
    }
}

/// Build a client config trusting only the broker CA certificate(s) in `ca_file`
pub fn tls_client_config(ca_file: &Path) -> Result<Arc<ClientConfig>> {
    let file = File::open(ca_file)
        .map_err(|e| Error::Config(format!("opening {}: {}", ca_file.display(), e)))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| Error::Config(format!("reading {}: {}", ca_file.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("adding CA from {}: {}", ca_file.display(), e)))?;
    }
    if roots.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            ca_file.display()
        )));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Source of check configuration consumed by the ownership loop
pub trait CheckProvider: Send {
    /// Re-resolve the check; fails with [`Error::BundleNotActive`] when it is gone.
    fn refresh_check_config(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Reverse configs for every broker instance serving the check.
    fn get_reverse_configs(&self) -> Result<ReverseConfigs>;

    /// CN of the broker instance owning the check, or [`Error::NoOwnerFound`].
    fn find_primary_broker_instance(
        &self,
        configs: &ReverseConfigs,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Check provider backed by the `check` section of the configuration file
pub struct StaticCheck {
    path: Option<PathBuf>,
    check: CheckConfig,
}

impl StaticCheck {
    pub fn new(check: CheckConfig) -> Self {
        Self { path: None, check }
    }

    /// Provider that re-reads `path` on every refresh
    pub fn with_reload(path: PathBuf, check: CheckConfig) -> Self {
        Self {
            path: Some(path),
            check,
        }
    }
}

impl CheckProvider for StaticCheck {
    async fn refresh_check_config(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            let config = RevAgentConfig::load(path).map_err(|e| Error::Config(format!("{:#}", e)))?;
            self.check = config.check;
            debug!("Reloaded check config from {}", path.display());
        }
        if !self.check.active {
            return Err(Error::BundleNotActive);
        }
        Ok(())
    }

    fn get_reverse_configs(&self) -> Result<ReverseConfigs> {
        let mut configs = HashMap::with_capacity(self.check.brokers.len());
        for broker in &self.check.brokers {
            configs.insert(broker.cn.clone(), Arc::new(ReverseConfig::from_broker(broker)?));
        }
        Ok(configs)
    }

    async fn find_primary_broker_instance(&self, configs: &ReverseConfigs) -> Result<String> {
        if let Some(primary) = self
            .check
            .brokers
            .iter()
            .find(|b| b.primary && configs.contains_key(&b.cn))
        {
            info!(cn = %primary.cn, "Primary broker instance");
            return Ok(primary.cn.clone());
        }

        if !self.check.brokers.iter().any(|b| b.primary) && configs.len() == 1 {
            if let Some(cn) = configs.keys().next() {
                return Ok(cn.clone());
            }
        }

        Err(Error::NoOwnerFound)
    }
}
