//! Ownership loop
//!
//! Keeps one reverse connection running against whichever broker instance
//! currently owns the check, re-resolving check configuration on a fixed
//! interval and whenever a connection asks for it.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::check::{CheckProvider, ReverseConfigs};
use crate::config::ReverseSettings;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Reverse connection manager for one check
pub struct Reverse<P: CheckProvider> {
    provider: P,
    agent_address: String,
    settings: Arc<ReverseSettings>,
}

impl<P: CheckProvider> Reverse<P> {
    pub fn new(provider: P, agent_address: String, settings: Arc<ReverseSettings>) -> Self {
        Self {
            provider,
            agent_address,
            settings,
        }
    }

    /// Run until cancelled (`Ok`) or a fatal error.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut configs = ReverseConfigs::new();
        let mut last_refresh: Option<Instant> = None;
        let mut refresh = true;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let stale = last_refresh.map_or(true, |t| t.elapsed() > self.settings.refresh_interval);
            if refresh || stale {
                if let Err(e) = self.provider.refresh_check_config().await {
                    if e.is_fatal() {
                        error!(error = %e, "Refreshing check config");
                        return Err(e);
                    }
                    warn!(error = %e, "Refreshing check config, will retry");
                    self.pause(&cancel).await;
                    continue;
                }
                configs = self.provider.get_reverse_configs().map_err(|e| {
                    error!(error = %e, "Building reverse configs");
                    e
                })?;
                last_refresh = Some(Instant::now());
                refresh = false;
                debug!(brokers = configs.len(), "Check config refreshed");
            }

            let cn = match self.provider.find_primary_broker_instance(&configs).await {
                Ok(cn) => cn,
                Err(Error::NoOwnerFound) => {
                    // expected while brokers fail over
                    warn!("No owner found for check, retrying");
                    refresh = true;
                    self.pause(&cancel).await;
                    continue;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Finding primary broker instance");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Finding primary broker instance, retrying");
                    refresh = true;
                    self.pause(&cancel).await;
                    continue;
                }
            };

            let Some(config) = configs.get(&cn).cloned() else {
                warn!(cn = %cn, "No reverse config for owning broker, refreshing");
                refresh = true;
                self.pause(&cancel).await;
                continue;
            };

            info!(
                cn = %cn,
                instance_id = config.instance_id.as_deref().unwrap_or("-"),
                "Starting reverse connection to {}",
                config.broker_addr
            );
            let conn = Arc::new(Connection::new(
                config,
                self.agent_address.clone(),
                self.settings.clone(),
            ));
            let task = {
                let conn = conn.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move { conn.start(cancel).await })
            };

            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(cn = %cn, "Connection task failed: {}", e);
                    self.pause(&cancel).await;
                    continue;
                }
            };
            let state = conn.state().await;
            let since_last_request = conn.last_request().await.map(|t| t.elapsed());
            debug!(cn = %cn, state = %state, since_last_request = ?since_last_request, "Connection finished");

            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(cn = %cn, error = %e, "Reverse connection stopped");
                    return Err(e);
                }
                Err(e) if e.needs_refresh() => {
                    info!(cn = %cn, reason = %e, "Refreshing check config");
                    refresh = true;
                }
                Err(e) => {
                    warn!(cn = %cn, error = %e, "Reverse connection ended");
                }
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(self.settings.owner_retry_delay) => {}
        }
    }
}
