//! Error types for the reverse connection agent.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connecting to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timeout connecting to {0}")]
    DialTimeout(String),

    #[error("TLS handshake with {addr}: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to write intro to {addr}: {source}")]
    Intro {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Max connection attempts ({0}) reached")]
    MaxAttempts(u32),

    #[error("Check configuration refresh needed: {0}")]
    RefreshNeeded(String),

    #[error("No owner found for check")]
    NoOwnerFound,

    #[error("Check bundle not active")]
    BundleNotActive,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Fetching metrics from {addr}: {source}")]
    Fetch {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Metric fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("Sending metrics: {0}")]
    Send(#[source] io::Error),

    #[error("Fatal command error: {0}")]
    FatalCommand(String),
}

impl Error {
    /// Failures `Connection::connect` retries in place with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. } | Error::DialTimeout(_) | Error::Tls { .. } | Error::Intro { .. }
        )
    }

    /// Failures that stop the reverse feature for the check.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MaxAttempts(_)
                | Error::BundleNotActive
                | Error::Config(_)
                | Error::FatalCommand(_)
        )
    }

    /// Metric fetch against an address that cannot be resolved to a socket address.
    pub fn is_invalid_address(&self) -> bool {
        matches!(self, Error::Fetch { source, .. } if source.kind() == io::ErrorKind::InvalidInput)
    }

    /// Failures the ownership loop answers by re-resolving check configuration.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Error::RefreshNeeded(_) | Error::NoOwnerFound)
    }
}
