//! Error types for the broker frame codec.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout reading from broker")]
    Timeout,

    /// Deadline expired after part of a frame was consumed.
    #[error("Timeout partway through a frame ({read} bytes read)")]
    PartialTimeout { read: usize },

    /// Reader hit EOF before the advertised payload length was satisfied.
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        expected: usize,
        actual: usize,
        partial: Vec<u8>,
    },

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

impl Error {
    /// True for an idle read deadline expiry, whether reported by the codec or
    /// the socket. [`Error::PartialTimeout`] is not idle.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
