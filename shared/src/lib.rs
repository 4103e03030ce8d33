//! RevAgent Shared Library
//!
//! Broker wire protocol: frame layout, command names and the async codec.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
