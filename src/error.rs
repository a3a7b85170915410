//! Error types for tblocker.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TblockerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Invalid block duration: {0}")]
    InvalidDuration(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Conntrack error: {0}")]
    Conntrack(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Permission denied: {0}")]
    Permission(String),
}
