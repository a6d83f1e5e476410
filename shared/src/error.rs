//! Error types for SkyConnect.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Dial or upgrade failed; fatal to the side that attempted it
    #[error("Connection setup failed: {0}")]
    ConnectionSetup(String),

    /// No tunnel is registered for the subdomain
    #[error("Subdomain not found: {0}")]
    RegistryMiss(String),

    /// Send or receive failed on an established tunnel
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
