//! Relay configuration, read from the environment.

use anyhow::{Context, Result};
use skyconnect_shared::protocol::DEFAULT_RELAY_PORT;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Base domain stripped from Host headers when routing
    pub domain: Option<String>,
    /// How long an external request waits for its tunnel's reply
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub max_body_bytes: usize,
    pub forwarded_headers: bool,
    /// Outbound frame queue depth per tunnel
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            domain: None,
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            forwarded_headers: true,
            channel_capacity: 100,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys keep their defaults.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(listen) = get("SKYCONNECT_LISTEN") {
            config.listen = listen
                .parse()
                .with_context(|| format!("Invalid SKYCONNECT_LISTEN: {}", listen))?;
        }
        if let Some(port) = get("PORT") {
            let port: u16 = port.parse().with_context(|| format!("Invalid PORT: {}", port))?;
            config.listen.set_port(port);
        }
        config.domain = get("SKYCONNECT_DOMAIN")
            .map(|d| d.trim().trim_start_matches('.').to_string())
            .filter(|d| !d.is_empty());

        if let Some(secs) = get("SKYCONNECT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_positive("SKYCONNECT_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("SKYCONNECT_PING_INTERVAL_SECS") {
            config.ping_interval = Duration::from_secs(parse_positive("SKYCONNECT_PING_INTERVAL_SECS", &secs)?);
        }
        if let Some(bytes) = get("SKYCONNECT_MAX_BODY_BYTES") {
            config.max_body_bytes = bytes
                .parse()
                .with_context(|| format!("Invalid SKYCONNECT_MAX_BODY_BYTES: {}", bytes))?;
        }
        if let Some(flag) = get("SKYCONNECT_FORWARDED_HEADERS") {
            config.forwarded_headers = match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => anyhow::bail!("Invalid SKYCONNECT_FORWARDED_HEADERS: {}", other),
            };
        }

        Ok(config)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    let n: u64 = value
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))?;
    if n == 0 {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(n)
}
