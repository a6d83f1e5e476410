//! Configuration for the SkyConnect agent
//!
//! Values come from an optional `skyconnect.yml` and are then overridden
//! by command-line flags.

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use skyconnect_shared::protocol::{CONNECT_PATH, SUBDOMAIN_PARAM};
use skyconnect_shared::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay base URL (ws:// or wss://)
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Subdomain to register; empty lets the relay pick one
    #[serde(default = "default_subdomain")]
    pub subdomain: String,

    /// Base URL of the local backend
    #[serde(default = "default_local")]
    pub local: String,

    /// Timeout for each local backend call, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Reconnect after this many seconds instead of exiting
    #[serde(default)]
    pub reconnect_delay_secs: Option<u64>,
}

fn default_relay() -> String {
    "ws://localhost:8080".to_string()
}

/// Matches the Host header a browser sends to a relay on localhost.
fn default_subdomain() -> String {
    "localhost:8080".to_string()
}

fn default_local() -> String {
    "http://localhost:3000".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            subdomain: default_subdomain(),
            local: default_local(),
            timeout_secs: default_timeout(),
            reconnect_delay_secs: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.registration_url()?;

        let local = Url::parse(&self.local)
            .with_context(|| format!("Invalid local backend URL: {}", self.local))?;
        if !matches!(local.scheme(), "http" | "https") {
            anyhow::bail!("Local backend must be http or https, got '{}'", local.scheme());
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("Timeout must be greater than zero");
        }
        Ok(())
    }

    /// `<relay>/connect?subdomain=<subdomain>`, with the subdomain URL-encoded.
    pub fn registration_url(&self) -> skyconnect_shared::Result<Url> {
        let mut url = Url::parse(&self.relay)
            .map_err(|e| Error::ConnectionSetup(format!("invalid relay URL {}: {}", self.relay, e)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::ConnectionSetup(format!("unsupported relay scheme '{}'", other)))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::ConnectionSetup(format!("cannot use scheme {} for {}", scheme, self.relay)))?;

        url.set_path(CONNECT_PATH);
        url.query_pairs_mut()
            .clear()
            .append_pair(SUBDOMAIN_PARAM, &self.subdomain);
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay_secs.map(Duration::from_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "skyconnect.yml",
            "skyconnect.yaml",
            ".skyconnect.yml",
            ".skyconnect.yaml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        let home = dirs::home_dir()?;
        candidates
            .iter()
            .map(|name| home.join(name))
            .find(|path| path.exists())
    }
}
