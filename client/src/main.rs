use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

mod agent;
mod config;
mod proxy;

use config::AgentConfig;

#[derive(Parser)]
#[command(name = "skyconnect")]
#[command(author = "SkyConnect Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a SkyConnect relay", long_about = None)]
struct Cli {
    /// Config file (defaults to skyconnect.yml in the working or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server URL
    #[arg(short, long)]
    relay: Option<String>,

    /// Subdomain to register (empty lets the relay choose)
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Base URL of the local service
    #[arg(short, long)]
    local: Option<String>,

    /// Timeout for each local request, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Reconnect after this many seconds instead of exiting
    #[arg(long, value_name = "SECS")]
    reconnect: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<AgentConfig> {
        let mut config = match self.config.or_else(AgentConfig::find_config) {
            Some(path) => {
                info!("Using config file {}", path.display());
                AgentConfig::load(&path)?
            }
            None => AgentConfig::default(),
        };

        if let Some(relay) = self.relay {
            config.relay = relay;
        }
        if let Some(subdomain) = self.subdomain {
            config.subdomain = subdomain;
        }
        if let Some(local) = self.local {
            config.local = local;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if self.reconnect.is_some() {
            config.reconnect_delay_secs = self.reconnect;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config = cli.into_config()?;
    agent::run(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyconnect.yml");
        let cli = Cli::parse_from(["skyconnect", "--config", path.to_str().unwrap()]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyconnect.yml");
        std::fs::write(
            &path,
            "relay: ws://relay.example:9000\nsubdomain: from-file\nlocal: http://127.0.0.1:5000\ntimeout_secs: 7\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "skyconnect",
            "--config",
            path.to_str().unwrap(),
            "--subdomain",
            "demo",
            "--reconnect",
            "3",
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(
            config,
            AgentConfig {
                relay: "ws://relay.example:9000".into(),
                subdomain: "demo".into(),
                local: "http://127.0.0.1:5000".into(),
                timeout_secs: 7,
                reconnect_delay_secs: Some(3),
            }
        );
    }

    #[test]
    fn test_config_file_alone_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyconnect.yml");
        std::fs::write(&path, "local: http://127.0.0.1:5000\nreconnect_delay_secs: 9\n").unwrap();

        let cli = Cli::parse_from(["skyconnect", "-c", path.to_str().unwrap()]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.local, "http://127.0.0.1:5000");
        assert_eq!(config.relay, AgentConfig::default().relay);
        assert_eq!(config.reconnect_delay_secs, Some(9));
    }
}
