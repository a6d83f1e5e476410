//! Subdomain registry for the SkyConnect relay

use std::collections::HashMap;

use skyconnect_shared::protocol::generate_subdomain;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::tunnel::Tunnel;

/// Maps subdomains to their live tunnel connection
#[derive(Default)]
pub struct Registry {
    tunnels: RwLock<HashMap<String, Tunnel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `subdomain` to a new tunnel, replacing any previous binding.
    ///
    /// An empty subdomain gets a generated name that is unused at the time
    /// of insertion. The replaced tunnel, if any, is left open.
    pub async fn register(&self, subdomain: &str, tx: mpsc::Sender<String>) -> Tunnel {
        let mut tunnels = self.tunnels.write().await;

        let subdomain = if subdomain.is_empty() {
            loop {
                let candidate = generate_subdomain();
                if !tunnels.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            subdomain.to_string()
        };

        let tunnel = Tunnel::new(subdomain.clone(), tx);
        if let Some(previous) = tunnels.insert(subdomain, tunnel.clone()) {
            debug!("Tunnel {} replaced connection {}", previous.subdomain, previous.id);
        }
        tunnel
    }

    pub async fn lookup(&self, subdomain: &str) -> Option<Tunnel> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(subdomain).cloned()
    }

    /// Remove the binding only if it still points at this connection.
    pub async fn deregister(&self, tunnel: &Tunnel) -> bool {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get(&tunnel.subdomain) {
            Some(current) if current.same_connection(tunnel) => {
                tunnels.remove(&tunnel.subdomain);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn subdomains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Derive the routing key from a `Host` header value.
///
/// With a base domain, `app.example.com[:port]` routes to `app`. Anything
/// else routes on the host exactly as sent.
pub fn subdomain_from_host(host: Option<&str>, base_domain: Option<&str>) -> String {
    let Some(host) = host else {
        return String::new();
    };

    if let Some(domain) = base_domain {
        let bare = host.rsplit_once(':').map_or(host, |(name, _port)| name);
        if let Some(label) = bare.strip_suffix(domain).and_then(|rest| rest.strip_suffix('.')) {
            if !label.is_empty() {
                return label.to_string();
            }
        }
    }

    host.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> mpsc::Sender<String> {
        mpsc::channel(1).0
    }

    #[tokio::test]
    async fn test_distinct_subdomains_are_independent() {
        let registry = Registry::new();
        let a = registry.register("a", channel()).await;
        let b = registry.register("b", channel()).await;

        assert!(registry.lookup("a").await.unwrap().same_connection(&a));
        assert!(registry.lookup("b").await.unwrap().same_connection(&b));

        registry.register("a", channel()).await;
        assert!(registry.lookup("b").await.unwrap().same_connection(&b));
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let registry = Registry::new();
        let old = registry.register("demo", channel()).await;
        let new = registry.register("demo", channel()).await;

        let current = registry.lookup("demo").await.unwrap();
        assert!(current.same_connection(&new));
        assert!(!current.same_connection(&old));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let registry = Registry::new();
        assert!(registry.lookup("nope").await.is_none());
        assert!(registry.lookup("").await.is_none());
    }

    #[tokio::test]
    async fn test_subdomains_are_case_sensitive() {
        let registry = Registry::new();
        registry.register("Demo", channel()).await;
        assert!(registry.lookup("demo").await.is_none());
        assert!(registry.lookup("Demo").await.is_some());
    }

    #[tokio::test]
    async fn test_empty_subdomain_gets_generated_name() {
        let registry = Registry::new();
        let a = registry.register("", channel()).await;
        let b = registry.register("", channel()).await;

        assert!(!a.subdomain.is_empty());
        assert_ne!(a.subdomain, b.subdomain);
        assert_eq!(registry.len().await, 2);
        assert!(registry.lookup("").await.is_none());
    }

    #[tokio::test]
    async fn test_deregister_only_removes_current_connection() {
        let registry = Registry::new();
        let old = registry.register("demo", channel()).await;
        let new = registry.register("demo", channel()).await;

        assert!(!registry.deregister(&old).await);
        assert!(registry.lookup("demo").await.unwrap().same_connection(&new));

        assert!(registry.deregister(&new).await);
        assert!(registry.lookup("demo").await.is_none());
        assert_eq!(registry.subdomains().await, Vec::<String>::new());
    }

    #[test]
    fn test_subdomain_from_host() {
        assert_eq!(subdomain_from_host(Some("demo"), None), "demo");
        assert_eq!(subdomain_from_host(Some("localhost:8080"), None), "localhost:8080");
        assert_eq!(subdomain_from_host(None, None), "");

        let domain = Some("tunnel.dev");
        assert_eq!(subdomain_from_host(Some("app.tunnel.dev"), domain), "app");
        assert_eq!(subdomain_from_host(Some("app.tunnel.dev:8080"), domain), "app");
        assert_eq!(subdomain_from_host(Some("tunnel.dev"), domain), "tunnel.dev");
        assert_eq!(subdomain_from_host(Some("other.org"), domain), "other.org");
    }
}
