//! Tunnel connection handles for the SkyConnect relay
//!
//! A `Tunnel` is the relay-side view of one agent connection: a queue of
//! outbound frames drained by the connection task, plus the table of
//! requests still waiting for their reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skyconnect_shared::protocol::{TunnelRequest, TunnelResponse};
use skyconnect_shared::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Represents an active tunnel connection
#[derive(Clone)]
pub struct Tunnel {
    /// Identity of the underlying connection
    pub id: Uuid,
    /// Subdomain for this tunnel
    pub subdomain: String,
    /// Channel to send frames to the tunnel agent
    tx: mpsc::Sender<String>,
    pub created_at: Instant,
    /// Pending request correlation map
    pending: Arc<DashMap<String, oneshot::Sender<TunnelResponse>>>,
}

impl Tunnel {
    pub fn new(subdomain: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subdomain,
            tx,
            created_at: Instant::now(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// True when both handles refer to the same connection.
    pub fn same_connection(&self, other: &Tunnel) -> bool {
        self.id == other.id
    }

    /// Send a request to the agent and wait for its matching reply.
    ///
    /// Only this request fails on timeout; the tunnel itself is left alone.
    pub async fn forward(&self, request: TunnelRequest, deadline: Duration) -> Result<TunnelResponse> {
        let id = request.id.clone();
        let frame = request.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // One deadline covers both queueing the frame and waiting for the reply.
        let exchange = async {
            self.tx
                .send(frame)
                .await
                .map_err(|_| Error::Transport(format!("tunnel {} is closed", self.subdomain)))?;
            rx.await.map_err(|_| {
                Error::Transport(format!("tunnel {} closed before replying", self.subdomain))
            })
        };

        let result = match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        };
        if result.is_err() {
            self.pending.remove(&id);
        }
        result
    }

    /// Hand an incoming response frame to the request waiting on it.
    pub fn complete(&self, frame: &[u8]) {
        let resp = match TunnelResponse::decode(frame) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Tunnel {}: undecodable frame: {}", self.subdomain, e);
                return;
            }
        };

        match self.pending.remove(&resp.id) {
            Some((_, waiter)) => {
                // The waiter may have given up in the meantime.
                let _ = waiter.send(resp);
            }
            None => debug!("Tunnel {}: no waiter for response {}", self.subdomain, resp.id),
        }
    }

    /// Drop every waiter; each observes the tunnel as closed.
    pub fn fail_pending(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: &str, body: &str) -> String {
        TunnelResponse {
            id: id.to_string(),
            status: 200,
            headers: vec![],
            body: Some(body.as_bytes().to_vec()),
            error: None,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("demo".into(), tx);

        let first = TunnelRequest::new("GET", "/a", vec![], None);
        let second = TunnelRequest::new("GET", "/b", vec![], None);
        let (first_id, second_id) = (first.id.clone(), second.id.clone());

        let t1 = tunnel.clone();
        let a = tokio::spawn(async move { t1.forward(first, Duration::from_secs(5)).await });
        let t2 = tunnel.clone();
        let b = tokio::spawn(async move { t2.forward(second, Duration::from_secs(5)).await });

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        tunnel.complete(reply(&second_id, "b").as_bytes());
        tunnel.complete(reply(&first_id, "a").as_bytes());

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.body.as_deref(), Some(&b"a"[..]));
        assert_eq!(b.body.as_deref(), Some(&b"b"[..]));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_entry() {
        let (tx, _rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("slow".into(), tx);

        let req = TunnelRequest::new("GET", "/", vec![], None);
        let err = tunnel.forward(req, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_is_bounded_by_deadline() {
        // Capacity one and never drained: the second frame cannot be queued.
        let (tx, _rx) = mpsc::channel(1);
        let tunnel = Tunnel::new("stalled".into(), tx);
        let deadline = Duration::from_millis(50);

        let first = tunnel
            .forward(TunnelRequest::new("GET", "/a", vec![], None), deadline)
            .await
            .unwrap_err();
        assert!(matches!(first, Error::Timeout(_)));

        let second = timeout(
            Duration::from_secs(2),
            tunnel.forward(TunnelRequest::new("GET", "/b", vec![], None), deadline),
        )
        .await
        .expect("forward outlived its deadline")
        .unwrap_err();
        assert!(matches!(second, Error::Timeout(d) if d == deadline));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let tunnel = Tunnel::new("gone".into(), tx);

        let req = TunnelRequest::new("GET", "/", vec![], None);
        let err = tunnel.forward(req, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_wakes_waiters() {
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("demo".into(), tx);

        let t = tunnel.clone();
        let waiter = tokio::spawn(async move {
            t.forward(TunnelRequest::new("GET", "/", vec![], None), Duration::from_secs(5))
                .await
        });

        rx.recv().await.unwrap();
        assert_eq!(tunnel.fail_pending(), 1);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_late_or_garbled_frames_are_ignored() {
        let (tx, _rx) = mpsc::channel(1);
        let tunnel = Tunnel::new("demo".into(), tx);
        tunnel.complete(reply("unknown", "x").as_bytes());
        tunnel.complete(b"not json");
        assert_eq!(tunnel.pending_count(), 0);
    }
}
