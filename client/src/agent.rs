//! Tunnel agent: holds one connection to the relay and replays each
//! forwarded request against the local backend, one at a time.

use anyhow::Result;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use skyconnect_shared::protocol::TunnelRequest;
use skyconnect_shared::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::proxy::LocalBackend;

pub type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a tunnel session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The relay closed the connection
    Remote,
    /// Ctrl+C
    Interrupted,
}

/// Run the agent until the tunnel closes, reconnecting if configured to.
pub async fn run(config: &AgentConfig) -> Result<()> {
    let backend = LocalBackend::new(&config.local, config.timeout())?;

    loop {
        let outcome = match connect(config).await {
            Ok(ws) => {
                print_banner(config);
                serve(ws, &backend).await
            }
            Err(e) => Err(e),
        };

        let delay = match (outcome, config.reconnect_delay()) {
            (Ok(CloseReason::Interrupted), _) | (Ok(CloseReason::Remote), None) => return Ok(()),
            (Err(e), None) => return Err(e.into()),
            (Ok(CloseReason::Remote), Some(delay)) => {
                info!("Relay closed the tunnel. Reconnecting in {:?}...", delay);
                delay
            }
            (Err(e), Some(delay)) => {
                error!("Tunnel error: {}. Reconnecting in {:?}...", e, delay);
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Dial the relay's registration endpoint.
pub async fn connect(config: &AgentConfig) -> Result<RelayStream, Error> {
    let url = config.registration_url()?;
    info!("Connecting to relay: {}", url);

    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::ConnectionSetup(format!("{}: {}", url, e)))?;
    info!("Tunnel registered as {:?}", config.subdomain);
    Ok(ws)
}

/// Receive, forward, reply; repeat until the connection ends.
pub async fn serve<S>(ws: S, backend: &LocalBackend) -> Result<CloseReason, Error>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(text.as_bytes(), backend, &mut write).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_frame(&data, backend, &mut write).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Connection closed");
                        return Ok(CloseReason::Remote);
                    }
                    Some(Err(e)) => {
                        return Err(Error::Transport(format!("read failed: {}", e)));
                    }
                    // tungstenite queues the pong itself and flushes it on the next read
                    Some(Ok(_)) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                let _ = write.send(Message::Close(None)).await;
                return Ok(CloseReason::Interrupted);
            }
        }
    }
}

async fn handle_frame<S>(frame: &[u8], backend: &LocalBackend, write: &mut S) -> Result<(), Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let request = match TunnelRequest::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            // Without an id there is nobody to answer.
            warn!("Ignoring undecodable frame: {}", e);
            return Ok(());
        }
    };

    info!("Proxying {} {} to {}", request.method, request.path, backend.base());
    let response = backend.forward(&request).await;

    write
        .send(Message::Text(response.encode()?))
        .await
        .map_err(|e| Error::Transport(format!("Failed to send response: {}", e)))
}

fn print_banner(config: &AgentConfig) {
    let subdomain = if config.subdomain.is_empty() {
        "(assigned by relay)"
    } else {
        config.subdomain.as_str()
    };
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  SkyConnect tunnel active                                    ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Subdomain: {:<48} ║", subdomain);
    println!("║  Local:     {:<48} ║", config.local);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
}
