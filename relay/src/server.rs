//! HTTP surface of the relay: tunnel registration and public proxying.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header::HOST, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use http_body_util::LengthLimitError;
use hyper::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use skyconnect_shared::protocol::{TunnelRequest, TunnelResponse, CONNECT_PATH};
use skyconnect_shared::Error;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::headers::HeaderRewriter;
use crate::metrics::Metrics;
use crate::registry::{subdomain_from_host, Registry};

pub const HEALTH_PATH: &str = "/_relay/health";
pub const METRICS_PATH: &str = "/_relay/metrics";
pub const TUNNELS_PATH: &str = "/_relay/tunnels";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub metrics: Metrics,
    pub config: Arc<RelayConfig>,
    rewriter: HeaderRewriter,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let rewriter = HeaderRewriter {
            inject_forwarded: config.forwarded_headers,
        };
        Self {
            registry: Arc::new(Registry::new()),
            metrics: Metrics::new(),
            config: Arc::new(config),
            rewriter,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(CONNECT_PATH, get(connect_handler))
        .route(HEALTH_PATH, get(|| async { "OK" }))
        .route(METRICS_PATH, get(metrics_handler))
        .route(TUNNELS_PATH, get(tunnels_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    subdomain: String,
}

async fn connect_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.subdomain))
}

/// Owns one agent connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState, requested: String) {
    let (tx, mut rx) = mpsc::channel::<String>(state.config.channel_capacity);
    let tunnel = state.registry.register(&requested, tx).await;
    state.metrics.tunnel_opened();
    info!("Tunnel active: {} (connection {})", tunnel.subdomain, tunnel.id);

    let (mut sender, mut receiver) = socket.split();
    let ping_every = state.config.ping_interval;
    let mut keepalive = interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => tunnel.complete(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => tunnel.complete(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Tunnel {}: read failed: {}", tunnel.subdomain, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = sender.send(Message::Text(frame)).await {
                    warn!("Tunnel {}: write failed: {}", tunnel.subdomain, e);
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Close the queue first so late senders fail fast instead of waiting.
    rx.close();
    let removed = state.registry.deregister(&tunnel).await;
    let failed = tunnel.fail_pending();
    state.metrics.tunnel_closed();
    info!(
        "Tunnel {} closed (deregistered: {}, pending failed: {}, up {:?})",
        tunnel.subdomain,
        removed,
        failed,
        tunnel.created_at.elapsed()
    );
}

async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let subdomain = subdomain_from_host(
        (!host.is_empty()).then_some(host.as_str()),
        state.config.domain.as_deref(),
    );

    // Clone the tunnel out; the registry lock is not held past this point.
    let Some(tunnel) = state.registry.lookup(&subdomain).await else {
        warn!("No tunnel: {:?}", subdomain);
        let err = Error::RegistryMiss(subdomain.clone());
        return finish(&state, None, started, 0, error_response(&err)).await;
    };

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let head = req.method() == Method::HEAD;
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    let mut headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();
    state
        .rewriter
        .rewrite_request(&mut headers, client_ip.as_deref(), &host);

    let body = match axum::body::to_bytes(req.into_body(), state.config.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Rejecting request body for {}: {}", subdomain, e);
            let resp = body_error_response(&e);
            return finish(&state, Some(&tunnel.subdomain), started, 0, resp).await;
        }
    };
    let bytes_in = body.len() as u64;
    let body = (!body.is_empty()).then(|| body.to_vec());

    let request = TunnelRequest::new(method, path, headers, body);
    debug!(
        "Forwarding {} {} to {} as {} ({} already pending)",
        request.method,
        request.path,
        subdomain,
        request.id,
        tunnel.pending_count()
    );

    let response = match tunnel.forward(request, state.config.request_timeout).await {
        Ok(resp) => {
            if let Some(reason) = &resp.error {
                warn!("Tunnel {} reported backend failure: {}", subdomain, reason);
            }
            into_http(resp, &state.rewriter, head)
        }
        Err(e) => {
            warn!("Forwarding to {} failed: {}", subdomain, e);
            error_response(&e)
        }
    };

    finish(&state, Some(&tunnel.subdomain), started, bytes_in, response).await
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registered = state.registry.len().await;
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(registered).await,
    )
}

async fn tunnels_handler(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    let mut tunnels = Vec::new();
    for name in state.registry.subdomains().await {
        let stats = state.metrics.subdomain(&name).await.unwrap_or_default();
        tunnels.push(serde_json::json!({
            "subdomain": name,
            "requests": stats.requests,
            "errors": stats.errors,
        }));
    }
    Json(tunnels)
}

async fn finish(
    state: &AppState,
    tunnel: Option<&str>,
    started: Instant,
    bytes_in: u64,
    response: Response,
) -> Response {
    let bytes_out = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    state
        .metrics
        .record_request(
            tunnel,
            response.status().as_u16(),
            started.elapsed().as_micros() as u64,
            bytes_in,
            bytes_out,
        )
        .await;
    response
}

/// Turn the agent's reply into the response for the external caller.
///
/// A reply to HEAD has no body, so the backend's own content-length is kept.
fn into_http(resp: TunnelResponse, rewriter: &HeaderRewriter, head: bool) -> Response {
    let mut headers = resp.headers;
    let backend_len = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| HeaderValue::from_str(v.trim()).ok());
    rewriter.rewrite_response(&mut headers);

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = hyper::Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                headers_mut.append(name, value);
            }
        }
    }

    let body = resp.body.unwrap_or_default();
    let len = match backend_len {
        Some(value) if head => value,
        _ => HeaderValue::from(body.len()),
    };
    match builder.body(Body::from(body)) {
        Ok(mut r) => {
            r.headers_mut().insert("content-length", len);
            r
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

/// 413 when the body hit the size limit, 400 for any other read failure.
fn body_error_response(err: &axum::Error) -> Response {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err as &(dyn StdError + 'static));
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
        source = e.source();
    }
    (StatusCode::BAD_REQUEST, "Invalid request body").into_response()
}

fn error_response(err: &Error) -> Response {
    match err {
        Error::RegistryMiss(_) => (StatusCode::NOT_FOUND, "Subdomain not found").into_response(),
        Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "Timeout").into_response(),
        Error::Transport(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Error forwarding request").into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Error reading response").into_response(),
    }
}
