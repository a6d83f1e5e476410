//! Local proxy for forwarding requests

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method};
use skyconnect_shared::protocol::{TunnelRequest, TunnelResponse, CONTACT_ERROR, READ_ERROR};
use thiserror::Error;
use tracing::{debug, warn};

/// Request headers the HTTP client sets itself
const SKIPPED_HEADERS: &[&str] = &["host", "content-length"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("local server unreachable: {0}")]
    Contact(#[source] reqwest::Error),

    #[error("local response unreadable: {0}")]
    Read(#[source] reqwest::Error),
}

impl BackendError {
    /// Diagnostic sent back through the tunnel in place of a response.
    pub fn reply_text(&self) -> &'static str {
        match self {
            BackendError::Contact(_) => CONTACT_ERROR,
            BackendError::Read(_) => READ_ERROR,
        }
    }
}

/// HTTP client bound to the local backend's base URL
pub struct LocalBackend {
    base: String,
    client: Client,
}

impl LocalBackend {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build local HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    /// Replay a forwarded request locally. Never fails: backend errors
    /// become a diagnostic reply so the relay's caller gets an answer.
    pub async fn forward(&self, request: &TunnelRequest) -> TunnelResponse {
        match self.call(request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("{} {}: {}", request.method, request.path, e);
                TunnelResponse::failure(request.id.clone(), e.reply_text())
            }
        }
    }

    async fn call(&self, request: &TunnelRequest) -> Result<TunnelResponse, BackendError> {
        let url = self.url_for(&request.path);
        let method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);

        let mut builder = self.client.request(method, &url);
        for (k, v) in &request.headers {
            if SKIPPED_HEADERS.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                continue;
            }
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Dropping invalid header {:?}", k),
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(BackendError::Contact)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
            .collect();
        let body = resp.bytes().await.map_err(BackendError::Read)?;

        Ok(TunnelResponse {
            id: request.id.clone(),
            status,
            headers,
            body: Some(body.to_vec()),
            error: None,
        })
    }
}
