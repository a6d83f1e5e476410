//! Wire protocol spoken between the relay and the tunnel agent.
//!
//! Every message is one JSON object carried in a single WebSocket text
//! frame. Requests and responses are paired by `id`, so any number of
//! requests may be in flight on one tunnel connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Path the agent dials to register a tunnel.
pub const CONNECT_PATH: &str = "/connect";

/// Query parameter carrying the requested subdomain.
pub const SUBDOMAIN_PARAM: &str = "subdomain";

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Reply body when the agent cannot reach its local backend.
pub const CONTACT_ERROR: &str = "Error contacting local server";

/// Reply body when the local backend's response body cannot be read.
pub const READ_ERROR: &str = "Error reading local response";

/// Status reported for backend failures.
pub const BACKEND_FAILURE_STATUS: u16 = 500;

/// External request forwarded from the relay to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// Correlation id, echoed by the matching response
    pub id: String,
    pub method: String,
    /// Path plus query string, exactly as the external caller sent it
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

impl TunnelRequest {
    /// Build a request with a freshly generated correlation id.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: generate_request_id(),
            method: method.into(),
            path: path.into(),
            headers,
            body,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Local backend's answer, sent from the agent back to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Set when the agent could not complete the local call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelResponse {
    /// Reply carrying a diagnostic instead of a backend response.
    ///
    /// The diagnostic doubles as the body so the external caller sees it.
    pub fn failure(id: impl Into<String>, message: &str) -> Self {
        Self {
            id: id.into(),
            status: BACKEND_FAILURE_STATUS,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: Some(message.as_bytes().to_vec()),
            error: Some(message.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Correlation id for one forwarded request.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Synthetic subdomain for agents that registered without one.
pub fn generate_subdomain() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("t{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_keeps_path_and_query() {
        let req = TunnelRequest::new("GET", "/foo?x=1", vec![], None);
        let frame = req.encode().unwrap();
        let decoded = TunnelRequest::decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded.path, "/foo?x=1");
        assert_eq!(decoded.id, req.id);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = TunnelRequest::new("GET", "/", vec![], None);
        let b = TunnelRequest::new("GET", "/", vec![], None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_failure_response() {
        let resp = TunnelResponse::failure("r1", CONTACT_ERROR);
        assert!(resp.is_failure());
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body.as_deref(), Some(CONTACT_ERROR.as_bytes()));
    }

    #[test]
    fn test_response_without_optional_fields() {
        let resp = TunnelResponse::decode(br#"{"id":"r2","status":204}"#).unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.headers.is_empty());
        assert!(resp.body.is_none());
        assert!(!resp.is_failure());
    }

    #[test]
    fn test_garbage_frame_is_rejected() {
        assert!(TunnelRequest::decode(b"/status").is_err());
    }

    #[test]
    fn test_generated_subdomain() {
        let name = generate_subdomain();
        assert_eq!(name.len(), 13);
        assert!(name.starts_with('t'));
        assert_ne!(name, generate_subdomain());
    }
}
