//! Generic request/response envelopes shared by every protocol action
//!
//! The payload is opaque JSON: per-action schemas live outside the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::destination::Destination;
use crate::outcome::ResultCode;
use crate::path::NetworkPath;
use crate::signature::Signature;
use crate::types::{EventTrackingId, RequestId};

/// Default time a caller waits for a correlated reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Encoding used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerializationFormat {
    #[default]
    Json,
    Binary,
}

/// Outbound or inbound request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: RequestId,
    pub action: String,
    pub destination: Destination,
    pub network_path: NetworkPath,
    pub event_tracking_id: EventTrackingId,
    pub timestamp: DateTime<Utc>,
    /// How long the sender waits for a reply
    pub timeout: Duration,
    pub signatures: Vec<Signature>,
    pub payload: Value,
    pub format: SerializationFormat,
}

impl Request {
    /// Create a request with fresh ids and default timeout
    pub fn new(action: impl Into<String>, destination: impl Into<Destination>, payload: Value) -> Self {
        Self {
            request_id: RequestId::new(),
            action: action.into(),
            destination: destination.into(),
            network_path: NetworkPath::empty(),
            event_tracking_id: EventTrackingId::new(),
            timestamp: Utc::now(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            signatures: Vec::new(),
            payload,
            format: SerializationFormat::Json,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_format(mut self, format: SerializationFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = id;
        self
    }
}

/// Reply to a request, received from a peer or synthesized locally
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: RequestId,
    pub result: ResultCode,
    /// Human-readable explanation for non-OK results
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub signatures: Vec<Signature>,
    pub payload: Value,
    /// Set when the caller cancelled before the deadline
    pub cancelled: bool,
}

impl Response {
    /// Successful business response
    pub fn ok(request_id: RequestId, payload: Value) -> Self {
        Self {
            request_id,
            result: ResultCode::Ok,
            description: None,
            timestamp: Utc::now(),
            signatures: Vec::new(),
            payload,
            cancelled: false,
        }
    }

    /// Response carrying a failure outcome
    pub fn failed(request_id: RequestId, result: ResultCode, description: impl Into<String>) -> Self {
        Self {
            request_id,
            result,
            description: Some(description.into()),
            timestamp: Utc::now(),
            signatures: Vec::new(),
            payload: Value::Null,
            cancelled: false,
        }
    }

    pub fn filtered(request_id: RequestId, reason: impl Into<String>) -> Self {
        Self::failed(request_id, ResultCode::Filtered, reason)
    }

    pub fn timeout(request_id: RequestId, after: Duration) -> Self {
        Self::failed(
            request_id,
            ResultCode::Timeout,
            format!("no response within {:?}", after),
        )
    }

    pub fn cancelled(request_id: RequestId) -> Self {
        let mut response = Self::failed(request_id, ResultCode::Timeout, "cancelled by caller");
        response.cancelled = true;
        response
    }

    pub fn exception(request_id: RequestId, description: impl Into<String>) -> Self {
        Self::failed(request_id, ResultCode::Exception, description)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_request_defaults() {
        let req = Request::new(
            "Heartbeat",
            NodeId::parse("CSMS").unwrap(),
            serde_json::json!({}),
        );
        assert_eq!(req.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(req.network_path.is_empty());
        assert!(req.signatures.is_empty());
        assert_eq!(req.format, SerializationFormat::Json);
    }

    #[test]
    fn test_synthesized_responses_keep_request_id() {
        let id = RequestId::from("r-1");
        let filtered = Response::filtered(id.clone(), "blocked");
        assert_eq!(filtered.request_id, id);
        assert_eq!(filtered.result, ResultCode::Filtered);

        let cancelled = Response::cancelled(id.clone());
        assert_eq!(cancelled.result, ResultCode::Timeout);
        assert!(cancelled.cancelled);

        let timeout = Response::timeout(id, Duration::from_millis(50));
        assert!(!timeout.cancelled);
        assert!(!timeout.is_ok());
    }
}
