//! Wire framing for overlay envelopes
//!
//! JSON frames follow the OCPP array layout, extended with the routing
//! header the overlay needs:
//! - REQUEST:        [2, requestId, action, header, payload, signatures]
//! - RESPONSE:       [3, requestId, result, payload, signatures, description, timestamp]
//! - REQUEST ERROR:  [4, requestId, errorCode, errorDescription, errorDetails]
//! - RESPONSE ERROR: [5, requestId, errorCode, errorDescription, errorDetails]
//!
//! Binary frames carry the same fields as a bincode record, with the opaque
//! payload embedded as JSON bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::destination::Destination;
use crate::envelope::{Request, Response, SerializationFormat};
use crate::outcome::ResultCode;
use crate::path::NetworkPath;
use crate::signature::Signature;
use crate::types::{EventTrackingId, RequestId};

/// Frame discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Request = 2,
    Response = 3,
    RequestError = 4,
    ResponseError = 5,
}

impl FrameKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(FrameKind::Request),
            3 => Some(FrameKind::Response),
            4 => Some(FrameKind::RequestError),
            5 => Some(FrameKind::ResponseError),
            _ => None,
        }
    }
}

/// OCPP RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Parse a wire error code, falling back to `GenericError`
    pub fn parse_lenient(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl From<ErrorCode> for ResultCode {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::FormatViolation
            | ErrorCode::TypeConstraintViolation
            | ErrorCode::OccurrenceConstraintViolation
            | ErrorCode::PropertyConstraintViolation
            | ErrorCode::ProtocolError
            | ErrorCode::MessageTypeNotSupported => ResultCode::Format,
            ErrorCode::SecurityError => ResultCode::SignatureError,
            ErrorCode::InternalError => ResultCode::Server,
            ErrorCode::GenericError
            | ErrorCode::NotImplemented
            | ErrorCode::NotSupported
            | ErrorCode::RpcFrameworkError => ResultCode::GenericError,
        }
    }
}

impl From<ResultCode> for ErrorCode {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Format => ErrorCode::FormatViolation,
            ResultCode::SignatureError => ErrorCode::SecurityError,
            ResultCode::Server | ResultCode::Exception => ErrorCode::InternalError,
            _ => ErrorCode::GenericError,
        }
    }
}

/// Errors in frame encoding and decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("invalid frame format: {0}")]
    InvalidFormat(&'static str),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// Decode failure, with whatever could be recovered before it failed
#[derive(Debug, Error)]
#[error("cannot decode frame: {source}")]
pub struct DecodeError {
    pub kind: Option<FrameKind>,
    pub request_id: Option<RequestId>,
    #[source]
    pub source: FrameError,
}

/// Protocol-level error frame: the peer could not process a request (or response)
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl ErrorFrame {
    pub fn new(request_id: RequestId, error_code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            request_id,
            error_code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Raw frame as carried by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(t) => t.len(),
            WireFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SerializationFormat {
        match self {
            WireFrame::Text(_) => SerializationFormat::Json,
            WireFrame::Binary(_) => SerializationFormat::Binary,
        }
    }
}

/// Any decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    RequestError(ErrorFrame),
    ResponseError(ErrorFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::RequestError(_) => FrameKind::RequestError,
            Frame::ResponseError(_) => FrameKind::ResponseError,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            Frame::Request(r) => &r.request_id,
            Frame::Response(r) => &r.request_id,
            Frame::RequestError(e) | Frame::ResponseError(e) => &e.request_id,
        }
    }

    /// Encode in the given format
    pub fn encode(&self, format: SerializationFormat) -> Result<WireFrame, FrameError> {
        match self {
            Frame::Request(r) => encode_request(&Request {
                format,
                ..r.clone()
            }),
            Frame::Response(r) => encode_response(r, format),
            Frame::RequestError(e) => encode_error(FrameKind::RequestError, e, format),
            Frame::ResponseError(e) => encode_error(FrameKind::ResponseError, e, format),
        }
    }
}

/// Routing header of a request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestHeader {
    destination: Destination,
    network_path: NetworkPath,
    event_tracking_id: EventTrackingId,
    timestamp: DateTime<Utc>,
    timeout_ms: u64,
}

impl RequestHeader {
    fn of(request: &Request) -> Self {
        Self {
            destination: request.destination.clone(),
            network_path: request.network_path.clone(),
            event_tracking_id: request.event_tracking_id.clone(),
            timestamp: request.timestamp,
            timeout_ms: u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum BinaryFrame {
    Request {
        request_id: RequestId,
        action: String,
        header: RequestHeader,
        payload: Vec<u8>,
        signatures: Vec<Signature>,
    },
    Response {
        request_id: RequestId,
        result: ResultCode,
        description: Option<String>,
        timestamp: DateTime<Utc>,
        payload: Vec<u8>,
        signatures: Vec<Signature>,
    },
    RequestError {
        request_id: RequestId,
        error_code: ErrorCode,
        description: String,
        details: Vec<u8>,
    },
    ResponseError {
        request_id: RequestId,
        error_code: ErrorCode,
        description: String,
        details: Vec<u8>,
    },
}

/// Encode a request in its own serialization format
pub fn encode_request(request: &Request) -> Result<WireFrame, FrameError> {
    match request.format {
        SerializationFormat::Json => {
            let array = serde_json::json!([
                FrameKind::Request as i32,
                &request.request_id,
                &request.action,
                RequestHeader::of(request),
                &request.payload,
                &request.signatures
            ]);
            Ok(WireFrame::Text(serde_json::to_string(&array)?))
        }
        SerializationFormat::Binary => {
            let frame = BinaryFrame::Request {
                request_id: request.request_id.clone(),
                action: request.action.clone(),
                header: RequestHeader::of(request),
                payload: serde_json::to_vec(&request.payload)?,
                signatures: request.signatures.clone(),
            };
            Ok(WireFrame::Binary(bincode::serialize(&frame)?))
        }
    }
}

/// Encode a response
pub fn encode_response(response: &Response, format: SerializationFormat) -> Result<WireFrame, FrameError> {
    match format {
        SerializationFormat::Json => {
            let array = serde_json::json!([
                FrameKind::Response as i32,
                &response.request_id,
                response.result,
                &response.payload,
                &response.signatures,
                &response.description,
                response.timestamp
            ]);
            Ok(WireFrame::Text(serde_json::to_string(&array)?))
        }
        SerializationFormat::Binary => {
            let frame = BinaryFrame::Response {
                request_id: response.request_id.clone(),
                result: response.result,
                description: response.description.clone(),
                timestamp: response.timestamp,
                payload: serde_json::to_vec(&response.payload)?,
                signatures: response.signatures.clone(),
            };
            Ok(WireFrame::Binary(bincode::serialize(&frame)?))
        }
    }
}

/// Encode a request-error or response-error frame
pub fn encode_error(
    kind: FrameKind,
    error: &ErrorFrame,
    format: SerializationFormat,
) -> Result<WireFrame, FrameError> {
    match format {
        SerializationFormat::Json => {
            let array = serde_json::json!([
                kind as i32,
                &error.request_id,
                error.error_code,
                &error.description,
                &error.details
            ]);
            Ok(WireFrame::Text(serde_json::to_string(&array)?))
        }
        SerializationFormat::Binary => {
            let request_id = error.request_id.clone();
            let error_code = error.error_code;
            let description = error.description.clone();
            let details = serde_json::to_vec(&error.details)?;
            let frame = match kind {
                FrameKind::ResponseError => BinaryFrame::ResponseError {
                    request_id,
                    error_code,
                    description,
                    details,
                },
                _ => BinaryFrame::RequestError {
                    request_id,
                    error_code,
                    description,
                    details,
                },
            };
            Ok(WireFrame::Binary(bincode::serialize(&frame)?))
        }
    }
}

/// Decode any frame
pub fn decode(frame: &WireFrame) -> Result<Frame, DecodeError> {
    match frame {
        WireFrame::Text(text) => decode_json(text.as_bytes()),
        WireFrame::Binary(bytes) => decode_binary(bytes),
    }
}

fn decode_json(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let fail = |kind: Option<FrameKind>, request_id: Option<RequestId>, source: FrameError| DecodeError {
        kind,
        request_id,
        source,
    };

    let array: Vec<Value> =
        serde_json::from_slice(bytes).map_err(|e| fail(None, None, e.into()))?;

    let code = array
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| fail(None, None, FrameError::InvalidFormat("missing message type")))?;
    let kind = FrameKind::from_code(code)
        .ok_or_else(|| fail(None, None, FrameError::UnknownMessageType(code)))?;

    let request_id = array
        .get(1)
        .and_then(Value::as_str)
        .map(RequestId::from)
        .ok_or_else(|| fail(Some(kind), None, FrameError::InvalidFormat("missing request id")))?;

    let recovered = Some(request_id.clone());
    let invalid = |what: &'static str| fail(Some(kind), recovered.clone(), FrameError::InvalidFormat(what));
    let json = |e: serde_json::Error| fail(Some(kind), recovered.clone(), e.into());

    match kind {
        FrameKind::Request => {
            if array.len() != 6 {
                return Err(invalid("request frame must have 6 elements"));
            }
            let action = array[2]
                .as_str()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| invalid("missing action"))?
                .to_string();
            let header: RequestHeader = serde_json::from_value(array[3].clone()).map_err(json)?;
            let signatures: Vec<Signature> =
                serde_json::from_value(array[5].clone()).map_err(json)?;

            Ok(Frame::Request(request_from_parts(
                request_id,
                action,
                header,
                array[4].clone(),
                signatures,
                SerializationFormat::Json,
            )))
        }
        FrameKind::Response => {
            // Peers predating the timestamp element send 6
            if !(6..=7).contains(&array.len()) {
                return Err(invalid("response frame must have 6 or 7 elements"));
            }
            let result: ResultCode = serde_json::from_value(array[2].clone()).map_err(json)?;
            let signatures: Vec<Signature> =
                serde_json::from_value(array[4].clone()).map_err(json)?;
            let description = array[5].as_str().map(str::to_string);
            let timestamp = match array.get(6) {
                Some(value) => serde_json::from_value(value.clone()).map_err(json)?,
                None => Utc::now(),
            };

            Ok(Frame::Response(Response {
                request_id,
                result,
                description,
                timestamp,
                signatures,
                payload: array[3].clone(),
                cancelled: false,
            }))
        }
        FrameKind::RequestError | FrameKind::ResponseError => {
            if array.len() != 5 {
                return Err(invalid("error frame must have 5 elements"));
            }
            let error_code = array[2]
                .as_str()
                .map(ErrorCode::parse_lenient)
                .ok_or_else(|| invalid("missing error code"))?;
            let error = ErrorFrame {
                request_id,
                error_code,
                description: array[3].as_str().unwrap_or("").to_string(),
                details: array[4].clone(),
            };
            Ok(if kind == FrameKind::RequestError {
                Frame::RequestError(error)
            } else {
                Frame::ResponseError(error)
            })
        }
    }
}

fn decode_binary(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let frame: BinaryFrame = bincode::deserialize(bytes).map_err(|e| DecodeError {
        kind: None,
        request_id: None,
        source: e.into(),
    })?;

    let payload_error = |kind: FrameKind, request_id: &RequestId, e: serde_json::Error| DecodeError {
        kind: Some(kind),
        request_id: Some(request_id.clone()),
        source: e.into(),
    };

    match frame {
        BinaryFrame::Request {
            request_id,
            action,
            header,
            payload,
            signatures,
        } => {
            let payload = serde_json::from_slice(&payload)
                .map_err(|e| payload_error(FrameKind::Request, &request_id, e))?;
            Ok(Frame::Request(request_from_parts(
                request_id,
                action,
                header,
                payload,
                signatures,
                SerializationFormat::Binary,
            )))
        }
        BinaryFrame::Response {
            request_id,
            result,
            description,
            timestamp,
            payload,
            signatures,
        } => {
            let payload = serde_json::from_slice(&payload)
                .map_err(|e| payload_error(FrameKind::Response, &request_id, e))?;
            Ok(Frame::Response(Response {
                request_id,
                result,
                description,
                timestamp,
                signatures,
                payload,
                cancelled: false,
            }))
        }
        BinaryFrame::RequestError {
            request_id,
            error_code,
            description,
            details,
        } => Ok(Frame::RequestError(ErrorFrame {
            details: serde_json::from_slice(&details).unwrap_or(Value::Null),
            request_id,
            error_code,
            description,
        })),
        BinaryFrame::ResponseError {
            request_id,
            error_code,
            description,
            details,
        } => Ok(Frame::ResponseError(ErrorFrame {
            details: serde_json::from_slice(&details).unwrap_or(Value::Null),
            request_id,
            error_code,
            description,
        })),
    }
}

fn request_from_parts(
    request_id: RequestId,
    action: String,
    header: RequestHeader,
    payload: Value,
    signatures: Vec<Signature>,
    format: SerializationFormat,
) -> Request {
    Request {
        request_id,
        action,
        destination: header.destination,
        network_path: header.network_path,
        event_tracking_id: header.event_tracking_id,
        timestamp: header.timestamp,
        timeout: Duration::from_millis(header.timeout_ms),
        signatures,
        payload,
        format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn request() -> Request {
        Request::new("Reset", id("CS1"), json!({"type": "Immediate"}))
            .with_request_id("req-1")
            .with_network_path(NetworkPath::parse(&["CSMS", "GW"]).unwrap())
            .with_timeout(Duration::from_millis(1500))
    }

    #[test]
    fn test_request_json_layout() {
        let WireFrame::Text(text) = encode_request(&request()).unwrap() else {
            panic!("Expected text frame");
        };

        assert!(text.starts_with("[2,\"req-1\",\"Reset\","));
        assert!(text.contains("\"networkPath\":[\"CSMS\",\"GW\"]"));
        assert!(text.contains("\"destination\":{\"node\":\"CS1\"}"));
        assert!(text.contains("\"timeoutMs\":1500"));
    }

    #[test]
    fn test_request_json_decode() {
        let req = request();
        let frame = decode(&encode_request(&req).unwrap()).unwrap();

        match frame {
            Frame::Request(decoded) => {
                assert_eq!(decoded.request_id, req.request_id);
                assert_eq!(decoded.destination, req.destination);
                assert_eq!(decoded.network_path.last(), &id("GW"));
                assert_eq!(decoded.timeout, Duration::from_millis(1500));
                assert_eq!(decoded.payload, json!({"type": "Immediate"}));
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn test_request_binary_decode() {
        let req = request().with_format(SerializationFormat::Binary);
        let wire = encode_request(&req).unwrap();
        assert!(matches!(wire, WireFrame::Binary(_)));

        match decode(&wire).unwrap() {
            Frame::Request(decoded) => {
                assert_eq!(decoded.format, SerializationFormat::Binary);
                assert_eq!(decoded.network_path, req.network_path);
                assert_eq!(decoded.payload, req.payload);
                assert_eq!(decoded.event_tracking_id, req.event_tracking_id);
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"[3, "req-1", "Filtered", null, [], "blocked by policy"]"#;
        match decode(&WireFrame::Text(json.to_string())).unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.request_id.as_str(), "req-1");
                assert_eq!(resp.result, ResultCode::Filtered);
                assert_eq!(resp.description.as_deref(), Some("blocked by policy"));
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn test_response_keeps_timestamp() {
        let sent = Response::ok("req-5".into(), json!({"status": "Accepted"}));
        let wire = encode_response(&sent, SerializationFormat::Json).unwrap();
        let WireFrame::Text(text) = &wire else {
            panic!("Expected text frame");
        };
        let array: Vec<Value> = serde_json::from_str(text).unwrap();
        assert_eq!(array.len(), 7);

        match decode(&wire).unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.timestamp, sent.timestamp);
                assert_eq!(resp.payload, sent.payload);
            }
            _ => panic!("Expected Response"),
        }

        let json = r#"[3, "req-6", "Ok", {}, [], null, "not a time"]"#;
        let err = decode(&WireFrame::Text(json.to_string())).unwrap_err();
        assert_eq!(err.request_id, Some(RequestId::from("req-6")));
    }

    #[test]
    fn test_error_parsing() {
        let json = r#"[4, "req-1", "NotImplemented", "Action not supported", {}]"#;
        match decode(&WireFrame::Text(json.to_string())).unwrap() {
            Frame::RequestError(error) => {
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.description, "Action not supported");
            }
            _ => panic!("Expected RequestError"),
        }

        let json = r#"[5, "req-2", "Bogus", "", {}]"#;
        match decode(&WireFrame::Text(json.to_string())).unwrap() {
            Frame::ResponseError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected ResponseError"),
        }
    }

    #[test]
    fn test_binary_error_frame() {
        let error = ErrorFrame::new("req-3".into(), ErrorCode::SecurityError, "bad signature");
        let wire = encode_error(FrameKind::RequestError, &error, SerializationFormat::Binary).unwrap();
        assert_eq!(decode(&wire).unwrap(), Frame::RequestError(error));
    }

    #[test]
    fn test_malformed_request_keeps_request_id() {
        let json = r#"[2, "req-7", "Reset", {"destination": 12}, {}, []]"#;
        let err = decode(&WireFrame::Text(json.to_string())).unwrap_err();
        assert_eq!(err.kind, Some(FrameKind::Request));
        assert_eq!(err.request_id, Some(RequestId::from("req-7")));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = decode(&WireFrame::Text("not json".into())).unwrap_err();
        assert!(err.kind.is_none());

        let err = decode(&WireFrame::Text("[9, \"x\"]".into())).unwrap_err();
        assert!(matches!(err.source, FrameError::UnknownMessageType(9)));

        assert!(decode(&WireFrame::Binary(vec![0xff, 0x01])).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ResultCode::from(ErrorCode::FormatViolation), ResultCode::Format);
        assert_eq!(ResultCode::from(ErrorCode::SecurityError), ResultCode::SignatureError);
        assert_eq!(ResultCode::from(ErrorCode::InternalError), ResultCode::Server);
        assert_eq!(ResultCode::from(ErrorCode::NotImplemented), ResultCode::GenericError);
        assert_eq!(ErrorCode::from(ResultCode::Format), ErrorCode::FormatViolation);
        assert_eq!(ErrorCode::from(ResultCode::Exception), ErrorCode::InternalError);
    }
}
