//! Overlay hop
//!
//! Owns the router, correlation engine and forwarding pipeline of one node
//! and wires inbound frames to them:
//! - responses and request errors resolve pending calls
//! - requests addressed here are served by registered action handlers
//! - other requests go through the forwarding pipeline

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::correlation::CorrelationEngine;
use crate::destination::Destination;
use crate::envelope::{Request, Response, SerializationFormat};
use crate::forwarding::{ForwardingPipeline, ForwardingResult};
use crate::frame::{decode, encode_error, encode_response, DecodeError, ErrorCode, ErrorFrame, Frame, FrameKind, WireFrame};
use crate::outcome::ResultCode;
use crate::router::Router;
use crate::signature::SignaturePolicy;
use crate::transport::{Connection, Outbound};
use crate::types::NodeId;

/// Failure reported by an action handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    Format(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    fn result_code(&self) -> ResultCode {
        match self {
            HandlerError::Format(_) => ResultCode::Format,
            HandlerError::Internal(_) => ResultCode::Server,
            HandlerError::Failed(_) => ResultCode::GenericError,
        }
    }
}

/// Serves one action for requests addressed to this node
pub type RequestHandler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// One hop of the overlay
pub struct OverlayNode {
    id: NodeId,
    request_timeout: Duration,
    send_queue: usize,
    router: Arc<Router>,
    policy: Arc<SignaturePolicy>,
    engine: CorrelationEngine,
    pipeline: ForwardingPipeline,
    handlers: RwLock<HashMap<String, RequestHandler>>,
}

impl OverlayNode {
    /// Build a node, loading key material from the configuration
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>, ConfigError> {
        let policy = config.signature.build()?;
        Self::with_policy(config, policy).await
    }

    /// Build a node with an explicit signature policy
    pub async fn with_policy(config: NodeConfig, policy: SignaturePolicy) -> Result<Arc<Self>, ConfigError> {
        let id = config.parsed_node_id()?;
        let routes = config.parsed_routes()?;
        let default_route = config.parsed_default_route()?;

        let router = Arc::new(Router::new(id.clone()));
        for (target, via) in routes {
            router.add_route(target, via).await;
        }
        router.set_default_route(default_route).await;

        let policy = Arc::new(policy);
        let engine = CorrelationEngine::new(id.clone(), policy.clone(), router.clone());
        let pipeline = ForwardingPipeline::new(id.clone(), config.default_forwarding, policy.clone())
            .with_loop_rejection(config.reject_loops);

        info!(
            "Node {} ready (default {}, timeout {:?})",
            id, config.default_forwarding, config.request_timeout
        );

        Ok(Arc::new(Self {
            id,
            request_timeout: config.request_timeout,
            send_queue: config.send_queue,
            router,
            policy,
            engine,
            pipeline,
            handlers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    /// Register filters and observers here
    pub fn pipeline(&self) -> &ForwardingPipeline {
        &self.pipeline
    }

    /// Serve `action` for requests addressed to this node
    pub fn register_handler<F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let action = action.into();
        debug!("Node {} handles {}", self.id, action);
        let handler: RequestHandler = Arc::new(move |request| handler(request).boxed());
        self.handlers.write().insert(action, handler);
    }

    /// Register a peer connection. The transport drains the returned queue.
    pub async fn attach(&self, peer: NodeId) -> mpsc::Receiver<Outbound> {
        let (connection, outbound) = Connection::new(peer, self.send_queue);
        self.router.add_connection(connection).await;
        outbound
    }

    pub async fn detach(&self, peer: &NodeId) {
        self.router.remove_connection(peer).await;
    }

    /// A request with this node's default timeout
    pub fn new_request(&self, action: impl Into<String>, destination: impl Into<Destination>, payload: Value) -> Request {
        Request::new(action, destination, payload).with_timeout(self.request_timeout)
    }

    /// Send a request and wait for its outcome
    pub async fn dispatch(&self, request: Request) -> Response {
        self.engine.dispatch(request).await
    }

    pub async fn dispatch_until<C>(&self, request: Request, cancel: C) -> Response
    where
        C: Future<Output = ()>,
    {
        self.engine.dispatch_until(request, cancel).await
    }

    /// Entry point for every frame a transport receives from `from`
    pub fn on_frame(self: &Arc<Self>, from: NodeId, frame: WireFrame) {
        let format = frame.format();
        match decode(&frame) {
            Ok(Frame::Response(response)) => {
                self.engine.on_response(response);
            }
            Ok(Frame::RequestError(error)) => {
                self.engine.on_request_error(error);
            }
            Ok(Frame::ResponseError(error)) => {
                warn!(
                    "{} could not process our response to {}: {:?} {}",
                    from, error.request_id, error.error_code, error.description
                );
            }
            Ok(Frame::Request(request)) => {
                let node = self.clone();
                tokio::spawn(async move { node.on_request(from, request).await });
            }
            Err(e) => self.on_malformed(from, format, e),
        }
    }

    fn on_malformed(self: &Arc<Self>, from: NodeId, format: SerializationFormat, error: DecodeError) {
        warn!("Malformed frame from {}: {}", from, error);

        let Some(request_id) = error.request_id else {
            return;
        };

        match error.kind {
            Some(FrameKind::Request) => {
                let decision =
                    self.pipeline
                        .reject_undecodable(&from, request_id, format, &error.source.to_string());
                if let Some(frame) = decision.reject_frame {
                    let node = self.clone();
                    tokio::spawn(async move { node.reply(&from, frame).await });
                }
            }
            Some(FrameKind::Response) | Some(FrameKind::RequestError) => {
                self.engine.on_malformed_reply(&request_id, &error.source.to_string());
            }
            _ => {}
        }
    }

    async fn on_request(&self, from: NodeId, request: Request) {
        debug!(
            "{} received {} {} from {} (path {})",
            self.id, request.action, request.request_id, from, request.network_path
        );

        if request.destination.is_for(&self.id) {
            self.serve(from, request).await;
            return;
        }

        let decision = self.pipeline.decide(&request);
        match decision.result {
            ForwardingResult::Forward => {
                let format = decision.request.format;
                let mut response = self.engine.dispatch(decision.request).await;
                if let Err(e) = self.policy.sign_response(&mut response) {
                    warn!("Cannot sign relayed response {}: {}", response.request_id, e);
                }
                self.send_response(&from, &response, format).await;
            }
            ForwardingResult::Drop | ForwardingResult::Reject => {
                if let Some(frame) = decision.reject_frame {
                    self.reply(&from, frame).await;
                }
            }
        }
    }

    /// Handle a request addressed to this node
    async fn serve(&self, from: NodeId, request: Request) {
        let request_id = request.request_id.clone();
        let format = request.format;

        if let Err(e) = self.policy.verify_request(&request) {
            warn!("Rejecting {} {}: {}", request.action, request_id, e);
            let mut response = Response::failed(request_id, ResultCode::SignatureError, e.to_string());
            if let Err(e) = self.policy.sign_response(&mut response) {
                warn!("Cannot sign response {}: {}", response.request_id, e);
            }
            self.send_response(&from, &response, format).await;
            return;
        }

        let handler = self.handlers.read().get(&request.action).cloned();
        let Some(handler) = handler else {
            info!("No handler for {} on {}", request.action, self.id);
            let error = ErrorFrame::new(
                request_id,
                ErrorCode::NotImplemented,
                format!("action {} not supported", request.action),
            );
            self.send_error(&from, &error, format).await;
            return;
        };

        match handler(request).await {
            Ok(payload) => {
                let mut response = Response::ok(request_id, payload);
                if let Err(e) = self.policy.sign_response(&mut response) {
                    warn!("Cannot sign response {}: {}", response.request_id, e);
                    let error = ErrorFrame::new(response.request_id, ErrorCode::SecurityError, e.to_string());
                    self.send_error(&from, &error, format).await;
                    return;
                }
                self.send_response(&from, &response, format).await;
            }
            Err(e) => {
                debug!("Handler failed for {}: {}", request_id, e);
                let error = ErrorFrame::new(request_id, ErrorCode::from(e.result_code()), e.to_string());
                self.send_error(&from, &error, format).await;
            }
        }
    }

    async fn send_response(&self, to: &NodeId, response: &Response, format: SerializationFormat) {
        match encode_response(response, format) {
            Ok(frame) => self.reply(to, frame).await,
            Err(e) => warn!("Cannot encode response {}: {}", response.request_id, e),
        }
    }

    async fn send_error(&self, to: &NodeId, error: &ErrorFrame, format: SerializationFormat) {
        match encode_error(FrameKind::RequestError, error, format) {
            Ok(frame) => self.reply(to, frame).await,
            Err(e) => warn!("Cannot encode error for {}: {}", error.request_id, e),
        }
    }

    /// Send back to the hop a request came from
    async fn reply(&self, to: &NodeId, frame: WireFrame) {
        let Some(connection) = self.router.connection(to).await else {
            warn!("Cannot reply to {}: no connection", to);
            return;
        };
        if let Err(e) = connection.send(frame).await {
            warn!("Reply to {} failed: {}", to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_request;
    use crate::types::RequestId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        let out = rx.recv().await.unwrap();
        let frame = decode(&out.frame).unwrap();
        out.complete(Ok(()));
        frame
    }

    #[tokio::test]
    async fn test_serves_local_request() {
        let node = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
        node.register_handler("Heartbeat", |_req| async { Ok(json!({"currentTime": "now"})) });
        let mut to_peer = node.attach(id("CS1")).await;

        let req = Request::new("Heartbeat", id("CSMS"), json!({}));
        node.on_frame(id("CS1"), encode_request(&req).unwrap());

        let Frame::Response(resp) = next_frame(&mut to_peer).await else {
            panic!("Expected Response");
        };
        assert_eq!(resp.request_id, req.request_id);
        assert_eq!(resp.payload, json!({"currentTime": "now"}));
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let node = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
        let mut to_peer = node.attach(id("CS1")).await;

        let req = Request::new("Teleport", id("CSMS"), json!({}));
        node.on_frame(id("CS1"), encode_request(&req).unwrap());

        let Frame::RequestError(error) = next_frame(&mut to_peer).await else {
            panic!("Expected RequestError");
        };
        assert_eq!(error.error_code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_frame() {
        let node = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
        node.register_handler("Authorize", |_req| async {
            Err(HandlerError::Format("idToken missing".into()))
        });
        let mut to_peer = node.attach(id("CS1")).await;

        let req = Request::new("Authorize", id("CSMS"), json!({}));
        node.on_frame(id("CS1"), encode_request(&req).unwrap());

        let Frame::RequestError(error) = next_frame(&mut to_peer).await else {
            panic!("Expected RequestError");
        };
        assert_eq!(error.error_code, ErrorCode::FormatViolation);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_format_violation() {
        let node = OverlayNode::new(NodeConfig::new("GW")).await.unwrap();
        let mut to_peer = node.attach(id("CS1")).await;

        let filtered = Arc::new(AtomicUsize::new(0));
        {
            let filtered = filtered.clone();
            node.pipeline().register_filter("spy", move |_| {
                filtered.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            });
        }
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let observed = observed.clone();
            node.pipeline()
                .register_observer(move |d| observed.lock().push((d.result, d.request.request_id.clone())));
        }

        node.on_frame(
            id("CS1"),
            WireFrame::Text(r#"[2, "r-7", "Heartbeat", {"destination": 17}, {}, []]"#.into()),
        );

        let Frame::RequestError(error) = next_frame(&mut to_peer).await else {
            panic!("Expected RequestError");
        };
        assert_eq!(error.request_id.as_str(), "r-7");
        assert_eq!(error.error_code, ErrorCode::FormatViolation);

        assert_eq!(filtered.load(Ordering::SeqCst), 0);
        assert_eq!(*observed.lock(), vec![(ForwardingResult::Reject, RequestId::from("r-7"))]);
    }

    #[tokio::test]
    async fn test_rejected_request_is_answered_on_reverse_path() {
        let config = NodeConfig::new("GW").with_default_forwarding(ForwardingResult::Reject);
        let node = OverlayNode::new(config).await.unwrap();
        let mut to_cs = node.attach(id("CS1")).await;
        let mut to_csms = node.attach(id("CSMS")).await;

        let req = Request::new("Reset", id("CSMS"), json!({}));
        node.on_frame(id("CS1"), encode_request(&req).unwrap());

        let Frame::Response(resp) = next_frame(&mut to_cs).await else {
            panic!("Expected Response");
        };
        assert_eq!(resp.result, ResultCode::Filtered);
        assert!(to_csms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config() {
        assert!(OverlayNode::new(NodeConfig::new("no spaces")).await.is_err());
    }
}
