//! Forwarding decisions for requests passing through a hop
//!
//! Stages, in order: decode, verify, loop check (optional), filters, default
//! policy, observe. A request frame that fails to decode is rejected before
//! any later stage and still reaches the observers. The first filter to return a decision is authoritative; filters
//! after it still run and their votes are logged, but never override it.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::envelope::{Request, Response, SerializationFormat};
use crate::frame::{encode_error, encode_response, ErrorCode, ErrorFrame, FrameKind, WireFrame};
use crate::outcome::ResultCode;
use crate::path::NetworkPath;
use crate::signature::SignaturePolicy;
use crate::types::{NodeId, RequestId};

/// Log message carried by responses synthesized for rejected requests
pub const DEFAULT_FILTERED_MESSAGE: &str = "request rejected by forwarding policy";

/// Action recorded on decisions about request frames that never decoded
pub const UNDECODABLE_ACTION: &str = "<undecodable>";

/// What a hop does with an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardingResult {
    #[default]
    Forward,
    Drop,
    Reject,
}

impl ForwardingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardingResult::Forward => "FORWARD",
            ForwardingResult::Drop => "DROP",
            ForwardingResult::Reject => "REJECT",
        }
    }
}

impl fmt::Display for ForwardingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ForwardingResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(ForwardingResult::Forward),
            "drop" => Ok(ForwardingResult::Drop),
            "reject" => Ok(ForwardingResult::Reject),
            other => Err(format!("unknown forwarding result: {}", other)),
        }
    }
}

/// Outcome of the pipeline for one request
#[derive(Debug, Clone)]
pub struct ForwardingDecision {
    pub request: Request,
    pub result: ForwardingResult,
    /// Response to send back instead of forwarding
    pub response: Option<Response>,
    /// `response` encoded in the request's format, ready for the reverse path
    pub reject_frame: Option<WireFrame>,
    pub reason: String,
    /// Name of the filter that decided, if any
    pub filter: Option<String>,
}

impl ForwardingDecision {
    fn with_result(request: &Request, result: ForwardingResult, reason: impl Into<String>) -> Self {
        Self {
            request: request.clone(),
            result,
            response: None,
            reject_frame: None,
            reason: reason.into(),
            filter: None,
        }
    }

    pub fn forward(request: &Request, reason: impl Into<String>) -> Self {
        Self::with_result(request, ForwardingResult::Forward, reason)
    }

    pub fn drop(request: &Request, reason: impl Into<String>) -> Self {
        Self::with_result(request, ForwardingResult::Drop, reason)
    }

    pub fn reject(request: &Request, reason: impl Into<String>) -> Self {
        Self::with_result(request, ForwardingResult::Reject, reason)
    }

    /// Answer the request with this response instead of a synthesized one
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }
}

/// A filter failed to reach a decision
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter cannot read payload: {0}")]
    Payload(String),

    #[error("filter failed: {0}")]
    Failed(String),
}

/// Filter callback: `Ok(None)` abstains
pub type RequestFilter =
    Arc<dyn Fn(&Request) -> Result<Option<ForwardingDecision>, FilterError> + Send + Sync>;

/// Receives every decision after it is made
pub type DecisionObserver = Arc<dyn Fn(&ForwardingDecision) + Send + Sync>;

/// Per-node forwarding policy
pub struct ForwardingPipeline {
    node_id: NodeId,
    default_result: ForwardingResult,
    reject_loops: bool,
    policy: Arc<SignaturePolicy>,
    filters: RwLock<Vec<(String, RequestFilter)>>,
    observers: RwLock<Vec<DecisionObserver>>,
}

impl ForwardingPipeline {
    pub fn new(node_id: NodeId, default_result: ForwardingResult, policy: Arc<SignaturePolicy>) -> Self {
        Self {
            node_id,
            default_result,
            reject_loops: false,
            policy,
            filters: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Reject requests whose path already visited this node
    pub fn with_loop_rejection(mut self, reject: bool) -> Self {
        self.reject_loops = reject;
        self
    }

    pub fn default_result(&self) -> ForwardingResult {
        self.default_result
    }

    /// Append a filter; filters run in registration order
    pub fn register_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Request) -> Result<Option<ForwardingDecision>, FilterError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered forwarding filter {}", name);
        self.filters.write().push((name, Arc::new(filter)));
    }

    pub fn register_observer<F>(&self, observer: F)
    where
        F: Fn(&ForwardingDecision) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn filter_count(&self) -> usize {
        self.filters.read().len()
    }

    /// Decide what to do with a decoded inbound request
    pub fn decide(&self, request: &Request) -> ForwardingDecision {
        let decision = self.evaluate(request);
        let decision = self.finish(decision);
        self.observe(&decision);
        decision
    }

    /// Reject a request frame from `from` that could not be decoded
    ///
    /// Only the request id survived decoding, so no filters run. Observers get
    /// a `Format` response; the reverse path gets a `FormatViolation` error frame.
    pub fn reject_undecodable(
        &self,
        from: &NodeId,
        request_id: RequestId,
        format: SerializationFormat,
        reason: &str,
    ) -> ForwardingDecision {
        let request = Request::new(UNDECODABLE_ACTION, self.node_id.clone(), Value::Null)
            .with_request_id(request_id.clone())
            .with_network_path(NetworkPath::from_node(from.clone()))
            .with_format(format);

        let mut decision = ForwardingDecision::reject(&request, format!("undecodable request: {}", reason))
            .with_response(Response::failed(request_id.clone(), ResultCode::Format, reason));

        let error = ErrorFrame::new(request_id, ErrorCode::FormatViolation, reason);
        match encode_error(FrameKind::RequestError, &error, format) {
            Ok(frame) => decision.reject_frame = Some(frame),
            Err(e) => warn!("Cannot encode format error for {}: {}", error.request_id, e),
        }

        self.observe(&decision);
        decision
    }

    fn evaluate(&self, request: &Request) -> ForwardingDecision {
        if let Err(e) = self.policy.verify_request(request) {
            let response = Response::failed(
                request.request_id.clone(),
                ResultCode::SignatureError,
                e.to_string(),
            );
            return ForwardingDecision::reject(request, format!("signature verification failed: {}", e))
                .with_response(response);
        }

        if self.reject_loops
            && (request.network_path.contains(&self.node_id) || request.network_path.has_loop())
        {
            return ForwardingDecision::reject(
                request,
                format!("routing loop through {} (path {})", self.node_id, request.network_path),
            );
        }

        // Snapshot so filters may register further filters without deadlocking
        let filters: Vec<(String, RequestFilter)> = self.filters.read().clone();
        let mut chosen: Option<ForwardingDecision> = None;

        for (name, filter) in &filters {
            match filter(request) {
                Ok(Some(mut decision)) => match &chosen {
                    None => {
                        decision.filter = Some(name.clone());
                        chosen = Some(decision);
                    }
                    Some(first) => {
                        debug!(
                            "Filter {} voted {} for {} after {} already decided {}",
                            name,
                            decision.result,
                            request.request_id,
                            first.filter.as_deref().unwrap_or("?"),
                            first.result
                        );
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("Filter {} failed on {}: {}", name, request.request_id, e);
                }
            }
        }

        chosen.unwrap_or_else(|| match self.default_result {
            ForwardingResult::Forward => ForwardingDecision::forward(request, "default policy"),
            ForwardingResult::Drop => ForwardingDecision::drop(request, "default policy"),
            ForwardingResult::Reject => ForwardingDecision::reject(request, "default policy"),
        })
    }

    /// Synthesize, sign and encode the response of a DROP or REJECT
    fn finish(&self, mut decision: ForwardingDecision) -> ForwardingDecision {
        if decision.result == ForwardingResult::Forward {
            return decision;
        }

        if decision.result == ForwardingResult::Reject && decision.response.is_none() {
            decision.response = Some(Response::filtered(
                decision.request.request_id.clone(),
                DEFAULT_FILTERED_MESSAGE,
            ));
        }

        if let Some(response) = decision.response.as_mut() {
            response.request_id = decision.request.request_id.clone();
            if let Err(e) = self.policy.sign_response(response) {
                warn!("Cannot sign synthesized response for {}: {}", response.request_id, e);
            }
            match encode_response(response, decision.request.format) {
                Ok(frame) => decision.reject_frame = Some(frame),
                Err(e) => warn!("Cannot encode synthesized response for {}: {}", response.request_id, e),
            }
        }

        decision
    }

    fn observe(&self, decision: &ForwardingDecision) {
        info!(
            "{} {} {} from {} to {}: {} ({})",
            self.node_id,
            decision.result,
            decision.request.action,
            decision.request.network_path.source(),
            decision.request.destination,
            decision.reason,
            decision.filter.as_deref().unwrap_or("no filter")
        );

        let observers: Vec<DecisionObserver> = self.observers.read().clone();
        for observer in observers {
            observer(decision);
        }
    }
}
