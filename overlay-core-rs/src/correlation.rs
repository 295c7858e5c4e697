//! Request/response correlation
//!
//! `dispatch` turns "send this request to that destination" into a single
//! [`Response`]. Each call registers a [`PendingCall`] keyed by request id and
//! is resolved by whichever comes first:
//! - a response frame with the same request id
//! - a request-error frame with the same request id
//! - the deadline
//! - the caller's cancellation future
//!
//! The call is registered before its frame is handed to the transport, and
//! the send itself is one more racer, so a stalled link cannot hold a call
//! past its deadline. Resolution removes the entry under the table lock, so
//! exactly one of the racers wins and the rest find nothing to resolve. A
//! dropped `dispatch` future removes its own entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::destination::Destination;
use crate::envelope::{Request, Response};
use crate::frame::{encode_request, ErrorFrame, WireFrame};
use crate::outcome::ResultCode;
use crate::router::Router;
use crate::signature::SignaturePolicy;
use crate::transport::Connection;
use crate::types::{NodeId, RequestId};

/// An in-flight call awaiting its outcome
struct PendingCall {
    /// Tells apart calls that reuse a request id after an earlier one resolved
    seq: u64,
    destination: Destination,
    issued: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Response>,
}

/// Drops the call's entry when `dispatch` returns or its future is dropped
struct PendingGuard<'a> {
    engine: &'a CorrelationEngine,
    request_id: RequestId,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.engine.take(&self.request_id, self.seq) {
            debug!(
                "Request {} to {} abandoned {:?} before its deadline",
                self.request_id,
                call.destination,
                call.deadline.saturating_duration_since(Instant::now())
            );
        }
    }
}

/// A registered call whose frame has not been sent yet
struct Prepared<'a> {
    connection: Connection,
    frame: WireFrame,
    slot: oneshot::Receiver<Response>,
    deadline: Instant,
    guard: PendingGuard<'a>,
}

/// Sends requests and matches their replies
pub struct CorrelationEngine {
    node_id: NodeId,
    policy: Arc<SignaturePolicy>,
    router: Arc<Router>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_seq: AtomicU64,
}

impl CorrelationEngine {
    pub fn new(node_id: NodeId, policy: Arc<SignaturePolicy>, router: Arc<Router>) -> Self {
        Self {
            node_id,
            policy,
            router,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Number of calls still awaiting an outcome
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    /// Send a request and wait for its correlated outcome
    pub async fn dispatch(&self, request: Request) -> Response {
        self.dispatch_until(request, std::future::pending::<()>()).await
    }

    /// Like [`dispatch`](Self::dispatch), but gives up when `cancel` completes
    ///
    /// The deadline runs from registration, so a transport that never
    /// accepts or completes the frame still ends in `Timeout`.
    pub async fn dispatch_until<C>(&self, mut request: Request, cancel: C) -> Response
    where
        C: Future<Output = ()>,
    {
        let request_id = request.request_id.clone();
        let timeout = request.timeout;

        let Prepared {
            connection,
            frame,
            mut slot,
            deadline,
            guard,
        } = match self.prepare(&mut request).await {
            Ok(prepared) => prepared,
            Err(response) => return response,
        };

        let send = connection.send(frame);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(send, expiry, cancel);
        let mut sending = true;

        loop {
            tokio::select! {
                sent = &mut send, if sending => {
                    sending = false;
                    if let Err(e) = sent {
                        warn!("Send of request {} failed: {}", request_id, e);
                        if self.take(&request_id, guard.seq).is_some() {
                            return Response::exception(request_id, e.to_string());
                        }
                        // A reply raced the completion report; the slot already holds it
                    }
                }
                resolved = &mut slot => {
                    return match resolved {
                        Ok(response) => response,
                        Err(_) => Response::exception(request_id, "pending call dropped"),
                    };
                }
                _ = &mut expiry => {
                    return self.expire(&request_id, guard.seq, &mut slot, false, timeout);
                }
                _ = &mut cancel => {
                    return self.expire(&request_id, guard.seq, &mut slot, true, timeout);
                }
            }
        }
    }

    /// Sign, encode, route and register. Any failure becomes the final response.
    async fn prepare(&self, request: &mut Request) -> Result<Prepared<'_>, Response> {
        let request_id = request.request_id.clone();

        request.network_path = request.network_path.append(self.node_id.clone());

        if let Err(e) = self.policy.sign_request(request) {
            warn!("Cannot sign request {} ({}): {}", request_id, request.action, e);
            return Err(Response::failed(
                request_id,
                ResultCode::SignatureError,
                e.to_string(),
            ));
        }

        let frame = encode_request(request).map_err(|e| {
            warn!("Cannot encode request {}: {}", request_id, e);
            Response::exception(request_id.clone(), e.to_string())
        })?;

        let connection = self
            .router
            .next_hop(&request.destination)
            .await
            .ok_or_else(|| {
                warn!("No route to {} for request {}", request.destination, request_id);
                Response::exception(
                    request_id.clone(),
                    format!("no route to {}", request.destination),
                )
            })?;

        let issued = Instant::now();
        let deadline = issued.checked_add(request.timeout).ok_or_else(|| {
            warn!("Request {} has an out of range timeout {:?}", request_id, request.timeout);
            Response::exception(
                request_id.clone(),
                format!("request timeout {:?} is out of range", request.timeout),
            )
        })?;

        let (slot_tx, slot_rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(Response::exception(
                    request_id,
                    "a call with this request id is already in flight",
                ));
            }
            pending.insert(
                request_id.clone(),
                PendingCall {
                    seq,
                    destination: request.destination.clone(),
                    issued,
                    deadline,
                    slot: slot_tx,
                },
            );
        }

        debug!(
            "Sending {} {} to {} via {} (path {}, timeout {:?})",
            request.action,
            request_id,
            request.destination,
            connection.peer(),
            request.network_path,
            request.timeout
        );

        Ok(Prepared {
            connection,
            frame,
            slot: slot_rx,
            deadline,
            guard: PendingGuard {
                engine: self,
                request_id,
                seq,
            },
        })
    }

    /// Remove the entry only if it still belongs to call `seq`
    fn take(&self, request_id: &RequestId, seq: u64) -> Option<PendingCall> {
        let mut pending = self.pending.lock();
        if pending.get(request_id).is_some_and(|call| call.seq == seq) {
            pending.remove(request_id)
        } else {
            None
        }
    }

    /// Resolve a call from the deadline or cancellation branch
    fn expire(
        &self,
        request_id: &RequestId,
        seq: u64,
        slot: &mut oneshot::Receiver<Response>,
        cancelled: bool,
        timeout: Duration,
    ) -> Response {
        match self.take(request_id, seq) {
            Some(call) => {
                if cancelled {
                    info!("Request {} to {} cancelled by caller", request_id, call.destination);
                    Response::cancelled(request_id.clone())
                } else {
                    warn!(
                        "Request {} to {} timed out after {:?}",
                        request_id,
                        call.destination,
                        call.deadline.duration_since(call.issued)
                    );
                    Response::timeout(request_id.clone(), timeout)
                }
            }
            // Resolved between the timer firing and taking the lock
            None => slot
                .try_recv()
                .unwrap_or_else(|_| Response::timeout(request_id.clone(), timeout)),
        }
    }

    fn resolve(&self, request_id: &RequestId, response: impl FnOnce(&PendingCall) -> Response) -> bool {
        let Some(call) = self.pending.lock().remove(request_id) else {
            debug!("Discarding reply for unknown or already resolved request {}", request_id);
            return false;
        };

        let response = response(&call);
        debug!(
            "Request {} resolved with {} after {:?}",
            request_id,
            response.result,
            call.issued.elapsed()
        );
        call.slot.send(response).is_ok()
    }

    /// Feed a response frame. Returns true if it resolved a pending call.
    pub fn on_response(&self, response: Response) -> bool {
        let request_id = response.request_id.clone();
        let verified = match self.policy.verify_response(&response) {
            Ok(()) => response,
            Err(e) => {
                warn!("Response to {} failed verification: {}", request_id, e);
                Response::failed(request_id.clone(), ResultCode::SignatureError, e.to_string())
            }
        };
        self.resolve(&request_id, move |_| verified)
    }

    /// Feed a request-error frame. Returns true if it resolved a pending call.
    pub fn on_request_error(&self, error: ErrorFrame) -> bool {
        let request_id = error.request_id.clone();
        self.resolve(&request_id, move |call| {
            info!(
                "Request {} to {} failed at peer: {:?} {}",
                error.request_id, call.destination, error.error_code, error.description
            );
            Response::failed(
                error.request_id,
                ResultCode::from(error.error_code),
                error.description,
            )
            .with_payload(error.details)
        })
    }

    /// A reply for `request_id` arrived but could not be decoded
    pub fn on_malformed_reply(&self, request_id: &RequestId, reason: &str) -> bool {
        self.resolve(request_id, |_| {
            Response::failed(
                request_id.clone(),
                ResultCode::Format,
                format!("malformed reply: {}", reason),
            )
        })
    }
}
