//! # Overlay Core
//!
//! Routing and request/response correlation for an OCPP overlay network of
//! hops: charging stations, local controllers, gateways and the CSMS.
//!
//! ```text
//!   A (station)            B (local controller)              C (CSMS)
//! ┌─────────────┐        ┌───────────────────────┐        ┌────────────┐
//! │ dispatch()  │ [A] ──►│ verify → filters →    │[A,B]──►│ handler    │
//! │ Correlation │        │ default policy        │        │            │
//! │ Engine      │◄───────│ FORWARD / DROP / REJECT│◄───────│ Response   │
//! └─────────────┘        └───────────────────────┘        └────────────┘
//! ```
//!
//! Every hop appends itself to the request's [`NetworkPath`]. Intermediate
//! hops run the [`ForwardingPipeline`]; forwarded requests re-enter the
//! [`CorrelationEngine`] and the outcome is relayed back along the reverse
//! path. Every failure ends up as a [`Response`] carrying a [`ResultCode`].
//!
//! ## Usage
//!
//! ```no_run
//! use overlay_core::{link, NodeConfig, OverlayNode};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let station = OverlayNode::new(NodeConfig::new("CS1")).await?;
//! let csms = OverlayNode::new(NodeConfig::new("CSMS")).await?;
//! csms.register_handler("Heartbeat", |_| async { Ok(json!({"currentTime": "2024-01-01T00:00:00Z"})) });
//! let _link = link(&station, &csms).await;
//!
//! let request = station.new_request("Heartbeat", csms.id().clone(), json!({}));
//! let response = station.dispatch(request).await;
//! assert!(response.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod path;
pub mod destination;
pub mod outcome;
pub mod envelope;
pub mod signature;
pub mod frame;
pub mod transport;
pub mod router;
pub mod correlation;
pub mod forwarding;
pub mod config;
pub mod node;
pub mod memory;

pub use types::*;
pub use path::{NetworkPath, PathError};
pub use destination::Destination;
pub use outcome::ResultCode;
pub use envelope::{Request, Response, SerializationFormat, DEFAULT_REQUEST_TIMEOUT};
pub use signature::{Signature, SignatureError, SignaturePolicy, SigningIdentity};
pub use frame::{decode, ErrorCode, ErrorFrame, Frame, FrameError, WireFrame};
pub use transport::{Connection, Outbound, TransportError};
pub use router::Router;
pub use correlation::CorrelationEngine;
pub use forwarding::{
    DecisionObserver, FilterError, ForwardingDecision, ForwardingPipeline, ForwardingResult,
    RequestFilter,
};
pub use config::{ConfigError, NodeConfig, SignatureConfig};
pub use node::{HandlerError, OverlayNode, RequestHandler};
pub use memory::{link, MemoryLink};
