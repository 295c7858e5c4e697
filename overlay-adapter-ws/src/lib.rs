//! # Overlay WebSocket Adapter
//!
//! Binds an [`OverlayNode`](overlay_core::OverlayNode) to real sockets:
//!
//! ```text
//!   parent hop (CSMS / gateway)
//!        ▲  ws://…/{our id}   run_uplink(): reconnect with backoff
//!        │
//! ┌──────┴──────────────┐
//! │  OverlayNode        │
//! └──────▲──────────────┘
//!        │  ws://us/…/{child id}   WsServer: peer id from the path
//!   child hops (stations, controllers)
//! ```
//!
//! Both directions offer the `ocpp2.1` and `ocpp1.6` subprotocols. Text
//! messages carry JSON frames, binary messages carry binary frames.

pub mod config;
pub mod error;
pub mod link;
pub mod client;
pub mod server;

pub use config::{UplinkConfig, WsConfig, OCPP_SUBPROTOCOLS};
pub use error::WsError;
pub use link::serve_socket;
pub use client::{build_url, run_uplink};
pub use server::{peer_from_path, WsServer};
