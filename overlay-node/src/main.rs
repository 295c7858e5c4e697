//! Overlay Node - CLI running one OCPP overlay hop
//!
//! The same binary plays any role in the overlay: a charging station with an
//! uplink, a local controller or gateway with both an uplink and a listener,
//! or a CSMS that only listens.
//!
//! # Usage
//!
//! ```bash
//! # CSMS
//! overlay-node --name CSMS --listen 0.0.0.0:9000
//!
//! # Local controller relaying stations to the CSMS
//! overlay-node --name LC-1 --listen 0.0.0.0:9100 \
//!     --uplink CSMS=ws://csms.local:9000/ocpp
//!
//! # Station behind the local controller, signing its requests
//! overlay-node --name CS-001 --uplink LC-1=ws://lc.local:9100/ocpp \
//!     --signing-key CS-001=<hex seed> --heartbeat-interval 60
//!
//! # Print a fresh key pair
//! overlay-node --name any --generate-key
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use overlay_adapter_ws::{run_uplink, WsConfig, WsServer};
use overlay_core::{
    ForwardingResult, HandlerError, NodeConfig, NodeId, OverlayNode, SigningIdentity,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP overlay hop
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node id of this hop
    #[arg(short, long)]
    name: String,

    /// Accept downstream hops on this address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Parent hop as PEER=URL (can be repeated)
    #[arg(long, value_parser = parse_pair)]
    uplink: Vec<(String, String)>,

    /// What to do with requests no filter decides on (forward, drop, reject)
    #[arg(long, default_value = "forward")]
    default_forwarding: ForwardingResult,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Signing key as KEY_ID=HEX_SEED (can be repeated)
    #[arg(long, value_parser = parse_pair)]
    signing_key: Vec<(String, String)>,

    /// Signing key read from a file holding the hex seed, as KEY_ID=PATH
    #[arg(long, value_parser = parse_pair)]
    signing_key_file: Vec<(String, String)>,

    /// Trusted public key as KEY_ID=HEX (can be repeated)
    #[arg(long, value_parser = parse_pair)]
    trust: Vec<(String, String)>,

    /// Key id whose signature every inbound envelope must carry
    #[arg(long)]
    require_key: Vec<String>,

    /// Inbound envelopes must carry at least one valid signature
    #[arg(long)]
    require_signatures: bool,

    /// Fail on signatures by unknown keys
    #[arg(long)]
    reject_unknown_keys: bool,

    /// Static route as TARGET=VIA (can be repeated)
    #[arg(long, value_parser = parse_pair)]
    route: Vec<(String, String)>,

    /// Next hop for unknown destinations (defaults to the first uplink)
    #[arg(long)]
    default_route: Option<String>,

    /// Reject requests whose path already visited this hop
    #[arg(long)]
    reject_loops: bool,

    /// Send a Heartbeat up the default route every N seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Print a new signing key and exit
    #[arg(long)]
    generate_key: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> std::io::Result<NodeConfig> {
        let mut config = NodeConfig::new(&self.name)
            .with_default_forwarding(self.default_forwarding)
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_loop_rejection(self.reject_loops);

        for (key_id, seed) in &self.signing_key {
            config = config.with_signing_key(key_id, seed);
        }
        for (key_id, path) in &self.signing_key_file {
            let seed = std::fs::read_to_string(path)?;
            config = config.with_signing_key(key_id, seed.trim());
        }
        for (key_id, public) in &self.trust {
            config = config.with_trusted_key(key_id, public);
        }
        for key_id in &self.require_key {
            config = config.with_required_key(key_id);
        }
        config.signature.require_signatures = self.require_signatures;
        config.signature.reject_unknown_keys = self.reject_unknown_keys;

        for (target, via) in &self.route {
            config = config.with_route(target, via);
        }
        if let Some(via) = self.default_route.as_ref().or(self.uplink.first().map(|(peer, _)| peer)) {
            config = config.with_default_route(via);
        }

        Ok(config)
    }

    fn ws_config(&self) -> WsConfig {
        let mut config = WsConfig::default();
        if let Some(addr) = self.listen {
            config = config.with_listen(addr);
        }
        for (peer, url) in &self.uplink {
            config = config.with_uplink(peer, url);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.generate_key {
        let identity = SigningIdentity::generate(args.name.clone());
        println!("key id: {}", identity.key_id);
        println!("seed:   {}", identity.seed_hex());
        println!("public: {}", identity.public_key_hex());
        return Ok(());
    }

    let node_config = args.node_config()?;
    let heartbeat_via = node_config.default_route.clone();
    let ws_config = args.ws_config();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  Overlay Node - OCPP Hop                     ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Listen:   {:<50} ║", args.listen.map(|a| a.to_string()).unwrap_or_else(|| "-".into()));
    for (peer, url) in &args.uplink {
        println!("║  Uplink:   {:<50} ║", truncate(&format!("{} @ {}", peer, url), 50));
    }
    println!("║  Default:  {:<50} ║", args.default_forwarding);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let node = OverlayNode::new(node_config).await?;
    register_builtin_handlers(&node);

    if let Some(addr) = ws_config.listen {
        let server = WsServer::bind(node.clone(), addr, ws_config.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Listener stopped: {}", e);
            }
        });
    }

    for uplink in ws_config.uplinks.clone() {
        let node = node.clone();
        let config = ws_config.clone();
        tokio::spawn(async move {
            let peer = uplink.peer.clone();
            if let Err(e) = run_uplink(node, uplink, config).await {
                error!("Uplink to {} stopped: {}", peer, e);
            }
        });
    }

    if let (Some(secs), Some(via)) = (args.heartbeat_interval, heartbeat_via) {
        let via = NodeId::parse(&via)?;
        tokio::spawn(heartbeat_loop(node.clone(), via, Duration::from_secs(secs.max(1))));
    }

    info!("Node {} running, Ctrl-C to stop", node.id());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

/// Actions every hop answers when addressed directly
fn register_builtin_handlers(node: &Arc<OverlayNode>) {
    node.register_handler("Heartbeat", |_req| async {
        Ok(json!({ "currentTime": chrono::Utc::now().to_rfc3339() }))
    });

    node.register_handler("DataTransfer", |req| async move {
        let vendor = req.payload["vendorId"]
            .as_str()
            .ok_or_else(|| HandlerError::Format("vendorId is required".into()))?;
        info!("DataTransfer from {} ({})", req.network_path.source(), vendor);
        Ok::<_, HandlerError>(json!({ "status": "Accepted", "data": req.payload["data"] }))
    });
}

async fn heartbeat_loop(node: Arc<OverlayNode>, via: NodeId, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let request = node.new_request("Heartbeat", via.clone(), json!({}));
        let response = node.dispatch(request).await;
        if response.is_ok() {
            info!("Heartbeat to {}: {}", via, response.payload);
        } else {
            warn!(
                "Heartbeat to {} failed: {} {}",
                via,
                response.result,
                response.description.unwrap_or_default()
            );
        }
    }
}

/// Parse `KEY=VALUE`
fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() && !v.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
