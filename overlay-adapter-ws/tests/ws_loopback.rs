//! Two nodes talking over a local WebSocket

use std::sync::Arc;
use std::time::Duration;

use overlay_adapter_ws::{run_uplink, WsConfig, WsServer};
use overlay_core::{NodeConfig, NodeId, OverlayNode, ResultCode, SerializationFormat};
use serde_json::json;

fn id(s: &str) -> NodeId {
    NodeId::parse(s).unwrap()
}

async fn wait_for_peer(node: &Arc<OverlayNode>, peer: &NodeId) {
    for _ in 0..200 {
        if node.router().connection(peer).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never connected to {}", peer, node.id());
}

#[tokio::test]
async fn test_requests_cross_the_socket_both_ways() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let csms = OverlayNode::new(NodeConfig::new("CSMS")).await.unwrap();
    csms.register_handler("BootNotification", |req| async move {
        Ok(json!({"status": "Accepted", "interval": 300, "model": req.payload["model"]}))
    });

    let station = OverlayNode::new(NodeConfig::new("CS-001")).await.unwrap();
    station.register_handler("Reset", |_| async { Ok(json!({"status": "Scheduled"})) });

    let server = WsServer::bind(csms.clone(), "127.0.0.1:0".parse().unwrap(), WsConfig::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let config = WsConfig::default()
        .with_uplink("CSMS", format!("ws://{}/ocpp", addr))
        .with_reconnect(Duration::from_millis(50), Duration::from_millis(200));
    tokio::spawn(run_uplink(station.clone(), config.uplinks[0].clone(), config.clone()));

    wait_for_peer(&station, &id("CSMS")).await;
    wait_for_peer(&csms, &id("CS-001")).await;

    let boot = station
        .new_request("BootNotification", id("CSMS"), json!({"model": "EK3"}))
        .with_timeout(Duration::from_secs(5));
    let response = station.dispatch(boot).await;
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.payload["model"], "EK3");

    let reset = csms
        .new_request("Reset", id("CS-001"), json!({"type": "Immediate"}))
        .with_timeout(Duration::from_secs(5))
        .with_format(SerializationFormat::Binary);
    let response = csms.dispatch(reset).await;
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.payload["status"], "Scheduled");
}
