//! Reflexive-address discovery end-to-end against the in-tree binding
//! responder, exercising the cookie demultiplexer on the shared socket.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use wisp_core::MeshConfig;
use wisp_overlay::{MeshNode, StunServer, Timing};

fn short_timing() -> Timing {
    Timing {
        keepalive_period: Duration::from_millis(200),
        peer_timeout: Duration::from_millis(800),
        hole_punch_count: 3,
        hole_punch_spacing: Duration::from_millis(50),
        stun_timeout: Duration::from_millis(250),
    }
}

#[tokio::test]
async fn node_learns_reflexive_address_from_responder() {
    let responder = StunServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let mut cfg = MeshConfig::new("net", "s");
    cfg.stun_server = responder.local_addr().unwrap().to_string();

    let node = MeshNode::start_with_timing(cfg, short_timing())
        .await
        .unwrap();

    let expected_port = node.local_addr().unwrap().port();
    let external = node.external_addr().await;
    assert_eq!(
        external,
        Some((IpAddr::V4(Ipv4Addr::LOCALHOST), expected_port).into()),
        "responder sees the overlay socket itself"
    );
}

#[tokio::test]
async fn keepalive_tick_refreshes_reflexive_address() {
    // Responder comes up only after the node started, so the initial
    // query fails and the first keepalive tick must recover.
    let mut cfg = MeshConfig::new("net", "s");
    let placeholder = StunServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let stun_addr = placeholder.local_addr().unwrap();
    drop(placeholder);
    cfg.stun_server = stun_addr.to_string();

    let node = MeshNode::start_with_timing(cfg, short_timing())
        .await
        .unwrap();
    assert_eq!(node.external_addr().await, None);

    // Rebind the responder on the same port the node is configured for.
    let responder = StunServer::bind(stun_addr).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut refreshed = false;
    while Instant::now() < deadline {
        if node.external_addr().await.is_some() {
            refreshed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    drop(responder);
    assert!(refreshed, "keepalive tick never refreshed the address");
}

#[tokio::test]
async fn dead_stun_server_leaves_node_running() {
    let mut cfg = MeshConfig::new("net", "s");
    cfg.stun_server = "127.0.0.1:1".into();
    let node = MeshNode::start_with_timing(cfg, short_timing())
        .await
        .unwrap();

    assert_eq!(node.external_addr().await, None);
    assert!(node.get_peers().await.is_empty());
    assert!(node.local_addr().is_ok());
}
