//! Tunnel-layer end-to-end tests: real multi-router builds over localhost
//! links, traffic through an established outbound tunnel, and the reject
//! path for hops that refuse transit.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use veilnet_core::{Message, MessageType};
use veilnet_daemon::{Router, RouterConfig};
use veilnet_transport::IncomingMessage;
use veilnet_tunnel::{Delivery, TunnelState};

struct TestRouter {
    router: Router,
    messages: mpsc::Receiver<IncomingMessage>,
    _data_dir: TempDir,
}

async fn spawn_router(accepts_tunnels: bool) -> TestRouter {
    let data_dir = TempDir::new().expect("tempdir");
    let config = RouterConfig {
        data_dir: data_dir.path().to_path_buf(),
        host: "127.0.0.1".parse().unwrap(),
        ntcp_port: 0,
        ssu_port: 0,
        enable_ntcp: true,
        enable_ssu: false,
        accepts_tunnels,
        peer_test: false,
    };
    let mut router = Router::start(config).await.expect("router start");
    let messages = router.take_message_receiver().expect("receiver");
    TestRouter {
        router,
        messages,
        _data_dir: data_dir,
    }
}

/// Everyone learns everyone's descriptor, as the netdb would provide.
fn seed_all(routers: &[&TestRouter]) {
    for a in routers {
        for b in routers {
            a.router.add_router_info(b.router.local_router_info());
        }
    }
}

async fn wait_for_state(
    router: &TestRouter,
    local_id: u32,
    inbound: bool,
    predicate: impl Fn(TunnelState) -> bool,
) -> TunnelState {
    timeout(Duration::from_secs(12), async {
        loop {
            if let Some(state) = router.router.tunnels().tunnel_state(local_id, inbound).await {
                if predicate(state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("tunnel never left the awaited state")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hop_outbound_tunnel_builds_and_carries_traffic() {
    let a = spawn_router(true).await;
    let x = spawn_router(true).await;
    let mut y = spawn_router(true).await;
    let z = spawn_router(true).await;
    seed_all(&[&a, &x, &y, &z]);

    // inbound reply path through Z first
    let inbound_id = a
        .router
        .tunnels()
        .build_inbound(vec![z.router.local_router_info()])
        .await
        .expect("inbound build submitted");
    let state = wait_for_state(&a, inbound_id, true, |s| s != TunnelState::Pending).await;
    assert_eq!(state, TunnelState::Established);

    let (reply_gateway, reply_tunnel_id) = a
        .router
        .tunnels()
        .gateway_of(inbound_id)
        .await
        .expect("inbound gateway available");
    assert_eq!(reply_gateway, z.router.context().ident_hash());

    // outbound through X then Y, replies routed via Z
    let outbound_id = a
        .router
        .tunnels()
        .build_outbound(
            vec![x.router.local_router_info(), y.router.local_router_info()],
            reply_gateway,
            reply_tunnel_id,
        )
        .await
        .expect("outbound build submitted");
    let state = wait_for_state(&a, outbound_id, false, |s| s != TunnelState::Pending).await;
    assert_eq!(state, TunnelState::Established);

    // traffic sent through the tunnel surfaces at the endpoint hop as a
    // local delivery
    let payload = vec![0x42u8; 600];
    let msg = Message::new(MessageType::Data, payload.clone());
    let msg_id = msg.msg_id;
    assert!(
        a.router
            .tunnels()
            .send_through(outbound_id, Delivery::Local, msg)
            .await
    );

    let received = timeout(Duration::from_secs(5), y.messages.recv())
        .await
        .expect("timed out waiting at the endpoint")
        .expect("channel closed");
    assert_eq!(received.message.msg_type, MessageType::Data);
    assert_eq!(received.message.msg_id, msg_id);
    assert_eq!(received.message.payload, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refusing_hop_fails_the_build() {
    let a = spawn_router(true).await;
    let w = spawn_router(false).await; // refuses transit
    seed_all(&[&a, &w]);

    let inbound_id = a
        .router
        .tunnels()
        .build_inbound(vec![w.router.local_router_info()])
        .await
        .expect("build submitted");
    let state = wait_for_state(&a, inbound_id, true, |s| s != TunnelState::Pending).await;
    assert_eq!(state, TunnelState::BuildFailed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn build_times_out_without_connectivity() {
    let a = spawn_router(true).await;
    // a descriptor nobody answers on: unseeded peer with a dead port
    let ghost = spawn_router(true).await;
    let ghost_info = ghost.router.local_router_info();
    drop(ghost);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let inbound_id = a
        .router
        .tunnels()
        .build_inbound(vec![ghost_info])
        .await
        .expect("build submitted");
    let state = wait_for_state(&a, inbound_id, true, |s| s != TunnelState::Pending).await;
    assert_eq!(state, TunnelState::BuildFailed);
}
