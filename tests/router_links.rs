//! Link-level end-to-end tests: two in-process routers over localhost
//! sockets, exercising both wire transports and the descriptor lifecycle.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use veilnet_core::{Message, MessageType, RouterStatus};
use veilnet_daemon::{Router, RouterConfig};
use veilnet_transport::IncomingMessage;

struct TestRouter {
    router: Router,
    messages: mpsc::Receiver<IncomingMessage>,
    _data_dir: TempDir,
}

async fn spawn_router(enable_ntcp: bool, enable_ssu: bool) -> TestRouter {
    let data_dir = TempDir::new().expect("tempdir");
    let config = RouterConfig {
        data_dir: data_dir.path().to_path_buf(),
        host: "127.0.0.1".parse().unwrap(),
        ntcp_port: 0,
        ssu_port: 0,
        enable_ntcp,
        enable_ssu,
        accepts_tunnels: true,
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

async fn expect_message(
    receiver: &mut mpsc::Receiver<IncomingMessage>,
    within: Duration,
) -> IncomingMessage {
    timeout(within, receiver.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ntcp_loopback_delivery() {
    let a = spawn_router(true, false).await;
    let mut b = spawn_router(true, false).await;

    a.router.add_router_info(b.router.local_router_info());

    let mut payload = Vec::new();
    payload.extend_from_slice(&0xDEADu32.to_be_bytes());
    payload.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
    let msg = Message::with_id(MessageType::DeliveryStatus, 0xDEAD, payload.clone());

    a.router
        .send_message(b.router.context().ident_hash(), msg);

    let received = expect_message(&mut b.messages, Duration::from_secs(2)).await;
    assert_eq!(received.message.msg_type, MessageType::DeliveryStatus);
    assert_eq!(received.message.msg_id, 0xDEAD);
    assert_eq!(received.message.payload, payload);
    assert_eq!(received.from, a.router.context().ident_hash());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ssu_fragmented_delivery() {
    let a = spawn_router(false, true).await;
    let mut b = spawn_router(false, true).await;

    a.router.add_router_info(b.router.local_router_info());

    // several SSU fragments worth of payload
    let payload: Vec<u8> = (0..3500).map(|i| (i % 251) as u8).collect();
    let msg = Message::new(MessageType::Data, payload.clone());
    let msg_id = msg.msg_id;

    a.router
        .send_message(b.router.context().ident_hash(), msg);

    let received = expect_message(&mut b.messages, Duration::from_secs(10)).await;
    assert_eq!(received.message.msg_type, MessageType::Data);
    assert_eq!(received.message.msg_id, msg_id);
    assert_eq!(received.message.payload, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_messages_flush_in_order() {
    let a = spawn_router(true, false).await;
    let mut b = spawn_router(true, false).await;

    a.router.add_router_info(b.router.local_router_info());
    let b_ident = b.router.context().ident_hash();

    // all queued before any session exists
    let mut ids = Vec::new();
    for i in 0..5u8 {
        let msg = Message::new(MessageType::Data, vec![i; 40]);
        ids.push(msg.msg_id);
        a.router.send_message(b_ident, msg);
    }
    for expected in ids {
        let received = expect_message(&mut b.messages, Duration::from_secs(5)).await;
        assert_eq!(received.message.msg_id, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn introducer_relays_firewalled_peer() {
    // B is firewalled; C introduces; A reaches B through C's relay
    let a = spawn_router(false, true).await;
    let mut b = spawn_router(false, true).await;
    let c = spawn_router(false, true).await;

    b.router.context().set_status(RouterStatus::Firewalled);
    b.router.add_router_info(c.router.local_router_info());

    // establish B -> C so C hands out a relay tag
    b.router.send_message(
        c.router.context().ident_hash(),
        Message::new(MessageType::Data, vec![1; 16]),
    );

    // wait until B republishes with an introducer and no direct host
    let b_info = timeout(Duration::from_secs(10), async {
        loop {
            let info = b.router.local_router_info();
            let has_introducer = info
                .address(veilnet_core::TransportStyle::Ssu, |_| true)
                .map(|addr| !addr.introducers().is_empty())
                .unwrap_or(false);
            if has_introducer {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("introducer was never published");
    let ssu_addr = b_info
        .address(veilnet_core::TransportStyle::Ssu, |_| true)
        .unwrap();
    assert!(ssu_addr.socket_addr().is_none(), "firewalled peer must not publish a host");

    a.router.add_router_info(b_info);
    let payload = vec![7u8; 64];
    a.router.send_message(
        b.router.context().ident_hash(),
        Message::new(MessageType::Data, payload.clone()),
    );

    let received = expect_message(&mut b.messages, Duration::from_secs(10)).await;
    assert_eq!(received.message.payload, payload);
    assert_eq!(received.from, a.router.context().ident_hash());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn router_info_resign_is_idempotent() {
    let a = spawn_router(true, true).await;
    let ctx = a.router.context();

    let before = a.router.local_router_info();
    before.verify().unwrap();
    let published_before = before.published();

    ctx.update_router_info(|ri| ri.set_property("family", "veilnet-test"))
        .unwrap();

    let after = a.router.local_router_info();
    after.verify().unwrap();
    assert!(after.published() > published_before);
    assert_eq!(after.family(), Some("veilnet-test"));
    assert_eq!(after.ident_hash(), before.ident_hash());
    assert_eq!(after.addresses(), before.addresses());
}
