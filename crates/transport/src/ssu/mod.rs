//! SSU server: one task owns the UDP socket, every session, the relay-tag
//! registry (introducer role), and the peer-test state machine. Commands
//! arrive over a channel; timers run off a one-second sweep.

mod data;
mod packet;
mod session;

pub use packet::{SSU_MTU_V4, SSU_MTU_V6};
pub use session::SessionKeys;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use veilnet_core::{
    IdentHash, Introducer, Message, RouterContext, RouterInfo, RouterStatus, TransportStyle,
};

use crate::ssu::packet::{
    build_packet, decrypt_packet, read_sized_ip, validate_packet, write_sized_ip, Packet,
    PAYLOAD_DATA, PAYLOAD_PEER_TEST, PAYLOAD_RELAY_INTRO, PAYLOAD_RELAY_REQUEST,
    PAYLOAD_RELAY_RESPONSE, PAYLOAD_SESSION_CONFIRMED, PAYLOAD_SESSION_CREATED,
    PAYLOAD_SESSION_DESTROYED, PAYLOAD_SESSION_REQUEST,
};
use crate::ssu::session::{SsuSession, SsuState};
use crate::supplier::DhSupplier;
use crate::transports::TransportEvent;
use crate::{IncomingMessage, Result, SessionHandle, SessionKind, SessionRole};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(330);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const PEER_TEST_TIMEOUT: Duration = Duration::from_secs(20);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Outbound queue depth per session.
const SEND_QUEUE_DEPTH: usize = 64;

pub(crate) enum SsuCmd {
    Connect { remote: RouterInfo, peer_test: bool },
    SendTo { remote: IdentHash, msg: Message },
}

/// Handle to the SSU server task.
pub struct SsuServer {
    cmd_tx: mpsc::Sender<SsuCmd>,
}

impl SsuServer {
    pub(crate) async fn start(
        ctx: Arc<RouterContext>,
        supplier: Arc<DhSupplier>,
        bind: SocketAddr,
        peer_test_enabled: bool,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(Self, SocketAddr)> {
        let socket = UdpSocket::bind(bind).await?;
        let local = socket.local_addr()?;
        info!(%local, "SSU listening");

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let server = ServerState {
            ctx,
            supplier,
            socket: Arc::new(socket),
            local_addr: local,
            events,
            cmd_tx: cmd_tx.clone(),
            sessions: HashMap::new(),
            by_ident: HashMap::new(),
            relays: HashMap::new(),
            pending_intros: HashMap::new(),
            peer_tests: HashMap::new(),
            peer_test_enabled,
        };
        tokio::spawn(server.run(cmd_rx));
        Ok((Self { cmd_tx }, local))
    }

    pub(crate) fn connect(&self, remote: RouterInfo, peer_test: bool) {
        let _ = self.cmd_tx.try_send(SsuCmd::Connect { remote, peer_test });
    }
}

/// A peer test we are involved in.
struct PeerTest {
    role: PeerTestRole,
    deadline: Instant,
    /// Alice's endpoint and intro key, when we are Bob.
    alice: Option<(SocketAddr, [u8; 32])>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PeerTestRole {
    Alice,
    Bob,
    Charlie,
}

struct ServerState {
    ctx: Arc<RouterContext>,
    supplier: Arc<DhSupplier>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
    cmd_tx: mpsc::Sender<SsuCmd>,
    sessions: HashMap<SocketAddr, SsuSession>,
    by_ident: HashMap<IdentHash, SocketAddr>,
    /// Relay tags we handed out as introducer: tag -> firewalled peer.
    relays: HashMap<u32, SocketAddr>,
    /// Relay requests in flight: nonce -> target router.
    pending_intros: HashMap<u32, RouterInfo>,
    peer_tests: HashMap<u32, PeerTest>,
    peer_test_enabled: bool,
}

impl ServerState {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SsuCmd>) {
        let mut buf = vec![0u8; 2 * SSU_MTU_V6];
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            let datagram = buf[..len].to_vec();
                            self.handle_datagram(from, &datagram).await;
                        }
                        Err(err) => warn!(%err, "SSU recv failed"),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SsuCmd::Connect { remote, peer_test }) => {
                            self.connect(remote, peer_test).await;
                        }
                        Some(SsuCmd::SendTo { remote, msg }) => {
                            self.send_to(remote, msg).await;
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) {
        if let Err(err) = self.socket.send_to(packet, to).await {
            warn!(%to, %err, "SSU send failed");
        }
    }

    /// Our intro key is the identity hash, as advertised in our SSU address.
    fn our_intro_key(&self) -> [u8; 32] {
        *self.ctx.ident_hash().as_bytes()
    }

    /// Our published SSU endpoint (falls back to the bound socket address).
    fn our_advertised_addr(&self) -> SocketAddr {
        self.ctx
            .router_info()
            .ssu_address()
            .and_then(|a| a.socket_addr())
            .unwrap_or(self.local_addr)
    }

    async fn connect(&mut self, remote: RouterInfo, peer_test: bool) {
        let remote_ident = remote.ident_hash();
        if let Some(endpoint) = self.by_ident.get(&remote_ident) {
            if self
                .sessions
                .get(endpoint)
                .map(SsuSession::is_established)
                .unwrap_or(false)
            {
                return;
            }
        }

        let direct = remote.ssu_address().and_then(|a| a.socket_addr());
        let want_test = peer_test
            || (self.peer_test_enabled && self.ctx.status() == RouterStatus::Testing);
        if let Some(endpoint) = direct {
            let mut session = SsuSession::new(endpoint, Some(remote), SessionRole::Client);
            session.want_peer_test = want_test;
            let dh = self.supplier.acquire().await;
            match session.send_session_request(&self.ctx, dh) {
                Ok(packet) => {
                    self.send_packet(endpoint, &packet).await;
                    self.sessions.insert(endpoint, session);
                }
                Err(err) => warn!(%err, "SSU session request failed"),
            }
            return;
        }

        // no direct route: go through an introducer we already talk to
        // (firewalled peers advertise SSU addresses without a host)
        let introducers = remote
            .address(TransportStyle::Ssu, |_| true)
            .map(|a| a.introducers())
            .unwrap_or_default();
        for intro in introducers {
            let intro_endpoint = SocketAddr::new(intro.host, intro.port);
            let nonce: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
            let payload = relay_request_payload(intro.tag, &self.our_intro_key(), nonce);
            let packet = match self.sessions.get(&intro_endpoint) {
                Some(s) if s.is_established() => {
                    let keys = s.keys.as_ref().expect("established has keys");
                    build_packet(
                        PAYLOAD_RELAY_REQUEST,
                        &payload,
                        &keys.session_key,
                        &keys.mac_key,
                    )
                }
                _ => build_packet(PAYLOAD_RELAY_REQUEST, &payload, &intro.key, &intro.key),
            };
            self.pending_intros.insert(nonce, remote.clone());
            self.send_packet(intro_endpoint, &packet).await;
            debug!(target = %remote_ident.abbrev(), via = %intro_endpoint, "relay request sent");
            return;
        }
        warn!(target = %remote_ident.abbrev(), "peer has neither direct SSU address nor introducers");
        let _ = self
            .events
            .send(TransportEvent::ConnectFailed {
                remote: remote_ident,
                kind: SessionKind::Ssu,
            })
            .await;
    }

    async fn send_to(&mut self, remote: IdentHash, msg: Message) {
        let Some(endpoint) = self.by_ident.get(&remote).copied() else {
            debug!(peer = %remote.abbrev(), "no SSU session, message dropped");
            return;
        };
        let Some(session) = self.sessions.get_mut(&endpoint) else {
            return;
        };
        if !session.is_established() {
            return;
        }
        let keys = session.keys.clone().expect("established has keys");
        session.last_send = Instant::now();
        let packets = session.data.send(&msg, &keys);
        for packet in packets {
            self.send_packet(endpoint, &packet).await;
        }
    }

    async fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        if datagram.is_empty() {
            // hole punch: an introduced peer is now reachable, dial it
            let introduced = self
                .sessions
                .get(&from)
                .map(|s| s.state == SsuState::Introduced)
                .unwrap_or(false);
            if introduced {
                debug!(%from, "hole punch received, starting handshake");
                let dh = self.supplier.acquire().await;
                let ctx = self.ctx.clone();
                let request = match self.sessions.get_mut(&from) {
                    Some(session) => {
                        session.state = SsuState::Unknown;
                        session.send_session_request(&ctx, dh)
                    }
                    None => return,
                };
                match request {
                    Ok(packet) => self.send_packet(from, &packet).await,
                    Err(err) => warn!(%err, "post-punch session request failed"),
                }
            }
            return;
        }

        // established (or establishing) sessions first, by session key
        let session_keys = self.sessions.get(&from).and_then(|s| s.keys.clone());
        if let Some(keys) = session_keys {
            if validate_packet(datagram, &keys.mac_key) {
                match decrypt_packet(datagram, &keys.session_key) {
                    Ok(packet) => {
                        if let Some(session) = self.sessions.get_mut(&from) {
                            session.touch();
                        }
                        self.dispatch_session_packet(from, packet).await;
                    }
                    Err(err) => debug!(%from, %err, "SSU decrypt failed"),
                }
                return;
            }
        }

        // pending client sessions expect session-created under the peer's
        // intro key
        let pending_intro_key = self
            .sessions
            .get(&from)
            .filter(|s| s.state == SsuState::RequestSent)
            .and_then(|s| s.remote_router.as_ref())
            .and_then(|r| r.address(TransportStyle::Ssu, |_| true))
            .and_then(|a| a.intro_key());
        if let Some(intro_key) = pending_intro_key {
            if validate_packet(datagram, &intro_key) {
                match decrypt_packet(datagram, &intro_key) {
                    Ok(packet) if packet.payload_type == PAYLOAD_SESSION_CREATED => {
                        if let Some(session) = self.sessions.get_mut(&from) {
                            session.touch();
                        }
                        self.handle_session_created(from, packet).await;
                    }
                    Ok(packet) => {
                        trace!(%from, payload_type = packet.payload_type, "unexpected pre-session packet");
                    }
                    Err(err) => debug!(%from, %err, "SSU decrypt failed"),
                }
                return;
            }
        }

        // otherwise: packets addressed to our intro key
        let intro_key = self.our_intro_key();
        if validate_packet(datagram, &intro_key) {
            match decrypt_packet(datagram, &intro_key) {
                Ok(packet) => self.dispatch_intro_packet(from, packet).await,
                Err(err) => debug!(%from, %err, "SSU intro decrypt failed"),
            }
            return;
        }
        trace!(%from, len = datagram.len(), "undecryptable SSU packet dropped");
    }

    /// Packets under an established session key.
    async fn dispatch_session_packet(&mut self, from: SocketAddr, packet: Packet) {
        match packet.payload_type {
            PAYLOAD_DATA => self.handle_data(from, &packet).await,
            PAYLOAD_SESSION_CONFIRMED => self.handle_session_confirmed(from, &packet).await,
            PAYLOAD_PEER_TEST => self.handle_peer_test(from, &packet, true).await,
            PAYLOAD_RELAY_REQUEST => self.handle_relay_request(from, &packet).await,
            PAYLOAD_RELAY_RESPONSE => self.handle_relay_response(from, &packet).await,
            PAYLOAD_RELAY_INTRO => self.handle_relay_intro(&packet).await,
            PAYLOAD_SESSION_DESTROYED => {
                debug!(%from, "SSU session destroyed by peer");
                self.remove_session(from, false).await;
            }
            PAYLOAD_SESSION_REQUEST => {
                // peer restarted; tear down and let them re-handshake
                self.remove_session(from, false).await;
            }
            other => warn!(%from, payload_type = other, "unexpected SSU payload type"),
        }
    }

    /// Packets under our intro key (no session yet).
    async fn dispatch_intro_packet(&mut self, from: SocketAddr, packet: Packet) {
        match packet.payload_type {
            PAYLOAD_SESSION_REQUEST => self.handle_session_request(from, &packet).await,
            PAYLOAD_PEER_TEST => self.handle_peer_test(from, &packet, false).await,
            PAYLOAD_RELAY_REQUEST => self.handle_relay_request(from, &packet).await,
            PAYLOAD_RELAY_RESPONSE => self.handle_relay_response(from, &packet).await,
            other => trace!(%from, payload_type = other, "pre-session SSU packet ignored"),
        }
    }

    async fn handle_session_request(&mut self, from: SocketAddr, packet: &Packet) {
        let mut session = SsuSession::new(from, None, SessionRole::Server);
        let dh = self.supplier.acquire().await;
        let relay_tag = if self.ctx.router_info().is_introducer() {
            let tag: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
            self.relays.insert(tag, from);
            tag
        } else {
            0
        };
        let our_addr = self.our_advertised_addr();
        match session.handle_session_request(&self.ctx, packet, dh, our_addr, relay_tag) {
            Ok(created) => {
                self.send_packet(from, &created).await;
                self.sessions.insert(from, session);
            }
            Err(err) => debug!(%from, %err, "session request rejected"),
        }
    }

    async fn handle_session_created(&mut self, from: SocketAddr, packet: Packet) {
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };
        match session.handle_session_created(&self.ctx, &packet) {
            Ok((confirmed, _observed_ip)) => {
                let remote = session.remote_ident.expect("client session has ident");
                self.send_packet(from, &confirmed).await;
                self.finish_establishment(from, remote).await;
            }
            Err(err) => {
                debug!(%from, %err, "session created rejected");
                self.remove_session(from, true).await;
            }
        }
    }

    async fn handle_session_confirmed(&mut self, from: SocketAddr, packet: &Packet) {
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };
        if session.is_established() {
            return;
        }
        match session.handle_session_confirmed(packet) {
            Ok(remote) => {
                self.finish_establishment(from, remote).await;
            }
            Err(err) => {
                debug!(%from, %err, "session confirmed rejected");
                self.remove_session(from, true).await;
            }
        }
    }

    /// Shared post-handshake wiring: ident map, outbound queue, events, and
    /// the optional reachability test.
    async fn finish_establishment(&mut self, endpoint: SocketAddr, remote: IdentHash) {
        let Some(role) = self.sessions.get(&endpoint).map(|s| s.role) else {
            return;
        };
        self.by_ident.insert(remote, endpoint);
        let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_DEPTH);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if cmd_tx.send(SsuCmd::SendTo { remote, msg }).await.is_err() {
                    break;
                }
            }
        });
        let handle = SessionHandle::new(remote, SessionKind::Ssu, tx);
        let _ = self
            .events
            .send(TransportEvent::Established { handle, role })
            .await;

        let session = self.sessions.get_mut(&endpoint).expect("session exists");
        let wants_test = session.want_peer_test
            && session
                .remote_router
                .as_ref()
                .map(|r| r.is_peer_testing())
                .unwrap_or(false);
        // the responder handed us a relay tag: publish it as an introducer
        // so firewalled peers stay reachable through this router
        let introducer = (session.relay_tag_in != 0)
            .then(|| {
                session
                    .remote_router
                    .as_ref()
                    .and_then(|r| r.ssu_address())
                    .and_then(|a| a.intro_key())
                    .map(|key| Introducer {
                        host: endpoint.ip(),
                        port: endpoint.port(),
                        tag: session.relay_tag_in,
                        key,
                    })
            })
            .flatten();
        if let Some(introducer) = introducer {
            self.publish_introducer(introducer);
        }
        if wants_test {
            self.start_peer_test(endpoint).await;
        }
    }

    /// Advertise an introducer on our SSU address. A firewalled router drops
    /// its direct host so peers use the relay instead.
    fn publish_introducer(&self, introducer: Introducer) {
        let firewalled = self.ctx.status() == RouterStatus::Firewalled;
        let result = self.ctx.update_router_info(|ri| {
            for addr in ri.addresses_mut() {
                if addr.style != TransportStyle::Ssu {
                    continue;
                }
                if firewalled {
                    addr.options.remove("host");
                    addr.options.remove("port");
                }
                addr.add_introducer(0, &introducer);
            }
        });
        match result {
            Ok(()) => debug!(tag = introducer.tag, "introducer published"),
            Err(err) => warn!(%err, "could not publish introducer"),
        }
    }

    async fn handle_data(&mut self, from: SocketAddr, packet: &Packet) {
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };
        if !session.is_established() {
            return;
        }
        let keys = session.keys.clone().expect("established has keys");
        let remote = session.remote_ident.expect("established has ident");
        let (acks, completed) = session.data.process(&packet.payload, &keys);
        for ack in acks {
            self.send_packet(from, &ack).await;
        }
        for msg in completed {
            if let Err(err) = msg.check_expiration() {
                debug!(%err, "expired SSU message dropped");
                continue;
            }
            trace!(peer = %remote.abbrev(), msg_type = ?msg.msg_type, "SSU message received");
            let _ = self
                .events
                .send(TransportEvent::Inbound(IncomingMessage {
                    from: remote,
                    message: msg,
                }))
                .await;
        }
    }

    async fn handle_relay_request(&mut self, from: SocketAddr, packet: &Packet) {
        let payload = &packet.payload;
        if payload.len() < 4 {
            return;
        }
        let tag = u32::from_be_bytes(payload[..4].try_into().expect("fixed split"));
        let Some(&target_endpoint) = self.relays.get(&tag) else {
            debug!(tag, "relay request for unknown tag");
            return;
        };
        // skip alice's (empty) address block and challenge, then her intro
        // key and nonce
        let mut offset = 4;
        let Some((_, consumed)) = read_sized_ip(&payload[offset..]) else {
            return;
        };
        offset += consumed + 2;
        let Some(&challenge_len) = payload.get(offset) else {
            return;
        };
        offset += 1 + challenge_len as usize;
        let Some(key_bytes) = payload.get(offset..offset + 32) else {
            return;
        };
        let alice_intro_key: [u8; 32] = key_bytes.try_into().expect("fixed split");
        offset += 32;
        let Some(nonce_bytes) = payload.get(offset..offset + 4) else {
            return;
        };
        let nonce = u32::from_be_bytes(nonce_bytes.try_into().expect("fixed split"));

        // response to alice: target's endpoint, then her observed address
        let mut response = Vec::with_capacity(32);
        write_sized_ip(&mut response, &target_endpoint.ip());
        response.extend_from_slice(&target_endpoint.port().to_be_bytes());
        write_sized_ip(&mut response, &from.ip());
        response.extend_from_slice(&from.port().to_be_bytes());
        response.extend_from_slice(&nonce.to_be_bytes());
        let response_packet = match self.sessions.get(&from) {
            Some(s) if s.is_established() => {
                let keys = s.keys.as_ref().expect("established has keys");
                build_packet(
                    PAYLOAD_RELAY_RESPONSE,
                    &response,
                    &keys.session_key,
                    &keys.mac_key,
                )
            }
            _ => build_packet(
                PAYLOAD_RELAY_RESPONSE,
                &response,
                &alice_intro_key,
                &alice_intro_key,
            ),
        };
        self.send_packet(from, &response_packet).await;

        // intro to the firewalled target so it punches a hole toward alice
        if let Some(target) = self.sessions.get(&target_endpoint) {
            if let Some(keys) = target.keys.as_ref() {
                let mut intro = Vec::with_capacity(10);
                write_sized_ip(&mut intro, &from.ip());
                intro.extend_from_slice(&from.port().to_be_bytes());
                intro.push(0); // no challenge
                let intro_packet =
                    build_packet(PAYLOAD_RELAY_INTRO, &intro, &keys.session_key, &keys.mac_key);
                self.send_packet(target_endpoint, &intro_packet).await;
                debug!(%from, target = %target_endpoint, "relayed introduction");
            }
        }
    }

    async fn handle_relay_response(&mut self, from: SocketAddr, packet: &Packet) {
        let payload = &packet.payload;
        let Some((Some(target_ip), consumed)) = read_sized_ip(payload) else {
            return;
        };
        let mut offset = consumed;
        let Some(port_bytes) = payload.get(offset..offset + 2) else {
            return;
        };
        let target_port = u16::from_be_bytes(port_bytes.try_into().expect("fixed split"));
        offset += 2;
        // our observed address follows; then the nonce
        let Some((_, consumed2)) = read_sized_ip(&payload[offset..]) else {
            return;
        };
        offset += consumed2 + 2;
        let Some(nonce_bytes) = payload.get(offset..offset + 4) else {
            return;
        };
        let nonce = u32::from_be_bytes(nonce_bytes.try_into().expect("fixed split"));

        let Some(target_router) = self.pending_intros.remove(&nonce) else {
            debug!(%from, nonce, "relay response with unknown nonce");
            return;
        };
        let target_endpoint = SocketAddr::new(target_ip, target_port);
        let mut session = SsuSession::new(target_endpoint, Some(target_router), SessionRole::Client);
        session.state = SsuState::Introduced;
        self.sessions.insert(target_endpoint, session);
        debug!(%target_endpoint, "awaiting hole punch from introduced peer");
    }

    async fn handle_relay_intro(&mut self, packet: &Packet) {
        let payload = &packet.payload;
        let Some((Some(alice_ip), consumed)) = read_sized_ip(payload) else {
            warn!("relay intro with unsupported address");
            return;
        };
        let Some(port_bytes) = payload.get(consumed..consumed + 2) else {
            return;
        };
        let alice_port = u16::from_be_bytes(port_bytes.try_into().expect("fixed split"));
        let alice = SocketAddr::new(alice_ip, alice_port);
        // zero-length hole punch; the result only matters to the OS
        if let Err(err) = self.socket.send_to(&[], alice).await {
            debug!(%alice, %err, "hole punch send failed");
        } else {
            debug!(%alice, "hole punch sent");
        }
    }

    async fn start_peer_test(&mut self, bob_endpoint: SocketAddr) {
        let Some(session) = self.sessions.get_mut(&bob_endpoint) else {
            return;
        };
        session.want_peer_test = false;
        let Some(keys) = session.keys.clone() else {
            return;
        };
        let nonce: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        self.peer_tests.insert(
            nonce,
            PeerTest {
                role: PeerTestRole::Alice,
                deadline: Instant::now() + PEER_TEST_TIMEOUT,
                alice: None,
            },
        );
        self.ctx.set_status(RouterStatus::Testing);
        let payload = peer_test_payload(nonce, None, 0, &self.our_intro_key());
        let packet = build_packet(
            PAYLOAD_PEER_TEST,
            &payload,
            &keys.session_key,
            &keys.mac_key,
        );
        self.send_packet(bob_endpoint, &packet).await;
        debug!(nonce, via = %bob_endpoint, "peer test started");
    }

    async fn handle_peer_test(&mut self, from: SocketAddr, packet: &Packet, via_session: bool) {
        let payload = &packet.payload;
        if payload.len() < 4 {
            return;
        }
        let nonce = u32::from_be_bytes(payload[..4].try_into().expect("fixed split"));
        let Some((addr, consumed)) = read_sized_ip(&payload[4..]) else {
            return;
        };
        let mut offset = 4 + consumed;
        let Some(port_bytes) = payload.get(offset..offset + 2) else {
            return;
        };
        let port = u16::from_be_bytes(port_bytes.try_into().expect("fixed split"));
        offset += 2;
        let Some(key_bytes) = payload.get(offset..offset + 32) else {
            return;
        };
        let intro_key: [u8; 32] = key_bytes.try_into().expect("fixed split");

        match self.peer_tests.get(&nonce).map(|t| t.role) {
            Some(PeerTestRole::Alice) => {
                if via_session {
                    // charlie's echo, relayed through bob: the test is
                    // running but proves nothing about direct reachability
                    trace!(nonce, "peer test echo via bob");
                } else {
                    // charlie reached us directly: we are not firewalled
                    debug!(nonce, %from, "peer test reply received directly");
                    self.peer_tests.remove(&nonce);
                    self.ctx.set_status(RouterStatus::Ok);
                }
            }
            Some(PeerTestRole::Bob) => {
                // charlie's confirmation; forward back to alice's session
                let alice = self.peer_tests.get(&nonce).and_then(|t| t.alice);
                if let Some((alice_endpoint, _)) = alice {
                    if let Some(session) = self.sessions.get(&alice_endpoint) {
                        if let Some(keys) = session.keys.as_ref() {
                            let forward = build_packet(
                                PAYLOAD_PEER_TEST,
                                payload,
                                &keys.session_key,
                                &keys.mac_key,
                            );
                            self.send_packet(alice_endpoint, &forward).await;
                        }
                    }
                }
            }
            Some(PeerTestRole::Charlie) => {
                trace!(nonce, "duplicate peer test as charlie");
            }
            None => {
                if via_session && addr.is_some() {
                    // we are charlie: confirm to bob, probe alice directly
                    self.peer_tests.insert(
                        nonce,
                        PeerTest {
                            role: PeerTestRole::Charlie,
                            deadline: Instant::now() + PEER_TEST_TIMEOUT,
                            alice: None,
                        },
                    );
                    if let Some(session) = self.sessions.get(&from) {
                        if let Some(keys) = session.keys.as_ref() {
                            let echo = build_packet(
                                PAYLOAD_PEER_TEST,
                                payload,
                                &keys.session_key,
                                &keys.mac_key,
                            );
                            self.send_packet(from, &echo).await;
                        }
                    }
                    let alice = SocketAddr::new(addr.expect("checked"), port);
                    let probe_payload =
                        peer_test_payload(nonce, Some(alice.ip()), alice.port(), &self.our_intro_key());
                    let probe = build_packet(PAYLOAD_PEER_TEST, &probe_payload, &intro_key, &intro_key);
                    self.send_packet(alice, &probe).await;
                    debug!(nonce, %alice, "peer test probing alice as charlie");
                } else if via_session {
                    // we are bob: enlist a random other established session
                    // as charlie
                    let charlie = self
                        .sessions
                        .iter()
                        .filter(|(endpoint, s)| **endpoint != from && s.is_established())
                        .map(|(endpoint, _)| *endpoint)
                        .next();
                    let Some(charlie_endpoint) = charlie else {
                        debug!(nonce, "no charlie available for peer test");
                        return;
                    };
                    self.peer_tests.insert(
                        nonce,
                        PeerTest {
                            role: PeerTestRole::Bob,
                            deadline: Instant::now() + PEER_TEST_TIMEOUT,
                            alice: Some((from, intro_key)),
                        },
                    );
                    let session = self.sessions.get(&charlie_endpoint).expect("just found");
                    let keys = session.keys.as_ref().expect("established has keys");
                    let forward_payload =
                        peer_test_payload(nonce, Some(from.ip()), from.port(), &intro_key);
                    let forward = build_packet(
                        PAYLOAD_PEER_TEST,
                        &forward_payload,
                        &keys.session_key,
                        &keys.mac_key,
                    );
                    self.send_packet(charlie_endpoint, &forward).await;
                    debug!(nonce, charlie = %charlie_endpoint, "peer test forwarded as bob");
                } else {
                    // direct probe for a test we never started
                    trace!(nonce, %from, "stray peer test ignored");
                }
            }
        }
    }

    async fn remove_session(&mut self, endpoint: SocketAddr, notify_peer: bool) {
        let Some(session) = self.sessions.remove(&endpoint) else {
            return;
        };
        if notify_peer && session.is_established() {
            if let Some(keys) = session.keys.as_ref() {
                let destroyed =
                    build_packet(PAYLOAD_SESSION_DESTROYED, &[], &keys.session_key, &keys.mac_key);
                self.send_packet(endpoint, &destroyed).await;
            }
        }
        if let Some(remote) = session.remote_ident {
            if self.by_ident.get(&remote) == Some(&endpoint) {
                self.by_ident.remove(&remote);
            }
            if session.is_established() {
                let _ = self
                    .events
                    .send(TransportEvent::Closed {
                        remote,
                        kind: SessionKind::Ssu,
                    })
                    .await;
            } else {
                let _ = self
                    .events
                    .send(TransportEvent::ConnectFailed {
                        remote,
                        kind: SessionKind::Ssu,
                    })
                    .await;
            }
        }
        self.relays.retain(|_, ep| *ep != endpoint);
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        let mut to_remove: Vec<(SocketAddr, bool)> = Vec::new();
        let mut resends: Vec<(SocketAddr, Vec<Vec<u8>>)> = Vec::new();
        let mut keepalives: Vec<SocketAddr> = Vec::new();

        for (endpoint, session) in self.sessions.iter_mut() {
            if session.is_established() {
                let due = session.data.resend_due(now);
                if !due.is_empty() {
                    resends.push((*endpoint, due));
                }
                session.data.sweep(now);
                if now.duration_since(session.last_activity) > TERMINATION_TIMEOUT {
                    debug!(%endpoint, "SSU session timed out");
                    to_remove.push((*endpoint, true));
                } else if now.duration_since(session.last_send) > KEEPALIVE_INTERVAL {
                    keepalives.push(*endpoint);
                }
            } else if now.duration_since(session.created_at) > CONNECT_TIMEOUT {
                debug!(%endpoint, state = ?session.state, "SSU establishment timed out");
                to_remove.push((*endpoint, false));
            }
        }

        for (endpoint, packets) in resends {
            for packet in packets {
                self.send_packet(endpoint, &packet).await;
            }
            if let Some(session) = self.sessions.get_mut(&endpoint) {
                session.last_send = Instant::now();
            }
        }
        for endpoint in keepalives {
            if let Some(session) = self.sessions.get_mut(&endpoint) {
                let keys = session.keys.clone().expect("established has keys");
                session.last_send = Instant::now();
                // empty data packet: no acks, no fragments
                let keepalive =
                    build_packet(PAYLOAD_DATA, &[0, 0], &keys.session_key, &keys.mac_key);
                self.send_packet(endpoint, &keepalive).await;
            }
        }
        for (endpoint, notify) in to_remove {
            self.remove_session(endpoint, notify).await;
        }

        // expired peer tests: as alice, silence means firewalled
        let expired: Vec<u32> = self
            .peer_tests
            .iter()
            .filter(|(_, t)| now >= t.deadline)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in expired {
            let test = self.peer_tests.remove(&nonce).expect("just listed");
            if test.role == PeerTestRole::Alice {
                debug!(nonce, "peer test timed out, assuming firewalled");
                self.ctx.set_status(RouterStatus::Firewalled);
            }
        }
    }
}

fn relay_request_payload(tag: u32, our_intro_key: &[u8; 32], nonce: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(44);
    payload.extend_from_slice(&tag.to_be_bytes());
    payload.push(0); // no address
    payload.extend_from_slice(&0u16.to_be_bytes()); // port 0
    payload.push(0); // no challenge
    payload.extend_from_slice(our_intro_key);
    payload.extend_from_slice(&nonce.to_be_bytes());
    payload
}

fn peer_test_payload(
    nonce: u32,
    ip: Option<std::net::IpAddr>,
    port: u16,
    intro_key: &[u8; 32],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(55);
    payload.extend_from_slice(&nonce.to_be_bytes());
    match ip {
        Some(ip) => write_sized_ip(&mut payload, &ip),
        None => payload.push(0),
    }
    payload.extend_from_slice(&port.to_be_bytes());
    payload.extend_from_slice(intro_key);
    payload
}
