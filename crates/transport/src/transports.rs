//! The transports facade: an ident-keyed peer table owned by one task,
//! best-effort `send_message` with per-peer delayed queues while a session
//! establishes, and NTCP-before-SSU dialing.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veilnet_core::{IdentHash, Message, RouterContext, RouterInfo};

use crate::ntcp::NtcpServer;
use crate::ssu::SsuServer;
use crate::supplier::DhSupplier;
use crate::{IncomingMessage, Result, SessionHandle, SessionKind, SessionRole};

/// Outbound messages parked per peer while a session comes up.
const MAX_DELAYED_MESSAGES: usize = 200;

/// Internal notifications from transport sessions to the peer table.
pub(crate) enum TransportEvent {
    Established {
        handle: SessionHandle,
        role: SessionRole,
    },
    Closed {
        remote: IdentHash,
        kind: SessionKind,
    },
    ConnectFailed {
        remote: IdentHash,
        kind: SessionKind,
    },
    Inbound(IncomingMessage),
}

#[derive(Clone, Debug)]
pub struct TransportsConfig {
    pub ntcp_bind: Option<SocketAddr>,
    pub ssu_bind: Option<SocketAddr>,
    /// Probe reachability after SSU sessions establish.
    pub peer_test: bool,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            ntcp_bind: Some("0.0.0.0:0".parse().expect("valid addr")),
            ssu_bind: Some("0.0.0.0:0".parse().expect("valid addr")),
            peer_test: true,
        }
    }
}

enum Cmd {
    Send { to: IdentHash, msg: Message },
    Close { ident: IdentHash },
    AddRouterInfo(Box<RouterInfo>),
}

/// Cloneable upper-edge API handle.
#[derive(Clone)]
pub struct TransportsHandle {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl TransportsHandle {
    /// Best-effort delivery to a router by identity; queues while a session
    /// establishes.
    pub fn send_message(&self, to: IdentHash, msg: Message) {
        if self.cmd_tx.try_send(Cmd::Send { to, msg }).is_err() {
            warn!(peer = %to.abbrev(), "transports queue full, message dropped");
        }
    }

    pub fn close_session(&self, ident: IdentHash) {
        let _ = self.cmd_tx.try_send(Cmd::Close { ident });
    }

    /// Seed or refresh a peer's descriptor (fed by the netdb collaborator).
    pub fn add_router_info(&self, ri: RouterInfo) {
        let _ = self.cmd_tx.try_send(Cmd::AddRouterInfo(Box::new(ri)));
    }
}

/// Addresses the transports actually bound, for descriptor publication.
#[derive(Clone, Copy, Debug)]
pub struct BoundAddrs {
    pub ntcp: Option<SocketAddr>,
    pub ssu: Option<SocketAddr>,
}

pub struct Transports;

impl Transports {
    /// Start both transports and the peer-table task. Returns the API
    /// handle, the stream of delivered messages, and the bound addresses.
    pub async fn start(
        ctx: Arc<RouterContext>,
        config: TransportsConfig,
    ) -> Result<(TransportsHandle, mpsc::Receiver<IncomingMessage>, BoundAddrs)> {
        let supplier = Arc::new(DhSupplier::start());
        let (events_tx, events_rx) = mpsc::channel(512);
        let (incoming_tx, incoming_rx) = mpsc::channel(512);
        let (cmd_tx, cmd_rx) = mpsc::channel(512);

        let ntcp = NtcpServer::new(ctx.clone(), supplier.clone(), events_tx.clone());
        let mut bound = BoundAddrs {
            ntcp: None,
            ssu: None,
        };
        if let Some(bind) = config.ntcp_bind {
            bound.ntcp = Some(ntcp.start(bind).await?);
        }
        let ssu = match config.ssu_bind {
            Some(bind) => {
                let (server, addr) = SsuServer::start(
                    ctx.clone(),
                    supplier.clone(),
                    bind,
                    config.peer_test,
                    events_tx.clone(),
                )
                .await?;
                bound.ssu = Some(addr);
                Some(server)
            }
            None => None,
        };

        let table = PeerTable {
            ntcp,
            ssu,
            peers: HashMap::new(),
            incoming_tx,
        };
        tokio::spawn(table.run(cmd_rx, events_rx));
        info!("transports started");
        Ok((TransportsHandle { cmd_tx }, incoming_rx, bound))
    }
}

#[derive(Default)]
struct Peer {
    router_info: Option<RouterInfo>,
    sessions: Vec<SessionHandle>,
    delayed: VecDeque<Message>,
    connecting: bool,
    tried_ntcp: bool,
    tried_ssu: bool,
}

impl Peer {
    fn live_session(&mut self) -> Option<&SessionHandle> {
        self.sessions.retain(|s| !s.is_closed());
        self.sessions.first()
    }
}

struct PeerTable {
    ntcp: NtcpServer,
    ssu: Option<SsuServer>,
    peers: HashMap<IdentHash, Peer>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
}

impl PeerTable {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Cmd>,
        mut events_rx: mpsc::Receiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Cmd::Send { to, msg }) => self.send(to, msg),
                        Some(Cmd::Close { ident }) => self.close(ident),
                        Some(Cmd::AddRouterInfo(ri)) => {
                            let ident = ri.ident_hash();
                            self.peers.entry(ident).or_default().router_info = Some(*ri);
                        }
                        None => break,
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    fn send(&mut self, to: IdentHash, msg: Message) {
        let peer = self.peers.entry(to).or_default();
        if let Some(session) = peer.live_session() {
            if session.send(msg.clone()).is_ok() {
                return;
            }
            peer.sessions.clear();
        }

        if peer.delayed.len() >= MAX_DELAYED_MESSAGES {
            // overflow evicts the whole peer entry, queue included
            warn!(peer = %to.abbrev(), "delayed queue overflow, dropping peer");
            self.peers.remove(&to);
            return;
        }
        peer.delayed.push_back(msg);

        if !peer.connecting {
            match peer.router_info.clone() {
                Some(ri) => {
                    peer.connecting = true;
                    Self::dial(&self.ntcp, self.ssu.as_ref(), peer, ri);
                }
                None => {
                    debug!(peer = %to.abbrev(), "no descriptor for peer, message parked");
                }
            }
        }
    }

    /// NTCP first when published, SSU (direct or introduced) otherwise.
    fn dial(ntcp: &NtcpServer, ssu: Option<&SsuServer>, peer: &mut Peer, ri: RouterInfo) {
        if !peer.tried_ntcp && ri.ntcp_address().is_some() {
            peer.tried_ntcp = true;
            ntcp.connect(ri);
            return;
        }
        if !peer.tried_ssu {
            if let Some(ssu) = ssu {
                peer.tried_ssu = true;
                ssu.connect(ri, false);
                return;
            }
        }
        peer.connecting = false;
    }

    fn close(&mut self, ident: IdentHash) {
        if let Some(peer) = self.peers.get_mut(&ident) {
            peer.sessions.clear();
            peer.delayed.clear();
            peer.connecting = false;
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Established { handle, role } => {
                let remote = handle.remote;
                debug!(peer = %remote.abbrev(), kind = ?handle.kind, ?role, "session established");
                let peer = self.peers.entry(remote).or_default();
                peer.connecting = false;
                peer.tried_ntcp = false;
                peer.tried_ssu = false;
                // flush the delayed queue FIFO through the new session
                while let Some(msg) = peer.delayed.pop_front() {
                    if handle.send(msg).is_err() {
                        warn!(peer = %remote.abbrev(), "session died during flush");
                        break;
                    }
                }
                peer.sessions.push(handle);
            }
            TransportEvent::Closed { remote, kind } => {
                if let Some(peer) = self.peers.get_mut(&remote) {
                    peer.sessions.retain(|s| s.kind != kind || !s.is_closed());
                }
            }
            TransportEvent::ConnectFailed { remote, kind } => {
                debug!(peer = %remote.abbrev(), ?kind, "connect failed");
                let Some(peer) = self.peers.get_mut(&remote) else {
                    return;
                };
                peer.connecting = false;
                // fall back to the other transport if one is left untried
                if let Some(ri) = peer.router_info.clone() {
                    if !peer.delayed.is_empty() && (!peer.tried_ntcp || !peer.tried_ssu) {
                        peer.connecting = true;
                        Self::dial(&self.ntcp, self.ssu.as_ref(), peer, ri);
                        if peer.connecting {
                            return;
                        }
                    }
                }
                let dropped = peer.delayed.len();
                if dropped > 0 {
                    warn!(peer = %remote.abbrev(), dropped, "dropping queued messages");
                    peer.delayed.clear();
                }
                peer.tried_ntcp = false;
                peer.tried_ssu = false;
            }
            TransportEvent::Inbound(incoming) => {
                if self.incoming_tx.send(incoming).await.is_err() {
                    warn!("message consumer gone");
                }
            }
        }
    }
}
