//! The tunnel layer: building onion-encrypted paths, forwarding traffic
//! through them, participating in other routers' tunnels, and keeping pools
//! of spare tunnels alive.

mod build;
mod endpoint;
mod gateway;
mod hop;
mod pool;
mod transit;
mod tunnel;

pub use build::{BuildRequest, BUILD_RET_ACCEPT, BUILD_RET_REJECT};
pub use endpoint::TunnelEndpoint;
pub use gateway::{Delivery, TunnelGatewayBuffer, TunnelMessageBlock};
pub use hop::{HopId, TunnelConfig, TunnelHop};
pub use pool::{PoolConfig, TunnelPool};
pub use transit::{TransitAction, TransitTunnel, MAX_TRANSIT_TUNNELS};
pub use tunnel::{Tunnel, TunnelState, BUILD_TIMEOUT};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use veilnet_core::{
    create_tunnel_gateway_msg_raw, parse_tunnel_gateway, IdentHash, Message, MessageType,
    RouterContext, RouterInfo,
};
use veilnet_transport::{IncomingMessage, TransportsHandle};

/// Room for fragments inside one tunnel data block.
pub const TUNNEL_DATA_MAX_PAYLOAD: usize = 1003;
/// Lifetime of an established tunnel.
pub const TUNNEL_LIFETIME: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Core error: {0}")]
    Core(#[from] veilnet_core::CoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veilnet_crypto::CryptoError),

    #[error("Malformed build message")]
    MalformedBuild,

    #[error("Malformed tunnel data: {0}")]
    MalformedTunnelData(&'static str),

    #[error("Tunnel has no hops")]
    EmptyTunnel,

    #[error("Message not valid for this tunnel role")]
    WrongRole,

    #[error("No tunnel available")]
    NoTunnel,
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Counters surfaced to the console collaborator.
#[derive(Clone, Copy, Debug, Default)]
pub struct TunnelStats {
    pub inbound: usize,
    pub outbound: usize,
    pub transit: usize,
    pub transit_bytes: u64,
}

enum Cmd {
    Incoming(IncomingMessage),
    AddRouterInfo(Box<RouterInfo>),
    BuildOutbound {
        peers: Vec<RouterInfo>,
        reply_gateway: IdentHash,
        reply_tunnel_id: u32,
        respond: oneshot::Sender<Option<u32>>,
    },
    BuildInbound {
        peers: Vec<RouterInfo>,
        respond: oneshot::Sender<Option<u32>>,
    },
    TunnelState {
        local_id: u32,
        inbound: bool,
        respond: oneshot::Sender<Option<TunnelState>>,
    },
    SendThrough {
        local_id: u32,
        delivery: Delivery,
        msg: Message,
        respond: oneshot::Sender<bool>,
    },
    InboundGateway {
        respond: oneshot::Sender<Option<(IdentHash, u32)>>,
    },
    GatewayOf {
        local_id: u32,
        respond: oneshot::Sender<Option<(IdentHash, u32)>>,
    },
    Stats {
        respond: oneshot::Sender<TunnelStats>,
    },
}

/// Cloneable handle to the tunnel reactor.
#[derive(Clone)]
pub struct TunnelsHandle {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl TunnelsHandle {
    /// Feed a routed message from the transports.
    pub fn handle_message(&self, incoming: IncomingMessage) {
        if self.cmd_tx.try_send(Cmd::Incoming(incoming)).is_err() {
            warn!("tunnel reactor backlogged, message dropped");
        }
    }

    pub fn add_router_info(&self, ri: RouterInfo) {
        let _ = self.cmd_tx.try_send(Cmd::AddRouterInfo(Box::new(ri)));
    }

    /// Build an outbound tunnel through `peers`, replies routed to the given
    /// inbound tunnel gateway. Returns the tunnel's local id.
    pub async fn build_outbound(
        &self,
        peers: Vec<RouterInfo>,
        reply_gateway: IdentHash,
        reply_tunnel_id: u32,
    ) -> Option<u32> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::BuildOutbound {
                peers,
                reply_gateway,
                reply_tunnel_id,
                respond,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Build an inbound tunnel through `peers` (first peer is the gateway).
    pub async fn build_inbound(&self, peers: Vec<RouterInfo>) -> Option<u32> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::BuildInbound { peers, respond })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn tunnel_state(&self, local_id: u32, inbound: bool) -> Option<TunnelState> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::TunnelState {
                local_id,
                inbound,
                respond,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Send a message through an established outbound tunnel.
    pub async fn send_through(
        &self,
        local_id: u32,
        delivery: Delivery,
        msg: Message,
    ) -> bool {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::SendThrough {
                local_id,
                delivery,
                msg,
                respond,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Gateway entry (router, tunnel id) of any established inbound tunnel,
    /// for handing to peers as a reply path.
    pub async fn inbound_gateway(&self) -> Option<(IdentHash, u32)> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::InboundGateway { respond })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Gateway entry of a specific inbound tunnel.
    pub async fn gateway_of(&self, local_id: u32) -> Option<(IdentHash, u32)> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::GatewayOf { local_id, respond })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn stats(&self) -> TunnelStats {
        let (respond, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Stats { respond }).await.is_err() {
            return TunnelStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct Tunnels;

impl Tunnels {
    /// Start the tunnel reactor. Messages that are not tunnel traffic, plus
    /// everything delivered out of our inbound tunnels, go to `delivered_tx`
    /// (the upper-edge receive callback).
    pub fn start(
        ctx: Arc<RouterContext>,
        transports: TransportsHandle,
        mut incoming: mpsc::Receiver<IncomingMessage>,
        delivered_tx: mpsc::Sender<IncomingMessage>,
    ) -> TunnelsHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(512);
        let handle = TunnelsHandle {
            cmd_tx: cmd_tx.clone(),
        };

        // pump transport deliveries into the reactor
        let pump_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                if pump_tx.send(Cmd::Incoming(msg)).await.is_err() {
                    break;
                }
            }
        });

        let manager = Manager {
            ctx,
            transports,
            delivered_tx,
            routers: HashMap::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            pending: HashMap::new(),
            transit: HashMap::new(),
            exploratory: TunnelPool::new(PoolConfig::exploratory()),
        };
        tokio::spawn(manager.run(cmd_rx));
        handle
    }
}

/// Index entry correlating a build reply to its pending tunnel.
struct PendingBuild {
    local_id: u32,
    inbound: bool,
}

struct Manager {
    ctx: Arc<RouterContext>,
    transports: TransportsHandle,
    delivered_tx: mpsc::Sender<IncomingMessage>,
    routers: HashMap<IdentHash, RouterInfo>,
    inbound: HashMap<u32, Tunnel>,
    outbound: HashMap<u32, Tunnel>,
    pending: HashMap<u32, PendingBuild>,
    transit: HashMap<u32, TransitTunnel>,
    exploratory: TunnelPool,
}

impl Manager {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Cmd::Incoming(incoming)) => self.handle_incoming(incoming).await,
                        Some(Cmd::AddRouterInfo(ri)) => {
                            self.transports.add_router_info((*ri).clone());
                            self.routers.insert(ri.ident_hash(), *ri);
                        }
                        Some(Cmd::BuildOutbound { peers, reply_gateway, reply_tunnel_id, respond }) => {
                            let id = self.build_outbound(peers, reply_gateway, reply_tunnel_id);
                            let _ = respond.send(id);
                        }
                        Some(Cmd::BuildInbound { peers, respond }) => {
                            let id = self.build_inbound(peers);
                            let _ = respond.send(id);
                        }

                        Some(Cmd::TunnelState { local_id, inbound, respond }) => {
                            let map = if inbound { &self.inbound } else { &self.outbound };
                            let _ = respond.send(map.get(&local_id).map(|t| t.state));
                        }
                        Some(Cmd::SendThrough { local_id, delivery, msg, respond }) => {
                            let _ = respond.send(self.send_through(local_id, delivery, msg));
                        }
                        Some(Cmd::InboundGateway { respond }) => {
                            let entry = self
                                .inbound
                                .values()
                                .find(|t| t.is_usable())
                                .map(|t| t.gateway_entry());
                            let _ = respond.send(entry);
                        }
                        Some(Cmd::GatewayOf { local_id, respond }) => {
                            let entry = self
                                .inbound
                                .get(&local_id)
                                .filter(|t| t.is_usable())
                                .map(|t| t.gateway_entry());
                            let _ = respond.send(entry);
                        }
                        Some(Cmd::Stats { respond }) => {
                            let _ = respond.send(self.stats());
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.tick();
                }
            }
        }
    }

    fn stats(&self) -> TunnelStats {
        TunnelStats {
            inbound: self.inbound.values().filter(|t| t.is_usable()).count(),
            outbound: self.outbound.values().filter(|t| t.is_usable()).count(),
            transit: self.transit.len(),
            transit_bytes: self.transit.values().map(|t| t.transferred_bytes).sum(),
        }
    }

    fn build_outbound(
        &mut self,
        peers: Vec<RouterInfo>,
        reply_gateway: IdentHash,
        reply_tunnel_id: u32,
    ) -> Option<u32> {
        if peers.is_empty() {
            warn!("refusing to build a tunnel with no hops");
            return None;
        }
        for peer in &peers {
            self.routers.insert(peer.ident_hash(), peer.clone());
            self.transports.add_router_info(peer.clone());
        }
        // re-roll on the (unlikely) local id collision
        let config = loop {
            let config = TunnelConfig::outbound(peers.clone(), reply_gateway, reply_tunnel_id);
            if !self.outbound.contains_key(&config.first_hop().tunnel_id) {
                break config;
            }
        };
        let reply_msg_id: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let tunnel = Tunnel::outbound(config, reply_msg_id);
        let local_id = tunnel.local_id();
        self.dispatch_build(&tunnel);
        self.pending.insert(
            reply_msg_id,
            PendingBuild {
                local_id,
                inbound: false,
            },
        );
        self.outbound.insert(local_id, tunnel);
        Some(local_id)
    }

    fn build_inbound(&mut self, peers: Vec<RouterInfo>) -> Option<u32> {
        if peers.is_empty() {
            warn!("refusing to build a tunnel with no hops");
            return None;
        }
        for peer in &peers {
            self.routers.insert(peer.ident_hash(), peer.clone());
            self.transports.add_router_info(peer.clone());
        }
        // re-roll on the (unlikely) local id collision
        let config = loop {
            let config = TunnelConfig::inbound(peers.clone(), self.ctx.ident_hash());
            if !self.inbound.contains_key(&config.last_hop().next_tunnel_id) {
                break config;
            }
        };
        let reply_msg_id: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let tunnel = Tunnel::inbound(config, reply_msg_id);
        let local_id = tunnel.local_id();
        self.dispatch_build(&tunnel);
        self.pending.insert(
            reply_msg_id,
            PendingBuild {
                local_id,
                inbound: true,
            },
        );
        self.inbound.insert(local_id, tunnel);
        Some(local_id)
    }

    /// Emit the build message toward the first hop, through an established
    /// outbound tunnel when one exists.
    fn dispatch_build(&mut self, tunnel: &Tunnel) {
        let payload = match build::build_request_payload(&tunnel.config, tunnel.reply_msg_id) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "could not assemble build request");
                return;
            }
        };
        let first_hop = tunnel.config.first_hop().router.ident_hash();
        let msg = Message::new(MessageType::VariableTunnelBuild, payload);

        let via = self
            .outbound
            .values()
            .find(|t| t.is_usable())
            .map(|t| t.local_id());
        match via {
            Some(out_id) if first_hop != self.ctx.ident_hash() => {
                debug!(tunnel = tunnel.local_id(), via = out_id, "build dispatched through tunnel");
                self.send_through(
                    out_id,
                    Delivery::Router { hash: first_hop },
                    msg,
                );
            }
            _ => {
                debug!(tunnel = tunnel.local_id(), peer = %first_hop.abbrev(), "build dispatched directly");
                self.transports.send_message(first_hop, msg);
            }
        }
    }

    fn send_through(&mut self, local_id: u32, delivery: Delivery, msg: Message) -> bool {
        let Some(tunnel) = self.outbound.get_mut(&local_id) else {
            return false;
        };
        if !tunnel.is_usable() {
            return false;
        }
        let first_hop_ident = tunnel.config.first_hop().router.ident_hash();
        let wire = tunnel.wrap_for_send(vec![TunnelMessageBlock { delivery, message: msg }]);
        for data_msg in wire {
            self.transports.send_message(first_hop_ident, data_msg);
        }
        true
    }

    async fn handle_incoming(&mut self, incoming: IncomingMessage) {
        let IncomingMessage { from, message } = incoming;
        match message.msg_type {
            MessageType::TunnelData => self.handle_tunnel_data(message).await,
            MessageType::TunnelGateway => self.handle_tunnel_gateway(from, message).await,
            MessageType::TunnelBuild | MessageType::VariableTunnelBuild => {
                self.handle_build(message);
            }
            MessageType::TunnelBuildReply | MessageType::VariableTunnelBuildReply => {
                self.handle_build_reply(message);
            }
            _ => {
                // not tunnel traffic: straight to the upper edge
                let _ = self
                    .delivered_tx
                    .send(IncomingMessage { from, message })
                    .await;
            }
        }
    }

    async fn handle_tunnel_data(&mut self, message: Message) {
        if message.payload.len() != 1028 {
            debug!(len = message.payload.len(), "tunnel data with bad length dropped");
            return;
        }
        let tunnel_id = u32::from_be_bytes(message.payload[..4].try_into().expect("fixed split"));

        if let Some(transit) = self.transit.get_mut(&tunnel_id) {
            match transit.handle_tunnel_data(&message.payload) {
                Ok(actions) => self.run_transit_actions(actions).await,
                Err(err) => debug!(tunnel_id, %err, "transit tunnel data rejected"),
            }
            return;
        }

        if let Some(tunnel) = self.inbound.get_mut(&tunnel_id) {
            match tunnel.handle_tunnel_data(&message.payload) {
                Ok(delivered) => {
                    for (delivery, msg) in delivered {
                        match delivery {
                            Delivery::Local => self.deliver_local(msg).await,
                            // traffic may not exit through an inbound tunnel
                            other => {
                                warn!(?other, "non-local delivery from inbound tunnel dropped")
                            }
                        }
                    }
                }
                Err(err) => debug!(tunnel_id, %err, "inbound tunnel data rejected"),
            }
            return;
        }
        trace!(tunnel_id, "tunnel data for unknown tunnel");
    }

    async fn handle_tunnel_gateway(&mut self, from: IdentHash, message: Message) {
        let (tunnel_id, inner) = match parse_tunnel_gateway(&message.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, "malformed tunnel gateway message");
                return;
            }
        };
        let inner_msg = match Message::from_bytes(inner) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "tunnel gateway inner message malformed");
                return;
            }
        };

        if let Some(transit) = self.transit.get_mut(&tunnel_id) {
            match transit.handle_tunnel_gateway(inner_msg) {
                Ok(actions) => self.run_transit_actions(actions).await,
                Err(err) => debug!(tunnel_id, %err, "transit gateway rejected message"),
            }
            return;
        }

        // zero-hop inbound: the "gateway" is our own receive id
        if self.inbound.contains_key(&tunnel_id) {
            Box::pin(self.handle_incoming(IncomingMessage {
                from,
                message: inner_msg,
            }))
            .await;
            return;
        }
        trace!(tunnel_id, "tunnel gateway for unknown tunnel");
    }

    fn handle_build(&mut self, message: Message) {
        // the fixed-size variant carries exactly eight records with no count
        // byte; normalize it to the counted form
        let fixed = message.msg_type == MessageType::TunnelBuild;
        let payload: std::borrow::Cow<'_, [u8]> = if fixed {
            let mut counted = Vec::with_capacity(1 + message.payload.len());
            counted.push(8);
            counted.extend_from_slice(&message.payload);
            counted.into()
        } else {
            (&message.payload[..]).into()
        };

        // a build message carrying our pending reply id is the response for
        // an inbound tunnel we originated
        if let Some(pending) = self.pending.remove(&message.msg_id) {
            if pending.inbound {
                if let Some(tunnel) = self.inbound.get_mut(&pending.local_id) {
                    match tunnel.handle_build_reply(&payload) {
                        Ok(true) => self.exploratory_adopt(pending.local_id, true),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%err, "inbound build reply malformed");
                            tunnel.state = TunnelState::BuildFailed;
                        }
                    }
                }
                return;
            }
            // not ours after all; restore and fall through
            self.pending.insert(message.msg_id, pending);
        }

        let accept = self.ctx.accepts_tunnels() && self.transit.len() < MAX_TRANSIT_TUNNELS;
        let handled = match build::process_build_request(&self.ctx, &payload, accept) {
            Ok(handled) => handled,
            Err(err) => {
                debug!(%err, "build request rejected");
                return;
            }
        };
        let Some((request, mut forwarded)) = handled else {
            trace!("build request not addressed to us");
            return;
        };
        if fixed {
            // strip the count byte again before forwarding in fixed form
            forwarded.remove(0);
        }

        if accept {
            let transit = TransitTunnel::new(
                request.receive_tunnel_id,
                request.next_ident,
                request.next_tunnel_id,
                &request.layer_key,
                &request.iv_key,
                request.is_gateway,
                request.is_endpoint,
            );
            info!(
                tunnel_id = request.receive_tunnel_id,
                role = transit.role_name(),
                "transit tunnel accepted"
            );
            self.transit.insert(request.receive_tunnel_id, transit);
        } else {
            debug!(tunnel_id = request.receive_tunnel_id, "transit tunnel declined");
        }

        if request.is_endpoint {
            // we are the outbound endpoint: reply goes through the reply
            // tunnel gateway
            let reply_type = if fixed {
                MessageType::TunnelBuildReply
            } else {
                MessageType::VariableTunnelBuildReply
            };
            let reply = create_tunnel_gateway_msg_raw(
                request.next_tunnel_id,
                reply_type,
                request.send_msg_id,
                &forwarded,
            );
            self.transports.send_message(request.next_ident, reply);
        } else {
            let forward = Message::with_id(message.msg_type, request.send_msg_id, forwarded);
            self.transports.send_message(request.next_ident, forward);
        }
    }

    fn handle_build_reply(&mut self, message: Message) {
        let Some(pending) = self.pending.remove(&message.msg_id) else {
            debug!(msg_id = message.msg_id, "build reply with no pending tunnel");
            return;
        };
        let map = if pending.inbound {
            &mut self.inbound
        } else {
            &mut self.outbound
        };
        if let Some(tunnel) = map.get_mut(&pending.local_id) {
            match tunnel.handle_build_reply(&message.payload) {
                Ok(true) => self.exploratory_adopt(pending.local_id, pending.inbound),
                Ok(false) => {}
                Err(err) => {
                    warn!(%err, "build reply malformed");
                    tunnel.state = TunnelState::BuildFailed;
                }
            }
        }
    }

    /// Track pool membership for tunnels the exploratory pool requested.
    fn exploratory_adopt(&mut self, local_id: u32, inbound: bool) {
        let list = if inbound {
            &mut self.exploratory.inbound
        } else {
            &mut self.exploratory.outbound
        };
        if !list.contains(&local_id) {
            list.push(local_id);
        }
    }

    async fn run_transit_actions(&mut self, actions: Vec<TransitAction>) {
        for action in actions {
            match action {
                TransitAction::Send { to, msg } => {
                    if to == self.ctx.ident_hash() {
                        // the next hop is us (e.g. reply gateway of our own
                        // inbound tunnel): short-circuit the wire
                        Box::pin(self.handle_incoming(IncomingMessage {
                            from: to,
                            message: msg,
                        }))
                        .await;
                    } else {
                        self.transports.send_message(to, msg);
                    }
                }
                TransitAction::DeliverLocal(msg) => {
                    Box::pin(self.handle_incoming(IncomingMessage {
                        from: self.ctx.ident_hash(),
                        message: msg,
                    }))
                    .await;
                }
            }
        }
    }

    async fn deliver_local(&mut self, msg: Message) {
        match msg.msg_type {
            MessageType::TunnelData
            | MessageType::TunnelGateway
            | MessageType::TunnelBuild
            | MessageType::VariableTunnelBuild
            | MessageType::TunnelBuildReply
            | MessageType::VariableTunnelBuildReply => {
                // tunnel traffic delivered out of a tunnel re-enters the
                // reactor
                Box::pin(self.handle_incoming(IncomingMessage {
                    from: self.ctx.ident_hash(),
                    message: msg,
                }))
                .await;
            }
            _ => {
                let _ = self
                    .delivered_tx
                    .send(IncomingMessage {
                        from: self.ctx.ident_hash(),
                        message: msg,
                    })
                    .await;
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for tunnel in self.inbound.values_mut().chain(self.outbound.values_mut()) {
            tunnel.tick(now);
            tunnel.sweep_reassembly(now);
        }
        let expired_inbound: Vec<u32> = self
            .inbound
            .iter()
            .filter(|(_, t)| {
                matches!(t.state, TunnelState::Expired)
                    || (matches!(t.state, TunnelState::BuildFailed)
                        && now.duration_since(t.created_at) > 2 * BUILD_TIMEOUT)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired_inbound {
            self.inbound.remove(&id);
            self.exploratory.forget(id);
        }
        let expired_outbound: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, t)| {
                matches!(t.state, TunnelState::Expired)
                    || (matches!(t.state, TunnelState::BuildFailed)
                        && now.duration_since(t.created_at) > 2 * BUILD_TIMEOUT)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in expired_outbound {
            self.outbound.remove(&id);
            self.exploratory.forget(id);
        }
        self.pending.retain(|_, p| {
            let map = if p.inbound { &self.inbound } else { &self.outbound };
            map.get(&p.local_id)
                .map(|t| t.state == TunnelState::Pending)
                .unwrap_or(false)
        });
        self.transit.retain(|id, t| {
            let keep = !t.is_expired(now);
            if !keep {
                debug!(tunnel_id = id, "transit tunnel expired");
            }
            keep
        });
        self.maintain_exploratory_pool();
    }

    /// Keep the exploratory pool at its target counts, inbound first so
    /// outbound builds always have a reply path.
    fn maintain_exploratory_pool(&mut self) {
        let viable_in: Vec<u32> = self
            .exploratory
            .inbound
            .iter()
            .copied()
            .filter(|id| {
                self.inbound
                    .get(id)
                    .map(|t| t.state == TunnelState::Established || t.state == TunnelState::Pending)
                    .unwrap_or(false)
            })
            .collect();
        let viable_out: Vec<u32> = self
            .exploratory
            .outbound
            .iter()
            .copied()
            .filter(|id| {
                self.outbound
                    .get(id)
                    .map(|t| t.state == TunnelState::Established || t.state == TunnelState::Pending)
                    .unwrap_or(false)
            })
            .collect();
        let need_in = self
            .exploratory
            .config
            .inbound_count
            .saturating_sub(viable_in.len());
        let need_out = self
            .exploratory
            .config
            .outbound_count
            .saturating_sub(viable_out.len());

        let our_ident = self.ctx.ident_hash();
        for _ in 0..need_in {
            let hops = self.exploratory.config.inbound_hops;
            let Some(peers) = self.exploratory.select_peers(&self.routers, hops, &our_ident)
            else {
                trace!("not enough peers for an exploratory inbound tunnel");
                break;
            };
            if let Some(id) = self.build_inbound(peers) {
                self.exploratory.inbound.push(id);
            }
        }

        if need_out > 0 {
            // a reply path requires an established inbound tunnel
            let reply = self
                .exploratory
                .inbound
                .iter()
                .filter_map(|id| self.inbound.get(id))
                .find(|t| t.is_usable())
                .map(|t| t.gateway_entry());
            let Some((reply_gateway, reply_tunnel_id)) = reply else {
                return;
            };
            for _ in 0..need_out {
                let hops = self.exploratory.config.outbound_hops;
                let Some(peers) = self.exploratory.select_peers(&self.routers, hops, &our_ident)
                else {
                    trace!("not enough peers for an exploratory outbound tunnel");
                    break;
                };
                if let Some(id) = self.build_outbound(peers, reply_gateway, reply_tunnel_id) {
                    self.exploratory.outbound.push(id);
                }
            }
        }
    }
}
