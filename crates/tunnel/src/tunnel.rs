//! Tunnels we own: outbound (we are the gateway) and inbound (we are the
//! endpoint), with their build state machine and the owner-side layer
//! processing that makes the per-hop transforms cancel.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use veilnet_core::{create_tunnel_data_msg, IdentHash, Message};
use veilnet_crypto::LayerCipher;

use crate::build::{process_build_reply, BUILD_RET_ACCEPT};
use crate::endpoint::TunnelEndpoint;
use crate::gateway::{Delivery, TunnelGatewayBuffer, TunnelMessageBlock};
use crate::hop::TunnelConfig;
use crate::{Result, TUNNEL_LIFETIME};

/// Build must complete within this window.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(10);
/// Tunnels are replaced this long before they expire.
pub const TUNNEL_EXPIRING_MARGIN: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    Established,
    BuildFailed,
    Expiring,
    Expired,
}

pub struct Tunnel {
    pub config: TunnelConfig,
    pub is_inbound: bool,
    pub state: TunnelState,
    pub created_at: Instant,
    /// Correlates the build reply with this tunnel.
    pub reply_msg_id: u32,
    endpoint: Option<TunnelEndpoint>,
    gateway: Option<TunnelGatewayBuffer>,
}

impl Tunnel {
    pub fn outbound(config: TunnelConfig, reply_msg_id: u32) -> Self {
        Self {
            config,
            is_inbound: false,
            state: TunnelState::Pending,
            created_at: Instant::now(),
            reply_msg_id,
            endpoint: None,
            gateway: Some(TunnelGatewayBuffer::new()),
        }
    }

    pub fn inbound(config: TunnelConfig, reply_msg_id: u32) -> Self {
        Self {
            config,
            is_inbound: true,
            state: TunnelState::Pending,
            created_at: Instant::now(),
            reply_msg_id,
            endpoint: Some(TunnelEndpoint::new(true)),
            gateway: None,
        }
    }

    /// The id this tunnel is known by locally: the receive id at our end for
    /// inbound tunnels, the first hop's receive id for outbound ones.
    pub fn local_id(&self) -> u32 {
        if self.is_inbound {
            self.config.last_hop().next_tunnel_id
        } else {
            self.config.first_hop().tunnel_id
        }
    }

    /// Gateway router and receive id to hand to peers that should reply
    /// through this (inbound) tunnel.
    pub fn gateway_entry(&self) -> (IdentHash, u32) {
        let first = self.config.first_hop();
        (first.router.ident_hash(), first.tunnel_id)
    }

    /// Apply the inverse layer transform for every hop, last hop first; the
    /// hops' own transforms then cancel one per hop.
    fn apply_owner_layers(&self, block: &mut [u8; 1024]) {
        for hop in self.config.hops().iter().rev() {
            LayerCipher::new(&hop.layer_key, &hop.iv_key).encrypt(block);
        }
    }

    /// Outbound only: pack messages into tunnel data blocks addressed to the
    /// first hop. Returns the wire messages to send there.
    pub fn wrap_for_send(&mut self, blocks: Vec<TunnelMessageBlock>) -> Vec<Message> {
        let Some(gateway) = self.gateway.as_mut() else {
            return Vec::new();
        };
        for block in &blocks {
            gateway.put(block);
        }
        gateway.complete_current();
        let first_hop_id = self.config.first_hop().tunnel_id;
        let data_blocks = gateway.drain();
        let mut out = Vec::with_capacity(data_blocks.len());
        for mut data_block in data_blocks {
            self.apply_owner_layers(&mut data_block);
            out.push(create_tunnel_data_msg(first_hop_id, &data_block));
        }
        out
    }

    /// Inbound only: peel all layers off a received tunnel data message and
    /// reassemble.
    pub fn handle_tunnel_data(&mut self, payload: &[u8]) -> Result<Vec<(Delivery, Message)>> {
        let mut block = [0u8; 1024];
        block.copy_from_slice(&payload[4..1028]);
        self.apply_owner_layers(&mut block);
        let endpoint = self
            .endpoint
            .as_mut()
            .expect("inbound tunnels have an endpoint");
        endpoint.process(&block)
    }

    /// Originator side of the build reply. Establishes or fails the tunnel.
    pub fn handle_build_reply(&mut self, payload: &[u8]) -> Result<bool> {
        let verdicts = process_build_reply(&self.config, payload)?;
        let accepted = verdicts.iter().all(|&v| v == BUILD_RET_ACCEPT);
        if accepted {
            info!(
                tunnel = self.local_id(),
                inbound = self.is_inbound,
                hops = self.config.len(),
                "tunnel established"
            );
            self.state = TunnelState::Established;
        } else {
            debug!(
                tunnel = self.local_id(),
                ?verdicts,
                "tunnel build declined"
            );
            self.state = TunnelState::BuildFailed;
        }
        Ok(accepted)
    }

    /// Advance age-based state. Returns true if the state changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let age = now.duration_since(self.created_at);
        let next = match self.state {
            TunnelState::Pending if age > BUILD_TIMEOUT => TunnelState::BuildFailed,
            TunnelState::Established if age > TUNNEL_LIFETIME => TunnelState::Expired,
            TunnelState::Established if age > TUNNEL_LIFETIME - TUNNEL_EXPIRING_MARGIN => {
                TunnelState::Expiring
            }
            TunnelState::Expiring if age > TUNNEL_LIFETIME => TunnelState::Expired,
            current => current,
        };
        if next != self.state {
            debug!(tunnel = self.local_id(), from = ?self.state, to = ?next, "tunnel state change");
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state, TunnelState::Established | TunnelState::Expiring)
    }

    pub fn sweep_reassembly(&mut self, now: Instant) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.sweep(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_core::{MessageType, RouterContext, RouterInfo};

    fn router() -> RouterInfo {
        let ctx = RouterContext::ephemeral().unwrap();
        let mut ri = RouterInfo::new(ctx.keys().identity().clone());
        ri.sign(ctx.keys()).unwrap();
        ri
    }

    /// Simulate the hops' forward transforms over a wire message.
    fn run_hops(tunnel: &Tunnel, msg: &Message) -> [u8; 1024] {
        let mut block = [0u8; 1024];
        block.copy_from_slice(&msg.payload[4..]);
        for hop in tunnel.config.hops() {
            LayerCipher::new(&hop.layer_key, &hop.iv_key).decrypt(&mut block);
        }
        block
    }

    #[test]
    fn outbound_layers_cancel_across_hops() {
        let config = TunnelConfig::outbound(vec![router(), router()], IdentHash([1u8; 32]), 99);
        let mut tunnel = Tunnel::outbound(config, 7);
        tunnel.state = TunnelState::Established;

        let payload_msg = Message::new(MessageType::Data, vec![0xEE; 500]);
        let wire = tunnel.wrap_for_send(vec![TunnelMessageBlock {
            delivery: Delivery::Local,
            message: payload_msg.clone(),
        }]);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].msg_type, MessageType::TunnelData);

        // after every hop's transform the endpoint sees the plain block
        let block = run_hops(&tunnel, &wire[0]);
        let mut endpoint = TunnelEndpoint::new(false);
        let delivered = endpoint.process(&block).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, payload_msg);
    }

    #[test]
    fn inbound_owner_recovers_after_hops() {
        let us = IdentHash([2u8; 32]);
        let config = TunnelConfig::inbound(vec![router(), router(), router()], us);
        let mut tunnel = Tunnel::inbound(config, 8);
        tunnel.state = TunnelState::Established;

        // remote gateway packs a message, then each hop transforms it
        let msg = Message::new(MessageType::Data, vec![0xAB; 300]);
        let mut gw = TunnelGatewayBuffer::new();
        gw.put(&TunnelMessageBlock {
            delivery: Delivery::Local,
            message: msg.clone(),
        });
        gw.complete_current();
        let mut block = gw.drain().remove(0);
        for hop in tunnel.config.hops() {
            LayerCipher::new(&hop.layer_key, &hop.iv_key).decrypt(&mut block);
        }

        let mut payload = Vec::with_capacity(1028);
        payload.extend_from_slice(&tunnel.local_id().to_be_bytes());
        payload.extend_from_slice(&block);
        let delivered = tunnel.handle_tunnel_data(&payload).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, msg);
    }

    #[test]
    fn pending_build_times_out() {
        let config = TunnelConfig::outbound(vec![router()], IdentHash([3u8; 32]), 1);
        let mut tunnel = Tunnel::outbound(config, 5);
        assert!(!tunnel.tick(Instant::now()));
        assert!(tunnel.tick(Instant::now() + BUILD_TIMEOUT + Duration::from_secs(1)));
        assert_eq!(tunnel.state, TunnelState::BuildFailed);
    }

    #[test]
    fn established_expires_after_lifetime() {
        let config = TunnelConfig::outbound(vec![router()], IdentHash([3u8; 32]), 1);
        let mut tunnel = Tunnel::outbound(config, 5);
        tunnel.state = TunnelState::Established;
        let t = Instant::now();
        tunnel.tick(t + TUNNEL_LIFETIME - Duration::from_secs(30));
        assert_eq!(tunnel.state, TunnelState::Expiring);
        assert!(tunnel.is_usable());
        tunnel.tick(t + TUNNEL_LIFETIME + Duration::from_secs(1));
        assert_eq!(tunnel.state, TunnelState::Expired);
        assert!(!tunnel.is_usable());
    }
}
