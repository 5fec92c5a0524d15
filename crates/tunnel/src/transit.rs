//! Transit participation: tunnels other routers built through us. A transit
//! hop is exactly one of participant, gateway, or endpoint; all three share
//! the per-hop layer cipher and the forward entry point.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use veilnet_core::{create_tunnel_data_msg, create_tunnel_gateway_msg, IdentHash, Message};
use veilnet_crypto::LayerCipher;

use crate::endpoint::TunnelEndpoint;
use crate::gateway::{Delivery, TunnelGatewayBuffer, TunnelMessageBlock};
use crate::{Result, TunnelError, TUNNEL_LIFETIME};

/// What a transit hop wants done after handling a message.
#[derive(Debug)]
pub enum TransitAction {
    /// Forward to the named router.
    Send { to: IdentHash, msg: Message },
    /// Hand to the local router (endpoint local delivery).
    DeliverLocal(Message),
}

/// Hard cap on concurrently maintained transit tunnels.
pub const MAX_TRANSIT_TUNNELS: usize = 2500;

pub struct TransitTunnel {
    pub tunnel_id: u32,
    pub next_ident: IdentHash,
    pub next_tunnel_id: u32,
    role: TransitRole,
    layer: LayerCipher,
    pub created_at: Instant,
    pub transferred_bytes: u64,
}

enum TransitRole {
    Participant,
    Gateway(TunnelGatewayBuffer),
    Endpoint(TunnelEndpoint),
}

impl TransitTunnel {
    pub fn new(
        tunnel_id: u32,
        next_ident: IdentHash,
        next_tunnel_id: u32,
        layer_key: &[u8; 32],
        iv_key: &[u8; 32],
        is_gateway: bool,
        is_endpoint: bool,
    ) -> Self {
        let role = if is_endpoint {
            debug!(tunnel_id, "transit endpoint created");
            TransitRole::Endpoint(TunnelEndpoint::new(false))
        } else if is_gateway {
            debug!(tunnel_id, "transit gateway created");
            TransitRole::Gateway(TunnelGatewayBuffer::new())
        } else {
            debug!(tunnel_id, next_tunnel_id, "transit participant created");
            TransitRole::Participant
        };
        Self {
            tunnel_id,
            next_ident,
            next_tunnel_id,
            role,
            layer: LayerCipher::new(layer_key, iv_key),
            created_at: Instant::now(),
            transferred_bytes: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > TUNNEL_LIFETIME + Duration::from_secs(30)
    }

    /// A tunnel data message arrived for this hop: apply our layer and act
    /// by role.
    pub fn handle_tunnel_data(&mut self, payload: &[u8]) -> Result<Vec<TransitAction>> {
        if payload.len() != 1028 {
            return Err(TunnelError::MalformedTunnelData("bad length"));
        }
        self.transferred_bytes += payload.len() as u64;
        let mut block = [0u8; 1024];
        block.copy_from_slice(&payload[4..]);
        self.layer.decrypt(&mut block);

        match &mut self.role {
            TransitRole::Participant => {
                let msg = create_tunnel_data_msg(self.next_tunnel_id, &block);
                Ok(vec![TransitAction::Send {
                    to: self.next_ident,
                    msg,
                }])
            }
            TransitRole::Endpoint(endpoint) => {
                let delivered = endpoint.process(&block)?;
                let mut actions = Vec::with_capacity(delivered.len());
                for (delivery, msg) in delivered {
                    match delivery {
                        Delivery::Local => actions.push(TransitAction::DeliverLocal(msg)),
                        Delivery::Tunnel { hash, tunnel_id } => {
                            actions.push(TransitAction::Send {
                                to: hash,
                                msg: create_tunnel_gateway_msg(tunnel_id, &msg),
                            });
                        }
                        Delivery::Router { hash } => {
                            actions.push(TransitAction::Send { to: hash, msg });
                        }
                    }
                }
                Ok(actions)
            }
            TransitRole::Gateway(_) => {
                warn!(tunnel_id = self.tunnel_id, "tunnel data at a transit gateway, dropped");
                Ok(Vec::new())
            }
        }
    }

    /// A tunnel gateway message arrived: wrap the inner message into tunnel
    /// data blocks, layer-encrypt, and forward (gateway role only).
    pub fn handle_tunnel_gateway(&mut self, inner: Message) -> Result<Vec<TransitAction>> {
        let TransitRole::Gateway(buffer) = &mut self.role else {
            warn!(tunnel_id = self.tunnel_id, "gateway message at a non-gateway transit hop");
            return Err(TunnelError::WrongRole);
        };
        self.transferred_bytes += inner.wire_len() as u64;
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Local,
            message: inner,
        });
        buffer.complete_current();
        let mut actions = Vec::new();
        for mut block in buffer.drain() {
            self.layer.decrypt(&mut block);
            let msg = create_tunnel_data_msg(self.next_tunnel_id, &block);
            actions.push(TransitAction::Send {
                to: self.next_ident,
                msg,
            });
        }
        Ok(actions)
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            TransitRole::Participant => "participant",
            TransitRole::Gateway(_) => "gateway",
            TransitRole::Endpoint(_) => "endpoint",
        }
    }
}
