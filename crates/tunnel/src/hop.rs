//! Tunnel hop configuration. Hops live in a flat arena inside their
//! `TunnelConfig` and refer to each other by index, so a tunnel is a plain
//! vector instead of a linked structure.

use rand::Rng;
use rand::RngCore;

use veilnet_core::{IdentHash, RouterInfo};
use veilnet_crypto::AesKey;

/// Index of a hop within its tunnel's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HopId(pub usize);

#[derive(Clone)]
pub struct TunnelHop {
    pub router: RouterInfo,
    /// The id under which this hop receives our tunnel's traffic.
    pub tunnel_id: u32,
    pub next_tunnel_id: u32,
    pub next_ident: IdentHash,
    pub layer_key: AesKey,
    pub iv_key: AesKey,
    pub reply_key: AesKey,
    pub reply_iv: [u8; 16],
    pub is_gateway: bool,
    pub is_endpoint: bool,
    /// Position of this hop's record in the build message.
    pub record_index: usize,
}

fn random_key() -> AesKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Tunnel ids are nonzero.
pub fn random_tunnel_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

impl TunnelHop {
    fn new(router: RouterInfo) -> Self {
        let mut reply_iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut reply_iv);
        let ident = router.ident_hash();
        Self {
            router,
            tunnel_id: random_tunnel_id(),
            next_tunnel_id: 0,
            next_ident: ident,
            layer_key: random_key(),
            iv_key: random_key(),
            reply_key: random_key(),
            reply_iv,
            is_gateway: false,
            is_endpoint: false,
            record_index: 0,
        }
    }
}

/// An ordered chain of hops plus the roles at each end.
#[derive(Clone)]
pub struct TunnelConfig {
    hops: Vec<TunnelHop>,
}

impl TunnelConfig {
    /// Inbound tunnel: the remote first hop is the gateway, the last hop
    /// forwards into our router under a fresh local receive id. We are the
    /// endpoint, so no remote hop carries that flag.
    pub fn inbound(peers: Vec<RouterInfo>, our_ident: IdentHash) -> Self {
        let mut config = Self::chained(peers);
        if let Some(first) = config.hops.first_mut() {
            first.is_gateway = true;
        }
        if let Some(last) = config.hops.last_mut() {
            last.next_ident = our_ident;
            last.next_tunnel_id = random_tunnel_id();
        }
        config
    }

    /// Outbound tunnel: we are the gateway; the last hop forwards replies to
    /// the gateway of the chosen inbound tunnel.
    pub fn outbound(
        peers: Vec<RouterInfo>,
        reply_gateway: IdentHash,
        reply_tunnel_id: u32,
    ) -> Self {
        let mut config = Self::chained(peers);
        if let Some(last) = config.hops.last_mut() {
            last.is_endpoint = true;
            last.next_ident = reply_gateway;
            last.next_tunnel_id = reply_tunnel_id;
        }
        config
    }

    fn chained(peers: Vec<RouterInfo>) -> Self {
        let mut hops: Vec<TunnelHop> = peers.into_iter().map(TunnelHop::new).collect();
        for i in 0..hops.len().saturating_sub(1) {
            hops[i].next_ident = hops[i + 1].router.ident_hash();
            hops[i].next_tunnel_id = hops[i + 1].tunnel_id;
        }
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
        }
        Self { hops }
    }

    pub fn hops(&self) -> &[TunnelHop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hop(&self, id: HopId) -> &TunnelHop {
        &self.hops[id.0]
    }

    pub fn first_hop(&self) -> &TunnelHop {
        &self.hops[0]
    }

    pub fn last_hop(&self) -> &TunnelHop {
        &self.hops[self.hops.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_core::{PrivateKeys, RouterInfo};

    fn router() -> RouterInfo {
        let keys = PrivateKeys::generate();
        let mut ri = RouterInfo::new(keys.identity().clone());
        ri.sign(&keys).unwrap();
        ri
    }

    #[test]
    fn inbound_chain_roles() {
        let us = IdentHash([9u8; 32]);
        let config = TunnelConfig::inbound(vec![router(), router(), router()], us);
        assert_eq!(config.len(), 3);
        assert!(config.first_hop().is_gateway);
        // the endpoint of an inbound tunnel is the local router, not a hop
        assert!(!config.last_hop().is_endpoint);
        assert_eq!(config.last_hop().next_ident, us);
        assert_ne!(config.last_hop().next_tunnel_id, 0);
        // middle hop points at the last hop
        assert_eq!(
            config.hops()[1].next_tunnel_id,
            config.last_hop().tunnel_id
        );
        assert!(!config.hops()[1].is_gateway);
        assert!(!config.hops()[1].is_endpoint);
    }

    #[test]
    fn outbound_chain_points_at_reply_tunnel() {
        let reply_gw = IdentHash([7u8; 32]);
        let config = TunnelConfig::outbound(vec![router(), router()], reply_gw, 4242);
        assert!(!config.first_hop().is_gateway);
        assert!(config.last_hop().is_endpoint);
        assert_eq!(config.last_hop().next_ident, reply_gw);
        assert_eq!(config.last_hop().next_tunnel_id, 4242);
        assert_eq!(config.first_hop().next_tunnel_id, config.last_hop().tunnel_id);
    }

    #[test]
    fn tunnel_ids_nonzero() {
        for _ in 0..64 {
            assert_ne!(random_tunnel_id(), 0);
        }
    }
}
