//! Tunnel pools: keep a target number of inbound and outbound tunnels
//! alive, rebuilding before expiry. Hop selection ranks candidates by XOR
//! distance of their daily routing keys from a random point, with family
//! diversity and an optional restricted-route whitelist.

use std::collections::{HashMap, HashSet};

use rand::RngCore;

use veilnet_core::{current_routing_key, IdentHash, RouterInfo, CAP_UNREACHABLE};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub inbound_hops: usize,
    pub outbound_hops: usize,
    pub inbound_count: usize,
    pub outbound_count: usize,
    /// Restricted routes: when set, hops come only from this set.
    pub allowed: Option<HashSet<IdentHash>>,
}

impl PoolConfig {
    /// The router's own pool for infrastructure traffic.
    pub fn exploratory() -> Self {
        Self {
            inbound_hops: 2,
            outbound_hops: 2,
            inbound_count: 2,
            outbound_count: 2,
            allowed: None,
        }
    }
}

/// Tracks the tunnels belonging to one local destination (or the router
/// itself). The manager owns the tunnels; the pool holds their ids.
pub struct TunnelPool {
    pub config: PoolConfig,
    pub inbound: Vec<u32>,
    pub outbound: Vec<u32>,
}

impl TunnelPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }

    pub fn forget(&mut self, tunnel_id: u32) {
        self.inbound.retain(|&id| id != tunnel_id);
        self.outbound.retain(|&id| id != tunnel_id);
    }

    /// Pick hops for a new tunnel. Returns None when the candidate set is
    /// too small.
    pub fn select_peers(
        &self,
        routers: &HashMap<IdentHash, RouterInfo>,
        hops: usize,
        our_ident: &IdentHash,
    ) -> Option<Vec<RouterInfo>> {
        let mut target = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut target);
        let target = IdentHash(target);

        let mut candidates: Vec<&RouterInfo> = routers
            .values()
            .filter(|ri| ri.ident_hash() != *our_ident)
            .filter(|ri| !ri.caps().contains(CAP_UNREACHABLE))
            .filter(|ri| ri.ntcp_address().is_some() || ri.ssu_address().is_some())
            .filter(|ri| {
                self.config
                    .allowed
                    .as_ref()
                    .map(|allowed| allowed.contains(&ri.ident_hash()))
                    .unwrap_or(true)
            })
            .collect();
        if candidates.len() < hops {
            return None;
        }

        candidates.sort_by_key(|ri| {
            current_routing_key(&ri.ident_hash()).distance(&target)
        });

        let mut selected: Vec<RouterInfo> = Vec::with_capacity(hops);
        let mut families: HashSet<String> = HashSet::new();
        for candidate in candidates {
            if selected.len() == hops {
                break;
            }
            if let Some(family) = candidate.family() {
                if !families.insert(family.to_string()) {
                    continue;
                }
            }
            selected.push(candidate.clone());
        }
        if selected.len() == hops {
            Some(selected)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_core::{RouterAddress, RouterContext, TransportStyle, PROP_FAMILY};

    fn router_with(family: Option<&str>) -> RouterInfo {
        let ctx = RouterContext::ephemeral().unwrap();
        let mut ri = RouterInfo::new(ctx.keys().identity().clone());
        ri.set_addresses(vec![RouterAddress::new(
            TransportStyle::Ntcp,
            "127.0.0.1:1234".parse().unwrap(),
        )]);
        if let Some(family) = family {
            ri.set_property(PROP_FAMILY, family);
        }
        ri.sign(ctx.keys()).unwrap();
        ri
    }

    fn router_map(routers: Vec<RouterInfo>) -> HashMap<IdentHash, RouterInfo> {
        routers.into_iter().map(|r| (r.ident_hash(), r)).collect()
    }

    #[test]
    fn selects_requested_hop_count() {
        let pool = TunnelPool::new(PoolConfig::exploratory());
        let routers = router_map(vec![
            router_with(None),
            router_with(None),
            router_with(None),
            router_with(None),
        ]);
        let us = IdentHash([1u8; 32]);
        let peers = pool.select_peers(&routers, 3, &us).unwrap();
        assert_eq!(peers.len(), 3);
        let unique: HashSet<_> = peers.iter().map(|p| p.ident_hash()).collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn family_diversity_enforced() {
        let pool = TunnelPool::new(PoolConfig::exploratory());
        let routers = router_map(vec![
            router_with(Some("fam-a")),
            router_with(Some("fam-a")),
            router_with(Some("fam-b")),
        ]);
        let us = IdentHash([1u8; 32]);
        // only two distinct families available
        assert!(pool.select_peers(&routers, 3, &us).is_none());
        let peers = pool.select_peers(&routers, 2, &us).unwrap();
        let families: HashSet<_> = peers.iter().map(|p| p.family().unwrap().to_string()).collect();
        assert_eq!(families.len(), 2);
    }

    #[test]
    fn whitelist_restricts_selection() {
        let allowed_router = router_with(None);
        let other = router_with(None);
        let mut config = PoolConfig::exploratory();
        config.allowed = Some([allowed_router.ident_hash()].into_iter().collect());
        let pool = TunnelPool::new(config);
        let routers = router_map(vec![allowed_router.clone(), other]);
        let us = IdentHash([1u8; 32]);
        let peers = pool.select_peers(&routers, 1, &us).unwrap();
        assert_eq!(peers[0].ident_hash(), allowed_router.ident_hash());
        assert!(pool.select_peers(&routers, 2, &us).is_none());
    }
}
