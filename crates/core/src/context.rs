//! Process-wide router state: the local keys, the published descriptor, and
//! the coarse flags the transports and tunnel layer consult. Passed around as
//! an explicit `Arc<RouterContext>` handle so components stay testable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::Result;
use crate::identity::{IdentHash, PrivateKeys};
use crate::router_info::{
    RouterInfo, CAP_REACHABLE, CAP_UNREACHABLE, PROP_CAPS, PROP_VERSION,
};

const KEYS_FILE: &str = "router.keys";
const INFO_FILE: &str = "router.info";

pub const ROUTER_VERSION: &str = "0.9.30";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterStatus {
    Ok,
    Testing,
    Firewalled,
}

impl RouterStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RouterStatus::Ok,
            1 => RouterStatus::Testing,
            _ => RouterStatus::Firewalled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RouterStatus::Ok => 0,
            RouterStatus::Testing => 1,
            RouterStatus::Firewalled => 2,
        }
    }
}

pub struct RouterContext {
    keys: PrivateKeys,
    router_info: RwLock<RouterInfo>,
    status: AtomicU8,
    accepts_tunnels: AtomicBool,
    is_floodfill: AtomicBool,
    startup_time_secs: u64,
    bandwidth_class: char,
    data_dir: PathBuf,
}

impl RouterContext {
    /// Boot from the data directory, creating keys and a fresh descriptor on
    /// first run.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let keys_path = data_dir.join(KEYS_FILE);
        let keys = if keys_path.exists() {
            let data = std::fs::read(&keys_path)?;
            PrivateKeys::from_bytes(&data)?
        } else {
            info!("no router keys found, creating a new identity");
            let keys = PrivateKeys::generate();
            std::fs::write(&keys_path, keys.to_bytes())?;
            keys
        };

        let info_path = data_dir.join(INFO_FILE);
        let router_info = match RouterInfo::from_file(&info_path) {
            Ok(ri) if ri.ident_hash() == keys.ident_hash() => ri,
            Ok(_) => {
                warn!("persisted descriptor belongs to a different identity, discarding");
                Self::fresh_router_info(&keys)?
            }
            Err(_) => Self::fresh_router_info(&keys)?,
        };

        Ok(Self {
            keys,
            router_info: RwLock::new(router_info),
            status: AtomicU8::new(RouterStatus::Testing.as_u8()),
            accepts_tunnels: AtomicBool::new(true),
            is_floodfill: AtomicBool::new(false),
            startup_time_secs: now_secs(),
            bandwidth_class: 'L',
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// An in-memory context for tests and embedded use; nothing is persisted
    /// until `persist` is called with a real data dir.
    pub fn ephemeral() -> Result<Self> {
        let keys = PrivateKeys::generate();
        let router_info = Self::fresh_router_info(&keys)?;
        Ok(Self {
            keys,
            router_info: RwLock::new(router_info),
            status: AtomicU8::new(RouterStatus::Testing.as_u8()),
            accepts_tunnels: AtomicBool::new(true),
            is_floodfill: AtomicBool::new(false),
            startup_time_secs: now_secs(),
            bandwidth_class: 'L',
            data_dir: PathBuf::new(),
        })
    }

    fn fresh_router_info(keys: &PrivateKeys) -> Result<RouterInfo> {
        let mut ri = RouterInfo::new(keys.identity().clone());
        ri.set_property(PROP_CAPS, "L");
        ri.set_property(PROP_VERSION, ROUTER_VERSION);
        ri.sign(keys)?;
        Ok(ri)
    }

    pub fn keys(&self) -> &PrivateKeys {
        &self.keys
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.keys.ident_hash()
    }

    /// Snapshot of the current local descriptor.
    pub fn router_info(&self) -> RouterInfo {
        self.router_info.read().expect("router info lock").clone()
    }

    /// Mutate the descriptor, re-sign it atomically, and persist if a data
    /// dir is configured.
    pub fn update_router_info<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RouterInfo),
    {
        let updated = {
            let mut guard = self.router_info.write().expect("router info lock");
            mutate(&mut guard);
            guard.sign(&self.keys)?;
            guard.clone()
        };
        self.persist(&updated)
    }

    fn persist(&self, ri: &RouterInfo) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Ok(());
        }
        ri.to_file(&self.data_dir.join(INFO_FILE))
    }

    /// Flush the current descriptor to disk (shutdown path).
    pub fn persist_router_info(&self) -> Result<()> {
        let snapshot = self.router_info();
        self.persist(&snapshot)
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Update reachability. Moving in or out of `Firewalled` republishes the
    /// caps with the reachable bit flipped accordingly.
    pub fn set_status(&self, status: RouterStatus) {
        let old = RouterStatus::from_u8(self.status.swap(status.as_u8(), Ordering::Relaxed));
        if old == status {
            return;
        }
        info!(?old, new = ?status, "router status changed");
        let firewalled = status == RouterStatus::Firewalled;
        let result = self.update_router_info(|ri| {
            let mut caps: String = ri
                .caps()
                .chars()
                .filter(|&c| c != CAP_REACHABLE && c != CAP_UNREACHABLE)
                .collect();
            caps.push(if firewalled { CAP_UNREACHABLE } else { CAP_REACHABLE });
            ri.set_property(PROP_CAPS, &caps);
        });
        if let Err(err) = result {
            warn!(%err, "failed to republish caps after status change");
        }
    }

    pub fn accepts_tunnels(&self) -> bool {
        self.accepts_tunnels.load(Ordering::Relaxed)
    }

    pub fn set_accepts_tunnels(&self, accepts: bool) {
        self.accepts_tunnels.store(accepts, Ordering::Relaxed);
    }

    pub fn is_floodfill(&self) -> bool {
        self.is_floodfill.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        now_secs().saturating_sub(self.startup_time_secs)
    }

    pub fn bandwidth_class(&self) -> char {
        self.bandwidth_class
    }

    /// Decrypt one tunnel build record addressed to us.
    pub fn decrypt_tunnel_build_record(
        &self,
        encrypted: &[u8],
    ) -> Result<[u8; veilnet_crypto::ELGAMAL_DATA_LEN]> {
        Ok(veilnet_crypto::elgamal_decrypt(
            self.keys.private_key(),
            encrypted,
            false,
        )?)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_run_creates_and_reloads_identity() {
        let dir = tempdir().unwrap();
        let first = RouterContext::load_or_create(dir.path()).unwrap();
        let hash = first.ident_hash();
        drop(first);
        let second = RouterContext::load_or_create(dir.path()).unwrap();
        assert_eq!(second.ident_hash(), hash);
        second.router_info().verify().unwrap();
    }

    #[test]
    fn status_change_flips_caps() {
        let ctx = RouterContext::ephemeral().unwrap();
        ctx.set_status(RouterStatus::Ok);
        assert!(ctx.router_info().caps().contains(CAP_REACHABLE));
        ctx.set_status(RouterStatus::Firewalled);
        let caps = ctx.router_info().caps().to_string();
        assert!(caps.contains(CAP_UNREACHABLE));
        assert!(!caps.contains(CAP_REACHABLE));
        ctx.router_info().verify().unwrap();
    }

    #[test]
    fn update_resigns() {
        let ctx = RouterContext::ephemeral().unwrap();
        let before = ctx.router_info().published();
        ctx.update_router_info(|ri| ri.set_property("family", "veil"))
            .unwrap();
        let after = ctx.router_info();
        assert!(after.published() > before);
        after.verify().unwrap();
    }
}
