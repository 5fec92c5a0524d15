//! Router configuration: the handful of settings the core needs. The full
//! on-disk configuration system lives with the collaborator layers; this
//! covers ports, the data directory, and participation flags.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{DaemonError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Where `router.keys` and `router.info` live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address published in our descriptor.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// TCP transport port; 0 picks an ephemeral port.
    #[serde(default)]
    pub ntcp_port: u16,

    /// UDP transport port; 0 picks an ephemeral port.
    #[serde(default)]
    pub ssu_port: u16,

    #[serde(default = "default_true")]
    pub enable_ntcp: bool,

    #[serde(default = "default_true")]
    pub enable_ssu: bool,

    /// Whether we carry other routers' tunnels.
    #[serde(default = "default_true")]
    pub accepts_tunnels: bool,

    /// Run reachability tests after SSU sessions establish.
    #[serde(default = "default_true")]
    pub peer_test: bool,
}

fn default_data_dir() -> PathBuf {
    dirs_fallback().join(".veilnet")
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().expect("valid address")
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host: default_host(),
            ntcp_port: 0,
            ssu_port: 0,
            enable_ntcp: true,
            enable_ssu: true,
            accepts_tunnels: true,
            peer_test: true,
        }
    }
}

impl RouterConfig {
    /// Load from a JSON file, or fall back to defaults when absent.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(DaemonError::Io)?;
            let config: RouterConfig =
                serde_json::from_str(&content).map_err(DaemonError::Config)?;
            info!("loaded config from {:?}", path);
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DaemonError::Io)?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(DaemonError::Config)?;
        std::fs::write(path, content).map_err(DaemonError::Io)?;
        info!("saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let config = RouterConfig::load_from(&PathBuf::from("/nonexistent/veilnet.json")).unwrap();
        assert!(config.enable_ntcp);
        assert!(config.accepts_tunnels);
        assert_eq!(config.ntcp_port, 0);
    }

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = RouterConfig::default();
        config.ntcp_port = 14300;
        config.enable_ssu = false;
        config.save_to(&path).unwrap();

        let loaded = RouterConfig::load_from(&path).unwrap();
        assert_eq!(loaded.ntcp_port, 14300);
        assert!(!loaded.enable_ssu);
    }
}
