//! Veilnet router daemon: boots the router context from persisted keys,
//! wires the transports to the tunnel layer, publishes the local descriptor,
//! and offers the upper-edge API the collaborator layers consume.

mod config;

pub use config::RouterConfig;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use veilnet_core::{
    IdentHash, Message, RouterAddress, RouterContext, RouterInfo, TransportStyle,
};
use veilnet_transport::{IncomingMessage, Transports, TransportsConfig, TransportsHandle};
use veilnet_tunnel::{Tunnels, TunnelsHandle};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Core error: {0}")]
    Core(#[from] veilnet_core::CoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] veilnet_transport::TransportError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

pub struct Router {
    ctx: Arc<RouterContext>,
    transports: TransportsHandle,
    tunnels: TunnelsHandle,
    delivered_rx: Option<mpsc::Receiver<IncomingMessage>>,
}

impl Router {
    /// Boot the router: keys, transports, descriptor, tunnel layer.
    pub async fn start(config: RouterConfig) -> Result<Self> {
        let ctx = Arc::new(RouterContext::load_or_create(&config.data_dir)?);
        ctx.set_accepts_tunnels(config.accepts_tunnels);
        info!(ident = %ctx.ident_hash(), "router starting");

        let transports_config = TransportsConfig {
            ntcp_bind: config
                .enable_ntcp
                .then(|| SocketAddr::new(config.host, config.ntcp_port)),
            ssu_bind: config
                .enable_ssu
                .then(|| SocketAddr::new(config.host, config.ssu_port)),
            peer_test: config.peer_test,
        };
        let (transports, incoming_rx, bound) =
            Transports::start(ctx.clone(), transports_config).await?;

        // publish what we actually bound
        let intro_key = *ctx.ident_hash().as_bytes();
        ctx.update_router_info(|ri| {
            let mut addresses = Vec::new();
            if let Some(ntcp) = bound.ntcp {
                addresses.push(RouterAddress::new(
                    TransportStyle::Ntcp,
                    SocketAddr::new(config.host, ntcp.port()),
                ));
            }
            if let Some(ssu) = bound.ssu {
                let mut addr = RouterAddress::new(
                    TransportStyle::Ssu,
                    SocketAddr::new(config.host, ssu.port()),
                );
                addr.set_intro_key(&intro_key);
                addr.options.insert("caps".into(), "BC".into());
                addresses.push(addr);
            }
            ri.set_addresses(addresses);
        })?;

        let (delivered_tx, delivered_rx) = mpsc::channel(512);
        let tunnels = Tunnels::start(ctx.clone(), transports.clone(), incoming_rx, delivered_tx);

        Ok(Self {
            ctx,
            transports,
            tunnels,
            delivered_rx: Some(delivered_rx),
        })
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    /// Snapshot of the local descriptor.
    pub fn local_router_info(&self) -> RouterInfo {
        self.ctx.router_info()
    }

    /// Best-effort delivery to a router by identity.
    pub fn send_message(&self, to: IdentHash, msg: Message) {
        self.transports.send_message(to, msg);
    }

    pub fn close_session(&self, ident: IdentHash) {
        self.transports.close_session(ident);
    }

    /// Seed a peer descriptor (normally the netdb collaborator's job).
    pub fn add_router_info(&self, ri: RouterInfo) {
        self.tunnels.add_router_info(ri);
    }

    pub fn tunnels(&self) -> &TunnelsHandle {
        &self.tunnels
    }

    pub fn transports(&self) -> &TransportsHandle {
        &self.transports
    }

    /// Register the message-received callback. Runs on its own task; may be
    /// called once.
    pub fn on_message_received<F>(&mut self, mut callback: F)
    where
        F: FnMut(IncomingMessage) + Send + 'static,
    {
        let Some(mut rx) = self.delivered_rx.take() else {
            warn!("message receiver already claimed");
            return;
        };
        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                callback(incoming);
            }
        });
    }

    /// Take the raw delivery channel instead of installing a callback.
    pub fn take_message_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.delivered_rx.take()
    }

    /// Persist state and stop. Transport and tunnel tasks die with the
    /// runtime; the descriptor must survive.
    pub async fn shutdown(&self) {
        if let Err(err) = self.ctx.persist_router_info() {
            warn!(%err, "could not persist descriptor on shutdown");
        }
        info!("router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn router_boots_and_publishes_addresses() {
        let dir = tempdir().unwrap();
        let config = RouterConfig {
            data_dir: dir.path().to_path_buf(),
            ..RouterConfig::default()
        };
        let router = Router::start(config).await.unwrap();
        let ri = router.local_router_info();
        ri.verify().unwrap();
        assert!(ri.ntcp_address().is_some());
        let ssu = ri.ssu_address().unwrap();
        assert!(ssu.intro_key().is_some());
        assert_ne!(ssu.port(), Some(0));
        router.shutdown().await;
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let dir = tempdir().unwrap();
        let config = RouterConfig {
            data_dir: dir.path().to_path_buf(),
            ..RouterConfig::default()
        };
        let first = Router::start(config.clone()).await.unwrap();
        let ident = first.context().ident_hash();
        first.shutdown().await;
        drop(first);

        let second = Router::start(config).await.unwrap();
        assert_eq!(second.context().ident_hash(), ident);
    }
}
