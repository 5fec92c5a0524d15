//! NTCP server: accepts inbound links and dials outbound ones. Each session
//! runs as its own task and reports back through the shared event channel.

mod session;

pub use session::NTCP_MAX_MESSAGE_LEN;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veilnet_core::{RouterContext, RouterInfo};

use crate::supplier::DhSupplier;
use crate::transports::TransportEvent;
use crate::Result;

pub struct NtcpServer {
    ctx: Arc<RouterContext>,
    supplier: Arc<DhSupplier>,
    events: mpsc::Sender<TransportEvent>,
}

impl NtcpServer {
    pub(crate) fn new(
        ctx: Arc<RouterContext>,
        supplier: Arc<DhSupplier>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            ctx,
            supplier,
            events,
        }
    }

    /// Bind and start the accept loop. Returns the actual bound address.
    pub async fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        info!(%local, "NTCP listening");

        let ctx = self.ctx.clone();
        let supplier = self.supplier.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound NTCP connection");
                        tokio::spawn(session::run_server(
                            ctx.clone(),
                            supplier.clone(),
                            stream,
                            events.clone(),
                        ));
                    }
                    Err(err) => {
                        warn!(%err, "NTCP accept failed");
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial a peer by its published NTCP address.
    pub fn connect(&self, remote: RouterInfo) {
        tokio::spawn(session::run_client(
            self.ctx.clone(),
            self.supplier.clone(),
            remote,
            self.events.clone(),
        ));
    }
}
