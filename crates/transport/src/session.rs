//! Session-facing types shared by both transports. Sessions are variants
//! behind a common handle rather than subclasses: the handle carries the
//! per-session outbound queue and enough identity to route and log.

use tokio::sync::mpsc;

use veilnet_core::{IdentHash, Message};

/// Which wire protocol a session speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Ntcp,
    Ssu,
}

/// Handshake direction. Post-handshake behavior is identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// A parsed message surfaced by a transport, tagged with the authenticated
/// remote identity.
#[derive(Debug)]
pub struct IncomingMessage {
    pub from: IdentHash,
    pub message: Message,
}

/// Cheap, cloneable handle to an established session. Dropping all handles
/// (or the session task exiting) closes the outbound queue.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub remote: IdentHash,
    pub kind: SessionKind,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn new(remote: IdentHash, kind: SessionKind, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            remote,
            kind,
            outbound,
        }
    }

    /// Queue a message for this session; FIFO per peer.
    pub fn send(&self, msg: Message) -> crate::Result<()> {
        self.outbound
            .try_send(msg)
            .map_err(|_| crate::TransportError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
