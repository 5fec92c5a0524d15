//! Inter-router transports: NTCP (framed TCP) and SSU (datagram UDP), the
//! ident-keyed peer table with delayed-message queues, and the background DH
//! keypair supplier both handshakes draw from.

pub mod ntcp;
pub mod ssu;

mod session;
mod supplier;
mod transports;

pub use session::{IncomingMessage, SessionHandle, SessionKind, SessionRole};
pub use supplier::DhSupplier;
pub use transports::{BoundAddrs, Transports, TransportsConfig, TransportsHandle};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Core error: {0}")]
    Core(#[from] veilnet_core::CoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veilnet_crypto::CryptoError),

    #[error("Handshake failed: {0}")]
    Handshake(&'static str),

    #[error("Frame corrupt: {0}")]
    BadFrame(&'static str),

    #[error("Clock skew {0}s exceeds limit")]
    ClockSkew(i64),

    #[error("Peer has no {0} address")]
    NoAddress(&'static str),

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
