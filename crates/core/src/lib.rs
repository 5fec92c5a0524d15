//! Veilnet core data model.
//!
//! Router identities, signed router descriptors, the routed message unit
//! carried by tunnels and transports, and the process-wide router context.

mod base64;
mod context;
mod error;
mod i2np;
mod identity;
mod router_info;

pub use base64::{base32_encode, base64_decode, base64_encode};
pub use context::{RouterContext, RouterStatus};
pub use error::*;
pub use i2np::*;
pub use identity::*;
pub use router_info::*;

/// Network instance identifier carried in every published descriptor.
pub const NET_ID: u8 = 2;
