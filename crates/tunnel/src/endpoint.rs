//! Endpoint-side reassembly of tunnel data blocks back into routed messages.
//!
//! Two tables per endpoint: in-order partial messages keyed by message id,
//! and an out-of-sequence cache keyed by (message id, fragment number) for
//! fragments that arrive early. Stale entries age out with the routed
//! message expiration window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use veilnet_core::{IdentHash, Message};
use veilnet_crypto::sha256;

use crate::gateway::Delivery;
use crate::{Result, TunnelError};

/// Partial messages older than this are discarded.
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(8);

struct IncompleteMessage {
    delivery: Delivery,
    data: Vec<u8>,
    next_fragment: u8,
    received_at: Instant,
}

struct OutOfSequenceFragment {
    data: Vec<u8>,
    is_last: bool,
    received_at: Instant,
}

pub struct TunnelEndpoint {
    /// Endpoint of an inbound tunnel (we built it) vs. an outbound transit
    /// endpoint; inbound endpoints refuse to re-emit traffic outward.
    is_inbound: bool,
    incomplete: HashMap<u32, IncompleteMessage>,
    out_of_sequence: HashMap<(u32, u8), OutOfSequenceFragment>,
}

impl TunnelEndpoint {
    pub fn new(is_inbound: bool) -> Self {
        Self {
            is_inbound,
            incomplete: HashMap::new(),
            out_of_sequence: HashMap::new(),
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    /// Process one decrypted 1024-byte block (IV plus payload) and return
    /// any messages completed by it.
    pub fn process(&mut self, block: &[u8; 1024]) -> Result<Vec<(Delivery, Message)>> {
        let iv = &block[..16];
        let payload = &block[16..];

        // locate the zero delimiter after the 4-byte checksum
        let zero = payload[4..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(TunnelError::MalformedTunnelData("no delimiter"))?;
        let fragments = &payload[4 + zero + 1..];

        let mut checksummed = Vec::with_capacity(fragments.len() + 16);
        checksummed.extend_from_slice(fragments);
        checksummed.extend_from_slice(iv);
        if sha256(&checksummed)[..4] != payload[..4] {
            return Err(TunnelError::MalformedTunnelData("checksum mismatch"));
        }

        let mut delivered = Vec::new();
        let mut rest = fragments;
        while !rest.is_empty() {
            rest = self.process_fragment(rest, &mut delivered)?;
        }
        Ok(delivered)
    }

    fn process_fragment<'a>(
        &mut self,
        buf: &'a [u8],
        delivered: &mut Vec<(Delivery, Message)>,
    ) -> Result<&'a [u8]> {
        let flag = buf[0];
        let mut rest = &buf[1..];
        let is_follow_on = flag & 0x80 != 0;

        if is_follow_on {
            let fragment_num = (flag >> 1) & 0x3F;
            let is_last = flag & 0x01 != 0;
            if rest.len() < 6 {
                return Err(TunnelError::MalformedTunnelData("short follow-on"));
            }
            let msg_id = u32::from_be_bytes(rest[..4].try_into().expect("fixed split"));
            let size = u16::from_be_bytes([rest[4], rest[5]]) as usize;
            rest = &rest[6..];
            if rest.len() < size {
                return Err(TunnelError::MalformedTunnelData("fragment overrun"));
            }
            let data = &rest[..size];
            self.follow_on_fragment(msg_id, fragment_num, is_last, data, delivered);
            return Ok(&rest[size..]);
        }

        // first fragment
        let delivery_type = (flag >> 5) & 0x03;
        let is_fragmented = flag & 0x08 != 0;
        let delivery = match delivery_type {
            0 => Delivery::Local,
            1 => {
                if rest.len() < 36 {
                    return Err(TunnelError::MalformedTunnelData("short tunnel delivery"));
                }
                let tunnel_id = u32::from_be_bytes(rest[..4].try_into().expect("fixed split"));
                let hash = IdentHash::from_bytes(&rest[4..36]).expect("fixed length");
                rest = &rest[36..];
                Delivery::Tunnel { hash, tunnel_id }
            }
            2 => {
                if rest.len() < 32 {
                    return Err(TunnelError::MalformedTunnelData("short router delivery"));
                }
                let hash = IdentHash::from_bytes(&rest[..32]).expect("fixed length");
                rest = &rest[32..];
                Delivery::Router { hash }
            }
            _ => return Err(TunnelError::MalformedTunnelData("unknown delivery type")),
        };

        let msg_id = if is_fragmented {
            if rest.len() < 4 {
                return Err(TunnelError::MalformedTunnelData("short first fragment"));
            }
            let id = u32::from_be_bytes(rest[..4].try_into().expect("fixed split"));
            rest = &rest[4..];
            Some(id)
        } else {
            None
        };

        if rest.len() < 2 {
            return Err(TunnelError::MalformedTunnelData("short first fragment"));
        }
        let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < size {
            return Err(TunnelError::MalformedTunnelData("fragment overrun"));
        }
        let data = &rest[..size];

        match msg_id {
            None => {
                // unfragmented: deliver immediately
                match Message::from_bytes(data) {
                    Ok(msg) => delivered.push((delivery, msg)),
                    Err(err) => debug!(%err, "tunnel fragment holds unparseable message"),
                }
            }
            Some(msg_id) => {
                if self.incomplete.contains_key(&msg_id) {
                    warn!(msg_id, "duplicate first fragment, replacing");
                }
                self.incomplete.insert(
                    msg_id,
                    IncompleteMessage {
                        delivery,
                        data: data.to_vec(),
                        next_fragment: 1,
                        received_at: Instant::now(),
                    },
                );
                self.drain_out_of_sequence(msg_id, delivered);
            }
        }
        Ok(&rest[size..])
    }

    fn follow_on_fragment(
        &mut self,
        msg_id: u32,
        fragment_num: u8,
        is_last: bool,
        data: &[u8],
        delivered: &mut Vec<(Delivery, Message)>,
    ) {
        match self.incomplete.get_mut(&msg_id) {
            Some(entry) if entry.next_fragment == fragment_num => {
                entry.data.extend_from_slice(data);
                entry.next_fragment += 1;
                if is_last {
                    self.finish(msg_id, delivered);
                } else {
                    self.drain_out_of_sequence(msg_id, delivered);
                }
            }
            _ => {
                // early, duplicate, or orphaned: park it
                self.out_of_sequence.insert(
                    (msg_id, fragment_num),
                    OutOfSequenceFragment {
                        data: data.to_vec(),
                        is_last,
                        received_at: Instant::now(),
                    },
                );
            }
        }
    }

    fn drain_out_of_sequence(&mut self, msg_id: u32, delivered: &mut Vec<(Delivery, Message)>) {
        loop {
            let Some(entry) = self.incomplete.get_mut(&msg_id) else {
                return;
            };
            let Some(saved) = self.out_of_sequence.remove(&(msg_id, entry.next_fragment)) else {
                return;
            };
            entry.data.extend_from_slice(&saved.data);
            entry.next_fragment += 1;
            if saved.is_last {
                self.finish(msg_id, delivered);
                return;
            }
        }
    }

    fn finish(&mut self, msg_id: u32, delivered: &mut Vec<(Delivery, Message)>) {
        let Some(entry) = self.incomplete.remove(&msg_id) else {
            return;
        };
        match Message::from_bytes(&entry.data) {
            Ok(msg) => delivered.push((entry.delivery, msg)),
            Err(err) => debug!(msg_id, %err, "reassembled tunnel message unparseable"),
        }
    }

    /// Drop partials and cached fragments past the expiration window.
    pub fn sweep(&mut self, now: Instant) {
        self.incomplete
            .retain(|_, e| now.duration_since(e.received_at) < REASSEMBLY_TIMEOUT);
        self.out_of_sequence
            .retain(|_, e| now.duration_since(e.received_at) < REASSEMBLY_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{TunnelGatewayBuffer, TunnelMessageBlock};
    use veilnet_core::MessageType;

    fn blocks_for(msg: &Message) -> Vec<[u8; 1024]> {
        let mut buffer = TunnelGatewayBuffer::new();
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Local,
            message: msg.clone(),
        });
        buffer.complete_current();
        buffer.drain()
    }

    #[test]
    fn out_of_order_blocks_reassemble() {
        let msg = Message::new(MessageType::Data, vec![0x77; 3000]);
        let blocks = blocks_for(&msg);
        assert!(blocks.len() >= 3);

        let mut endpoint = TunnelEndpoint::new(true);
        // first fragment first (it creates the entry), then the rest reversed
        let mut delivered = endpoint.process(&blocks[0]).unwrap();
        for block in blocks[1..].iter().rev() {
            delivered.extend(endpoint.process(block).unwrap());
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, msg);
    }

    #[test]
    fn follow_on_before_first_is_parked() {
        let msg = Message::new(MessageType::Data, vec![0x33; 2500]);
        let blocks = blocks_for(&msg);
        assert!(blocks.len() >= 2);

        let mut endpoint = TunnelEndpoint::new(true);
        assert!(endpoint.process(&blocks[1]).unwrap().is_empty());
        let mut delivered = Vec::new();
        delivered.extend(endpoint.process(&blocks[0]).unwrap());
        for block in &blocks[2..] {
            delivered.extend(endpoint.process(block).unwrap());
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, msg);
    }

    #[test]
    fn stale_partials_expire() {
        let msg = Message::new(MessageType::Data, vec![0x11; 3000]);
        let blocks = blocks_for(&msg);
        let mut endpoint = TunnelEndpoint::new(true);
        endpoint.process(&blocks[0]).unwrap();
        assert!(!endpoint.incomplete.is_empty());
        endpoint.sweep(Instant::now() + REASSEMBLY_TIMEOUT + Duration::from_secs(1));
        assert!(endpoint.incomplete.is_empty());
    }

    #[test]
    fn corrupt_block_rejected() {
        let msg = Message::new(MessageType::Data, vec![0x44; 100]);
        let mut blocks = blocks_for(&msg);
        blocks[0][500] ^= 0xFF;
        let mut endpoint = TunnelEndpoint::new(true);
        assert!(endpoint.process(&blocks[0]).is_err());
    }
}
