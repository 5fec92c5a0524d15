//! Gateway-side packing of routed messages into fixed 1024-byte tunnel data
//! blocks: greedy packing of whole messages, follow-on fragmentation for
//! messages that do not fit, and the checksum that binds each block's
//! payload to its IV.

use rand::Rng;
use rand::RngCore;
use tracing::warn;

use veilnet_core::{IdentHash, Message};
use veilnet_crypto::sha256;

use crate::TUNNEL_DATA_MAX_PAYLOAD;

/// Where the endpoint should deliver a reassembled message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Local,
    Tunnel { hash: IdentHash, tunnel_id: u32 },
    Router { hash: IdentHash },
}

/// One message handed to a gateway together with its delivery instruction.
#[derive(Clone, Debug)]
pub struct TunnelMessageBlock {
    pub delivery: Delivery,
    pub message: Message,
}

/// A finished 1024-byte block: random IV plus the 1008-byte payload
/// (checksum, nonzero padding, zero delimiter, fragments).
pub type TunnelDataBlock = [u8; 1024];

const FLAG_FOLLOW_ON: u8 = 0x80;
const FLAG_FRAGMENTED: u8 = 0x08;
const DELIVERY_SHIFT: u8 = 5;

/// flag + msg id + size, the cost of a follow-on fragment header.
const FOLLOW_ON_HEADER: usize = 7;
/// Don't bother starting a split with less room than this.
const MIN_FIRST_FRAGMENT: usize = 16;

pub struct TunnelGatewayBuffer {
    /// Fragment bytes accumulated for the block under construction.
    current: Vec<u8>,
    completed: Vec<TunnelDataBlock>,
}

impl TunnelGatewayBuffer {
    pub fn new() -> Self {
        Self {
            current: Vec::with_capacity(TUNNEL_DATA_MAX_PAYLOAD),
            completed: Vec::new(),
        }
    }

    /// Add a message, splitting into follow-on fragments as needed.
    pub fn put(&mut self, block: &TunnelMessageBlock) {
        let data = block.message.to_bytes();
        let header_len = first_fragment_header_len(&block.delivery, false);
        let whole_len = header_len + 2 + data.len();

        if self.current.len() + whole_len <= TUNNEL_DATA_MAX_PAYLOAD {
            self.write_first_fragment(&block.delivery, None, &data);
            if self.current.len() == TUNNEL_DATA_MAX_PAYLOAD {
                self.complete_current();
            }
            return;
        }

        // split: the first fragment fills the current block, follow-ons
        // take fresh blocks
        let split_header = first_fragment_header_len(&block.delivery, true);
        let mut room = TUNNEL_DATA_MAX_PAYLOAD
            .saturating_sub(self.current.len() + split_header + 2);
        if room < MIN_FIRST_FRAGMENT {
            self.complete_current();
            room = TUNNEL_DATA_MAX_PAYLOAD - split_header - 2;
        }
        let first_len = room.min(data.len());
        let msg_id = block.message.msg_id;
        self.write_first_fragment(&block.delivery, Some(msg_id), &data[..first_len]);
        self.complete_current();

        let mut offset = first_len;
        let mut fragment_num: u8 = 1;
        while offset < data.len() {
            if fragment_num > 0x3F {
                // follow-on numbering is 6 bits; nothing routed should get
                // near this with the 64 KiB message cap
                warn!(msg_id, "message exceeds the fragment numbering space, truncated");
                break;
            }
            let room = TUNNEL_DATA_MAX_PAYLOAD - FOLLOW_ON_HEADER;
            let len = room.min(data.len() - offset);
            let is_last = offset + len == data.len();
            self.current
                .push(FLAG_FOLLOW_ON | (fragment_num << 1) | u8::from(is_last));
            self.current.extend_from_slice(&msg_id.to_be_bytes());
            self.current.extend_from_slice(&(len as u16).to_be_bytes());
            self.current.extend_from_slice(&data[offset..offset + len]);
            offset += len;
            fragment_num += 1;
            if !is_last || self.current.len() == TUNNEL_DATA_MAX_PAYLOAD {
                self.complete_current();
            }
        }
    }

    fn write_first_fragment(&mut self, delivery: &Delivery, msg_id: Option<u32>, data: &[u8]) {
        let mut flag = match delivery {
            Delivery::Local => 0,
            Delivery::Tunnel { .. } => 1 << DELIVERY_SHIFT,
            Delivery::Router { .. } => 2 << DELIVERY_SHIFT,
        };
        if msg_id.is_some() {
            flag |= FLAG_FRAGMENTED;
        }
        self.current.push(flag);
        match delivery {
            Delivery::Local => {}
            Delivery::Tunnel { hash, tunnel_id } => {
                self.current.extend_from_slice(&tunnel_id.to_be_bytes());
                self.current.extend_from_slice(hash.as_bytes());
            }
            Delivery::Router { hash } => {
                self.current.extend_from_slice(hash.as_bytes());
            }
        }
        if let Some(msg_id) = msg_id {
            self.current.extend_from_slice(&msg_id.to_be_bytes());
        }
        self.current
            .extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.current.extend_from_slice(data);
    }

    /// Seal the block under construction, if any.
    pub fn complete_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let fragments = std::mem::take(&mut self.current);
        let mut block = [0u8; 1024];
        let mut rng = rand::thread_rng();
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);
        block[..16].copy_from_slice(&iv);

        // checksum binds fragments to the IV
        let mut checksummed = Vec::with_capacity(fragments.len() + 16);
        checksummed.extend_from_slice(&fragments);
        checksummed.extend_from_slice(&iv);
        let digest = sha256(&checksummed);
        block[16..20].copy_from_slice(&digest[..4]);

        // nonzero padding, zero delimiter, fragments flush against the end
        let padding_len = 1008 - 4 - 1 - fragments.len();
        for byte in &mut block[20..20 + padding_len] {
            *byte = rng.gen_range(1..=u8::MAX);
        }
        block[20 + padding_len] = 0;
        block[21 + padding_len..].copy_from_slice(&fragments);
        self.completed.push(block);
    }

    /// Take the finished blocks.
    pub fn drain(&mut self) -> Vec<TunnelDataBlock> {
        std::mem::take(&mut self.completed)
    }

    pub fn has_partial(&self) -> bool {
        !self.current.is_empty()
    }
}

impl Default for TunnelGatewayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn first_fragment_header_len(delivery: &Delivery, fragmented: bool) -> usize {
    let delivery_len = match delivery {
        Delivery::Local => 0,
        Delivery::Tunnel { .. } => 36,
        Delivery::Router { .. } => 32,
    };
    1 + delivery_len + if fragmented { 4 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TunnelEndpoint;
    use veilnet_core::MessageType;

    fn deliver_all(blocks: &[TunnelDataBlock]) -> Vec<(Delivery, Message)> {
        let mut endpoint = TunnelEndpoint::new(true);
        let mut out = Vec::new();
        for block in blocks {
            out.extend(endpoint.process(block).unwrap());
        }
        out
    }

    #[test]
    fn small_message_packs_into_one_block() {
        let mut buffer = TunnelGatewayBuffer::new();
        let msg = Message::new(MessageType::Data, vec![0xAA; 200]);
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Local,
            message: msg.clone(),
        });
        buffer.complete_current();
        let blocks = buffer.drain();
        assert_eq!(blocks.len(), 1);

        let delivered = deliver_all(&blocks);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, Delivery::Local);
        assert_eq!(delivered[0].1, msg);
    }

    #[test]
    fn two_messages_share_a_block() {
        let mut buffer = TunnelGatewayBuffer::new();
        for len in [100usize, 150] {
            buffer.put(&TunnelMessageBlock {
                delivery: Delivery::Local,
                message: Message::new(MessageType::Data, vec![1; len]),
            });
        }
        buffer.complete_current();
        let blocks = buffer.drain();
        assert_eq!(blocks.len(), 1);
        assert_eq!(deliver_all(&blocks).len(), 2);
    }

    #[test]
    fn large_message_fragments_and_reassembles() {
        let mut buffer = TunnelGatewayBuffer::new();
        let msg = Message::new(MessageType::Data, vec![0x5C; 4000]);
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Router {
                hash: IdentHash([8u8; 32]),
            },
            message: msg.clone(),
        });
        buffer.complete_current();
        let blocks = buffer.drain();
        assert!(blocks.len() >= 4);

        let delivered = deliver_all(&blocks);
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].0,
            Delivery::Router {
                hash: IdentHash([8u8; 32])
            }
        );
        assert_eq!(delivered[0].1, msg);
    }

    #[test]
    fn tunnel_delivery_carries_target() {
        let mut buffer = TunnelGatewayBuffer::new();
        let msg = Message::new(MessageType::Data, vec![3; 64]);
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Tunnel {
                hash: IdentHash([4u8; 32]),
                tunnel_id: 0xCAFE,
            },
            message: msg,
        });
        buffer.complete_current();
        let delivered = deliver_all(&buffer.drain());
        assert_eq!(
            delivered[0].0,
            Delivery::Tunnel {
                hash: IdentHash([4u8; 32]),
                tunnel_id: 0xCAFE
            }
        );
    }

    #[test]
    fn checksum_covers_iv() {
        let mut buffer = TunnelGatewayBuffer::new();
        buffer.put(&TunnelMessageBlock {
            delivery: Delivery::Local,
            message: Message::new(MessageType::Data, vec![1; 32]),
        });
        buffer.complete_current();
        let mut block = buffer.drain().remove(0);
        // flip an IV bit: the endpoint must reject the block
        block[0] ^= 0x01;
        let mut endpoint = TunnelEndpoint::new(true);
        assert!(endpoint.process(&block).is_err());
    }
}
