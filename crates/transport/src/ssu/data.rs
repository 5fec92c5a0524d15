//! SSU reliability layer: fragments outbound messages to the negotiated
//! packet size, retains them for resend until acknowledged, reassembles
//! inbound fragments (out-of-order tolerated), and emits acknowledgements.
//!
//! All state here belongs to one session and is driven entirely by the
//! server task; resend, dedup decay, and incomplete-message cleanup run off
//! separate deadlines (the resend and decay schedules are deliberately
//! independent).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use veilnet_core::Message;

use crate::ssu::packet::{build_packet, PAYLOAD_DATA, SSU_HEADER_LEN};
use crate::ssu::SessionKeys;

// data flag bits
pub const DATA_FLAG_EXTENDED_DATA: u8 = 0x02;
pub const DATA_FLAG_WANT_REPLY: u8 = 0x04;
pub const DATA_FLAG_ECN: u8 = 0x10;
pub const DATA_FLAG_ACK_BITFIELDS: u8 = 0x40;
pub const DATA_FLAG_EXPLICIT_ACKS: u8 = 0x80;

/// Fragment header: message id + 3-byte fragment info.
const FRAGMENT_OVERHEAD: usize = 9; // flag + count + msgID + fragment info

const RESEND_INTERVAL: Duration = Duration::from_secs(3);
const MAX_RESENDS: u32 = 5;
const INCOMPLETE_TIMEOUT: Duration = Duration::from_secs(10);
const DECAY_INTERVAL: Duration = Duration::from_secs(20);
const MAX_RECEIVED_MESSAGES: usize = 1000;
/// Fragments never exceed 7 bits of numbering.
const MAX_FRAGMENT_NUM: u8 = 127;

struct SentMessage {
    /// Wire-ready packets; acknowledged fragments are cleared.
    fragments: Vec<Option<Vec<u8>>>,
    next_resend: Instant,
    resends: u32,
}

struct SavedFragment {
    data: Vec<u8>,
    is_last: bool,
}

struct IncompleteMessage {
    data: Vec<u8>,
    next_fragment: u8,
    saved: BTreeMap<u8, SavedFragment>,
    last_insert: Instant,
    received_fragments: Vec<u8>,
}

pub struct SsuData {
    packet_size: usize,
    sent: HashMap<u32, SentMessage>,
    incomplete: HashMap<u32, IncompleteMessage>,
    received: HashSet<u32>,
    decay_at: Option<Instant>,
}

impl SsuData {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            packet_size: max_packet_size,
            sent: HashMap::new(),
            incomplete: HashMap::new(),
            received: HashSet::new(),
            decay_at: None,
        }
    }

    /// Clamp to the peer's advertised MTU, keeping packets block-aligned.
    pub fn adjust_packet_size(&mut self, mtu: usize, overhead: usize, max_packet_size: usize) {
        let size = mtu.saturating_sub(overhead) & !15;
        if size > SSU_HEADER_LEN + FRAGMENT_OVERHEAD {
            self.packet_size = size.min(max_packet_size);
            debug!(mtu, packet_size = self.packet_size, "adjusted SSU packet size");
        }
    }

    /// Fragment, retain for resend, and return the wire packets to emit now.
    pub fn send(&mut self, msg: &Message, keys: &SessionKeys) -> Vec<Vec<u8>> {
        let msg_id = msg.msg_id;
        if self.sent.contains_key(&msg_id) {
            warn!(msg_id, "message already in flight, dropping duplicate send");
            return Vec::new();
        }
        let data = msg.to_bytes();
        let payload_size = self.packet_size - SSU_HEADER_LEN - FRAGMENT_OVERHEAD;
        let mut packets = Vec::new();
        let mut offset = 0usize;
        let mut fragment_num = 0u8;
        while offset < data.len() {
            let remaining = data.len() - offset;
            let is_last = remaining <= payload_size;
            let size = remaining.min(payload_size);

            let mut payload = Vec::with_capacity(FRAGMENT_OVERHEAD + size);
            payload.push(DATA_FLAG_WANT_REPLY);
            payload.push(1); // one fragment per packet
            payload.extend_from_slice(&msg_id.to_be_bytes());
            payload.push((fragment_num << 1) | u8::from(is_last));
            payload.extend_from_slice(&(size as u16).to_be_bytes());
            payload.extend_from_slice(&data[offset..offset + size]);

            packets.push(build_packet(
                PAYLOAD_DATA,
                &payload,
                &keys.session_key,
                &keys.mac_key,
            ));
            offset += size;
            if fragment_num == MAX_FRAGMENT_NUM && offset < data.len() {
                warn!(msg_id, "message needs more than 128 fragments, truncated");
                return Vec::new();
            }
            fragment_num = fragment_num.wrapping_add(1);
        }

        self.sent.insert(
            msg_id,
            SentMessage {
                fragments: packets.iter().cloned().map(Some).collect(),
                next_resend: Instant::now() + RESEND_INTERVAL,
                resends: 0,
            },
        );
        packets
    }

    /// Process a decrypted data payload. Returns (ack packets to send,
    /// completed messages to deliver).
    pub fn process(
        &mut self,
        payload: &[u8],
        keys: &SessionKeys,
    ) -> (Vec<Vec<u8>>, Vec<Message>) {
        let mut acks = Vec::new();
        let mut completed = Vec::new();
        let Some((&flag, mut rest)) = payload.split_first() else {
            return (acks, completed);
        };

        if flag & (DATA_FLAG_EXPLICIT_ACKS | DATA_FLAG_ACK_BITFIELDS) != 0 {
            rest = self.process_acks(rest, flag);
        }
        if flag & DATA_FLAG_EXTENDED_DATA != 0 {
            if let Some((&size, after)) = rest.split_first() {
                rest = after.get(size as usize..).unwrap_or(&[]);
            } else {
                return (acks, completed);
            }
        }
        self.process_fragments(rest, keys, &mut acks, &mut completed);
        (acks, completed)
    }

    fn process_acks<'a>(&mut self, mut buf: &'a [u8], flag: u8) -> &'a [u8] {
        if flag & DATA_FLAG_EXPLICIT_ACKS != 0 {
            let Some((&num, rest)) = buf.split_first() else {
                return &[];
            };
            buf = rest;
            for _ in 0..num {
                let Some(id_bytes) = buf.get(..4) else {
                    return &[];
                };
                let msg_id = u32::from_be_bytes(id_bytes.try_into().expect("fixed split"));
                self.sent.remove(&msg_id);
                buf = &buf[4..];
            }
        }
        if flag & DATA_FLAG_ACK_BITFIELDS != 0 {
            let Some((&num, rest)) = buf.split_first() else {
                return &[];
            };
            buf = rest;
            for _ in 0..num {
                let Some(id_bytes) = buf.get(..4) else {
                    return &[];
                };
                let msg_id = u32::from_be_bytes(id_bytes.try_into().expect("fixed split"));
                buf = &buf[4..];
                let mut fragment = 0usize;
                loop {
                    let Some((&bitfield, rest)) = buf.split_first() else {
                        return &[];
                    };
                    buf = rest;
                    if let Some(sent) = self.sent.get_mut(&msg_id) {
                        for bit in 0..7 {
                            if bitfield & (1 << bit) != 0 {
                                if let Some(slot) = sent.fragments.get_mut(fragment) {
                                    *slot = None;
                                }
                            }
                            fragment += 1;
                        }
                    } else {
                        fragment += 7;
                    }
                    if bitfield & 0x80 == 0 {
                        break;
                    }
                }
                let fully_acked = self
                    .sent
                    .get(&msg_id)
                    .map(|sent| sent.fragments.iter().all(Option::is_none))
                    .unwrap_or(false);
                if fully_acked {
                    self.sent.remove(&msg_id);
                }
            }
        }
        buf
    }

    fn process_fragments(
        &mut self,
        buf: &[u8],
        keys: &SessionKeys,
        acks: &mut Vec<Vec<u8>>,
        completed: &mut Vec<Message>,
    ) {
        let Some((&num_fragments, mut rest)) = buf.split_first() else {
            return;
        };
        for _ in 0..num_fragments {
            if rest.len() < 7 {
                return;
            }
            let msg_id = u32::from_be_bytes(rest[..4].try_into().expect("fixed split"));
            let info = rest[4];
            let fragment_num = info >> 1;
            let is_last = info & 0x01 != 0;
            let size = u16::from_be_bytes([rest[5], rest[6]]) as usize;
            rest = &rest[7..];
            if rest.len() < size {
                warn!(msg_id, size, "fragment size exceeds packet");
                return;
            }
            let fragment = &rest[..size];
            rest = &rest[size..];

            if self.received.contains(&msg_id) {
                // already delivered; re-ack so the sender stops resending
                acks.push(self.explicit_ack(msg_id, keys));
                continue;
            }
            if let Some((msg, fragment_count)) =
                self.accept_fragment(msg_id, fragment_num, is_last, fragment)
            {
                acks.push(completion_ack(msg_id, fragment_count, keys));
                self.remember_received(msg_id);
                match Message::from_bytes(&msg) {
                    Ok(parsed) => completed.push(parsed),
                    Err(err) => debug!(msg_id, %err, "reassembled SSU message unparseable"),
                }
            }
        }
    }

    /// Attach one inbound fragment; returns the full message bytes and the
    /// fragment count when the last consecutive fragment lands.
    fn accept_fragment(
        &mut self,
        msg_id: u32,
        fragment_num: u8,
        is_last: bool,
        fragment: &[u8],
    ) -> Option<(Vec<u8>, u8)> {
        let entry = self.incomplete.entry(msg_id).or_insert_with(|| IncompleteMessage {
            data: Vec::new(),
            next_fragment: 0,
            saved: BTreeMap::new(),
            last_insert: Instant::now(),
            received_fragments: Vec::new(),
        });
        entry.last_insert = Instant::now();

        let mut last_seen = false;
        if fragment_num == entry.next_fragment {
            entry.data.extend_from_slice(fragment);
            entry.received_fragments.push(fragment_num);
            entry.next_fragment += 1;
            last_seen = is_last;
            // drain any now-consecutive saved fragments
            while !last_seen {
                let Some(saved) = entry.saved.remove(&entry.next_fragment) else {
                    break;
                };
                entry.data.extend_from_slice(&saved.data);
                entry.received_fragments.push(entry.next_fragment);
                entry.next_fragment += 1;
                last_seen = saved.is_last;
            }
        } else if fragment_num < entry.next_fragment {
            trace!(msg_id, fragment_num, "duplicate fragment ignored");
        } else {
            trace!(msg_id, fragment_num, "out-of-order fragment saved");
            entry.saved.insert(
                fragment_num,
                SavedFragment {
                    data: fragment.to_vec(),
                    is_last,
                },
            );
        }

        if last_seen {
            let done = self.incomplete.remove(&msg_id).expect("entry exists");
            let count = done.received_fragments.len().min(u8::MAX as usize) as u8;
            Some((done.data, count))
        } else {
            None
        }
    }

    fn explicit_ack(&self, msg_id: u32, keys: &SessionKeys) -> Vec<u8> {
        let mut payload = Vec::with_capacity(7);
        payload.push(DATA_FLAG_EXPLICIT_ACKS);
        payload.push(1);
        payload.extend_from_slice(&msg_id.to_be_bytes());
        payload.push(0);
        build_packet(PAYLOAD_DATA, &payload, &keys.session_key, &keys.mac_key)
    }

    fn remember_received(&mut self, msg_id: u32) {
        if self.received.len() >= MAX_RECEIVED_MESSAGES {
            self.received.clear();
        }
        self.received.insert(msg_id);
        if self.decay_at.is_none() {
            self.decay_at = Some(Instant::now() + DECAY_INTERVAL);
        }
    }

    /// Packets due for retransmission. Messages past the resend budget are
    /// dropped.
    pub fn resend_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.sent.retain(|msg_id, sent| {
            if now < sent.next_resend {
                return true;
            }
            if sent.resends >= MAX_RESENDS {
                warn!(msg_id, "message unacked after {} resends, dropped", MAX_RESENDS);
                return false;
            }
            for fragment in sent.fragments.iter().flatten() {
                out.push(fragment.clone());
            }
            sent.resends += 1;
            sent.next_resend = now + RESEND_INTERVAL * sent.resends;
            true
        });
        out
    }

    /// Periodic sweep: expire stale partial messages and decay the dedup set.
    pub fn sweep(&mut self, now: Instant) {
        self.incomplete.retain(|msg_id, entry| {
            let keep = now.duration_since(entry.last_insert) < INCOMPLETE_TIMEOUT;
            if !keep {
                debug!(msg_id, "incomplete SSU message expired");
            }
            keep
        });
        if let Some(decay_at) = self.decay_at {
            if now >= decay_at {
                self.received.clear();
                self.decay_at = None;
            }
        }
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.sent.is_empty()
    }
}

/// Single completion ack: explicit ack for the message plus the full
/// fragment bitfield, in one frame.
fn completion_ack(msg_id: u32, fragment_count: u8, keys: &SessionKeys) -> Vec<u8> {
    let count = fragment_count.max(1) as usize;
    let mut payload = Vec::with_capacity(16 + count / 7);
    payload.push(DATA_FLAG_EXPLICIT_ACKS | DATA_FLAG_ACK_BITFIELDS);
    // explicit acks
    payload.push(1);
    payload.extend_from_slice(&msg_id.to_be_bytes());
    // one bitfield run covering every received fragment
    payload.push(1);
    payload.extend_from_slice(&msg_id.to_be_bytes());
    let full_bytes = count / 7;
    let rem = count % 7;
    for i in 0..full_bytes {
        let continuation = if rem > 0 || i + 1 < full_bytes { 0x80 } else { 0 };
        payload.push(continuation | 0x7F);
    }
    if rem > 0 {
        payload.push((1u8 << rem) - 1);
    }
    payload.push(0); // no fragments follow
    build_packet(PAYLOAD_DATA, &payload, &keys.session_key, &keys.mac_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssu::packet::{decrypt_packet, validate_packet, SSU_V4_MAX_PACKET_LEN};
    use veilnet_core::MessageType;

    fn keys() -> SessionKeys {
        SessionKeys {
            session_key: [5u8; 32],
            mac_key: [6u8; 32],
        }
    }

    fn roundtrip_payload(packet: &[u8], keys: &SessionKeys) -> Vec<u8> {
        assert!(validate_packet(packet, &keys.mac_key));
        decrypt_packet(packet, &keys.session_key).unwrap().payload
    }

    #[test]
    fn small_message_is_single_fragment() {
        let keys = keys();
        let mut data = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let msg = Message::new(MessageType::Data, vec![7u8; 100]);
        let packets = data.send(&msg, &keys);
        assert_eq!(packets.len(), 1);
        assert!(data.has_pending_sends());
    }

    #[test]
    fn reassembly_out_of_order() {
        let keys = keys();
        let mut sender = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let mut receiver = SsuData::new(SSU_V4_MAX_PACKET_LEN);

        let msg = Message::new(MessageType::Data, vec![0x5A; 3500]);
        let packets = sender.send(&msg, &keys);
        assert_eq!(packets.len(), 3);

        // deliver in order [2, 0, 1]
        let mut completed = Vec::new();
        let mut acks = Vec::new();
        for index in [2usize, 0, 1] {
            let payload = roundtrip_payload(&packets[index], &keys);
            let (a, c) = receiver.process(&payload, &keys);
            acks.extend(a);
            completed.extend(c);
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0], msg);
        // exactly one ack frame, carrying all three fragment numbers
        assert_eq!(acks.len(), 1);
        let ack_payload = roundtrip_payload(&acks[0], &keys);
        assert_eq!(
            ack_payload[0] & (DATA_FLAG_EXPLICIT_ACKS | DATA_FLAG_ACK_BITFIELDS),
            DATA_FLAG_EXPLICIT_ACKS | DATA_FLAG_ACK_BITFIELDS
        );
        // bitfield section: count=1, msg id, one byte with bits 0..2 set
        let bitfield = ack_payload[11];
        assert_eq!(bitfield & 0x7F, 0b0000_0111);
    }

    #[test]
    fn ack_clears_pending_send() {
        let keys = keys();
        let mut sender = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let mut receiver = SsuData::new(SSU_V4_MAX_PACKET_LEN);

        let msg = Message::new(MessageType::Data, vec![1u8; 2000]);
        let packets = sender.send(&msg, &keys);
        let mut acks = Vec::new();
        for packet in &packets {
            let payload = roundtrip_payload(packet, &keys);
            let (a, _) = receiver.process(&payload, &keys);
            acks.extend(a);
        }
        assert_eq!(acks.len(), 1);
        let ack_payload = roundtrip_payload(&acks[0], &keys);
        let (_, none) = sender.process(&ack_payload, &keys);
        assert!(none.is_empty());
        assert!(!sender.has_pending_sends());
    }

    #[test]
    fn duplicate_delivery_suppressed() {
        let keys = keys();
        let mut sender = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let mut receiver = SsuData::new(SSU_V4_MAX_PACKET_LEN);

        let msg = Message::new(MessageType::Data, vec![2u8; 64]);
        let packets = sender.send(&msg, &keys);
        let payload = roundtrip_payload(&packets[0], &keys);
        let (_, first) = receiver.process(&payload, &keys);
        assert_eq!(first.len(), 1);
        let (re_acks, second) = receiver.process(&payload, &keys);
        assert!(second.is_empty());
        // duplicate still triggers a re-ack so the sender stops retrying
        assert_eq!(re_acks.len(), 1);
    }

    #[test]
    fn resend_until_budget_exhausted() {
        let keys = keys();
        let mut sender = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let msg = Message::new(MessageType::Data, vec![3u8; 256]);
        let _ = sender.send(&msg, &keys);

        let mut t = Instant::now();
        let mut resends = 0;
        for _ in 0..16 {
            t += RESEND_INTERVAL * 6;
            let due = sender.resend_due(t);
            if due.is_empty() && !sender.has_pending_sends() {
                break;
            }
            if !due.is_empty() {
                resends += 1;
            }
        }
        assert_eq!(resends, MAX_RESENDS as usize);
        assert!(!sender.has_pending_sends());
    }

    #[test]
    fn stale_incomplete_swept() {
        let keys = keys();
        let mut sender = SsuData::new(SSU_V4_MAX_PACKET_LEN);
        let mut receiver = SsuData::new(SSU_V4_MAX_PACKET_LEN);

        let msg = Message::new(MessageType::Data, vec![4u8; 3000]);
        let packets = sender.send(&msg, &keys);
        let payload = roundtrip_payload(&packets[0], &keys);
        let _ = receiver.process(&payload, &keys);
        assert!(!receiver.incomplete.is_empty());
        receiver.sweep(Instant::now() + INCOMPLETE_TIMEOUT + Duration::from_secs(1));
        assert!(receiver.incomplete.is_empty());
    }
}
