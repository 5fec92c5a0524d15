//! SSU packet framing: 16-byte truncated HMAC-MD5, 16-byte IV, then the
//! AES-CBC body (flag byte, seconds timestamp, payload). The MAC covers the
//! encrypted body, the IV, and the body length.

use std::net::IpAddr;

use rand::RngCore;

use veilnet_crypto::{cbc_decrypt, cbc_encrypt, hmac_md5_digest, AesKey, MacKey};

use crate::{Result, TransportError};

pub const SSU_HEADER_LEN: usize = 37; // mac + iv + flag + time
pub const SSU_MTU_V4: usize = 1484;
pub const SSU_MTU_V6: usize = 1472;
pub const SSU_V4_MAX_PACKET_LEN: usize = SSU_MTU_V4 - 20 - 8; // 1456
pub const SSU_V6_MAX_PACKET_LEN: usize = SSU_MTU_V6 - 40 - 8; // 1424

// payload types (flag high nibble)
pub const PAYLOAD_SESSION_REQUEST: u8 = 0;
pub const PAYLOAD_SESSION_CREATED: u8 = 1;
pub const PAYLOAD_SESSION_CONFIRMED: u8 = 2;
pub const PAYLOAD_RELAY_REQUEST: u8 = 3;
pub const PAYLOAD_RELAY_RESPONSE: u8 = 4;
pub const PAYLOAD_RELAY_INTRO: u8 = 5;
pub const PAYLOAD_DATA: u8 = 6;
pub const PAYLOAD_PEER_TEST: u8 = 7;
pub const PAYLOAD_SESSION_DESTROYED: u8 = 8;

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Assemble and encrypt one packet.
pub fn build_packet(
    payload_type: u8,
    payload: &[u8],
    aes_key: &AesKey,
    mac_key: &MacKey,
) -> Vec<u8> {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    build_packet_with_iv(payload_type, payload, aes_key, mac_key, &iv)
}

/// Same, with a caller-chosen IV (the session-created path encrypts an inner
/// section with the packet IV before wrapping).
pub fn build_packet_with_iv(
    payload_type: u8,
    payload: &[u8],
    aes_key: &AesKey,
    mac_key: &MacKey,
    iv: &[u8; 16],
) -> Vec<u8> {
    let body_len = 1 + 4 + payload.len();
    let padded = (body_len + 15) & !15;

    let mut body = Vec::with_capacity(padded);
    body.push(payload_type << 4);
    body.extend_from_slice(&now_secs().to_be_bytes());
    body.extend_from_slice(payload);
    let mut padding = vec![0u8; padded - body_len];
    rand::thread_rng().fill_bytes(&mut padding);
    body.extend_from_slice(&padding);
    cbc_encrypt(aes_key, iv, &mut body);

    let mut mac_input = Vec::with_capacity(padded + 18);
    mac_input.extend_from_slice(&body);
    mac_input.extend_from_slice(iv);
    mac_input.extend_from_slice(&(padded as u16).to_be_bytes());
    let mac = hmac_md5_digest(&mac_input, mac_key);

    let mut packet = Vec::with_capacity(32 + padded);
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(iv);
    packet.extend_from_slice(&body);
    packet
}

/// A validated, decrypted packet body.
pub struct Packet {
    pub payload_type: u8,
    pub iv: [u8; 16],
    /// Timestamp from the body (seconds).
    pub time: u32,
    /// Payload plus trailing padding.
    pub payload: Vec<u8>,
}

/// Check the MAC under `mac_key` without decrypting.
pub fn validate_packet(buf: &[u8], mac_key: &MacKey) -> bool {
    if buf.len() < SSU_HEADER_LEN || (buf.len() - 32) % 16 != 0 {
        return false;
    }
    let body = &buf[32..];
    let mut mac_input = Vec::with_capacity(body.len() + 18);
    mac_input.extend_from_slice(body);
    mac_input.extend_from_slice(&buf[16..32]);
    mac_input.extend_from_slice(&(body.len() as u16).to_be_bytes());
    let mac = hmac_md5_digest(&mac_input, mac_key);
    mac == buf[..16]
}

/// Decrypt a packet that already passed validation.
pub fn decrypt_packet(buf: &[u8], aes_key: &AesKey) -> Result<Packet> {
    if buf.len() < SSU_HEADER_LEN || (buf.len() - 32) % 16 != 0 {
        return Err(TransportError::BadFrame("ssu packet length"));
    }
    let iv: [u8; 16] = buf[16..32].try_into().expect("fixed split");
    let mut body = buf[32..].to_vec();
    cbc_decrypt(aes_key, &iv, &mut body);

    let flag = body[0];
    let time = u32::from_be_bytes(body[1..5].try_into().expect("fixed split"));
    Ok(Packet {
        payload_type: flag >> 4,
        iv,
        time,
        payload: body[5..].to_vec(),
    })
}

/// Read a 1-byte-size-prefixed IP address.
pub fn read_sized_ip(buf: &[u8]) -> Option<(Option<IpAddr>, usize)> {
    let size = *buf.first()? as usize;
    match size {
        0 => Some((None, 1)),
        4 => {
            let octets: [u8; 4] = buf.get(1..5)?.try_into().ok()?;
            Some((Some(IpAddr::from(octets)), 5))
        }
        16 => {
            let octets: [u8; 16] = buf.get(1..17)?.try_into().ok()?;
            Some((Some(IpAddr::from(octets)), 17))
        }
        _ => None,
    }
}

/// Write an IP address with its 1-byte size prefix.
pub fn write_sized_ip(out: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_roundtrip() {
        let aes = [1u8; 32];
        let mac = [2u8; 32];
        let packet = build_packet(PAYLOAD_DATA, b"fragment payload", &aes, &mac);
        assert!(validate_packet(&packet, &mac));
        let parsed = decrypt_packet(&packet, &aes).unwrap();
        assert_eq!(parsed.payload_type, PAYLOAD_DATA);
        assert_eq!(&parsed.payload[..16], b"fragment payload");
    }

    #[test]
    fn wrong_mac_key_fails_validation() {
        let aes = [1u8; 32];
        let mac = [2u8; 32];
        let packet = build_packet(PAYLOAD_DATA, b"payload", &aes, &mac);
        assert!(!validate_packet(&packet, &[3u8; 32]));
    }

    #[test]
    fn tampered_body_fails_validation() {
        let aes = [1u8; 32];
        let mac = [2u8; 32];
        let mut packet = build_packet(PAYLOAD_DATA, b"payload", &aes, &mac);
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert!(!validate_packet(&packet, &mac));
    }

    #[test]
    fn sized_ip_roundtrip() {
        let mut buf = Vec::new();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        write_sized_ip(&mut buf, &ip);
        let (parsed, consumed) = read_sized_ip(&buf).unwrap();
        assert_eq!(parsed, Some(ip));
        assert_eq!(consumed, 5);

        let mut buf6 = Vec::new();
        let ip6: IpAddr = "2001:db8::1".parse().unwrap();
        write_sized_ip(&mut buf6, &ip6);
        let (parsed6, consumed6) = read_sized_ip(&buf6).unwrap();
        assert_eq!(parsed6, Some(ip6));
        assert_eq!(consumed6, 17);
    }
}
