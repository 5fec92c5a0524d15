//! Tunnel build records: the ElGamal-encrypted per-hop instructions, the
//! reply layers each hop adds, and both sides of the exchange (originator
//! assembly and verification, hop processing).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::{debug, warn};

use veilnet_core::{IdentHash, RouterContext};
use veilnet_crypto::{cbc_decrypt, cbc_encrypt, elgamal_encrypt, sha256};

use crate::hop::TunnelConfig;
use crate::{Result, TunnelError};

pub const BUILD_RECORD_LEN: usize = 528;
pub const BUILD_RECORD_CLEAR_LEN: usize = 222;

/// Accept verdict in a build response.
pub const BUILD_RET_ACCEPT: u8 = 0;
/// Reject: bandwidth/limit refusal.
pub const BUILD_RET_REJECT: u8 = 30;

// clear-text record offsets
const RECEIVE_TUNNEL: usize = 0;
const OUR_IDENT: usize = 4;
const NEXT_TUNNEL: usize = 36;
const NEXT_IDENT: usize = 40;
const LAYER_KEY: usize = 72;
const IV_KEY: usize = 104;
const REPLY_KEY: usize = 136;
const REPLY_IV: usize = 168;
const FLAG: usize = 184;
const REQUEST_TIME: usize = 185;
const SEND_MSG_ID: usize = 189;
const PADDING: usize = 193;

// encrypted record layout
const TO_PEER: usize = 0;
const ENCRYPTED: usize = 16;

// response record layout
const RESPONSE_HASH: usize = 0;
const RESPONSE_PADDING: usize = 32;
const RESPONSE_PADDING_LEN: usize = 495;
const RESPONSE_RET: usize = RESPONSE_PADDING + RESPONSE_PADDING_LEN;

const FLAG_GATEWAY: u8 = 0x80;
const FLAG_ENDPOINT: u8 = 0x40;

fn hours_since_epoch() -> u32 {
    (SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 3600) as u32
}

/// Build the VariableTunnelBuild payload for a tunnel: record count, then
/// one ElGamal record per hop, with the originator's pre-decryption of later
/// hops' records so each hop's reply layer cancels out on the way back.
pub fn build_request_payload(config: &TunnelConfig, reply_msg_id: u32) -> Result<Vec<u8>> {
    let num = config.len();
    if num == 0 {
        return Err(TunnelError::EmptyTunnel);
    }
    let mut payload = vec![0u8; 1 + num * BUILD_RECORD_LEN];
    payload[0] = num as u8;
    for hop in config.hops() {
        let record =
            &mut payload[1 + hop.record_index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
        fill_record(record, config, hop.record_index, reply_msg_id)?;
    }

    // pre-decrypt: hop i re-encrypts every record with its reply key, so
    // records for hops after i must start one layer "down"
    for (i, hop) in config.hops().iter().enumerate() {
        for later in config.hops().iter().skip(i + 1) {
            let record =
                &mut payload[1 + later.record_index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
            cbc_decrypt(&hop.reply_key, &hop.reply_iv, record);
        }
    }
    Ok(payload)
}

fn fill_record(
    record: &mut [u8],
    config: &TunnelConfig,
    index: usize,
    reply_msg_id: u32,
) -> Result<()> {
    let hop = &config.hops()[index];
    let mut clear = [0u8; BUILD_RECORD_CLEAR_LEN];
    clear[RECEIVE_TUNNEL..RECEIVE_TUNNEL + 4].copy_from_slice(&hop.tunnel_id.to_be_bytes());
    clear[OUR_IDENT..OUR_IDENT + 32].copy_from_slice(hop.router.ident_hash().as_bytes());
    clear[NEXT_TUNNEL..NEXT_TUNNEL + 4].copy_from_slice(&hop.next_tunnel_id.to_be_bytes());
    clear[NEXT_IDENT..NEXT_IDENT + 32].copy_from_slice(hop.next_ident.as_bytes());
    clear[LAYER_KEY..LAYER_KEY + 32].copy_from_slice(&hop.layer_key);
    clear[IV_KEY..IV_KEY + 32].copy_from_slice(&hop.iv_key);
    clear[REPLY_KEY..REPLY_KEY + 32].copy_from_slice(&hop.reply_key);
    clear[REPLY_IV..REPLY_IV + 16].copy_from_slice(&hop.reply_iv);
    let mut flag = 0u8;
    if hop.is_gateway {
        flag |= FLAG_GATEWAY;
    }
    if hop.is_endpoint {
        flag |= FLAG_ENDPOINT;
    }
    clear[FLAG] = flag;
    clear[REQUEST_TIME..REQUEST_TIME + 4].copy_from_slice(&hours_since_epoch().to_be_bytes());
    clear[SEND_MSG_ID..SEND_MSG_ID + 4].copy_from_slice(&reply_msg_id.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut clear[PADDING..]);

    record[TO_PEER..TO_PEER + 16].copy_from_slice(&hop.router.ident_hash().as_bytes()[..16]);
    elgamal_encrypt(
        hop.router.identity().public_key(),
        &clear,
        &mut record[ENCRYPTED..],
        false,
    )?;
    Ok(())
}

/// Originator side: peel every hop's reply layer off the returned records
/// and collect the verdicts. All must be zero for the tunnel to establish.
pub fn process_build_reply(config: &TunnelConfig, payload: &[u8]) -> Result<Vec<u8>> {
    let num = *payload.first().ok_or(TunnelError::MalformedBuild)? as usize;
    if payload.len() < 1 + num * BUILD_RECORD_LEN || num < config.len() {
        return Err(TunnelError::MalformedBuild);
    }
    let mut records = payload[1..1 + num * BUILD_RECORD_LEN].to_vec();

    // record i was stamped at hop i and re-encrypted by every later hop, so
    // each outer layer covers the records of hops at or before it
    for (k, outer) in config.hops().iter().enumerate().rev() {
        for inner in &config.hops()[..=k] {
            let record = &mut records[inner.record_index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
            cbc_decrypt(&outer.reply_key, &outer.reply_iv, record);
        }
    }

    let mut verdicts = Vec::with_capacity(config.len());
    for hop in config.hops() {
        let record = &records[hop.record_index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
        let digest = sha256(&record[RESPONSE_PADDING..]);
        if digest != record[RESPONSE_HASH..RESPONSE_HASH + 32] {
            warn!(record = hop.record_index, "build response hash mismatch");
            return Err(TunnelError::MalformedBuild);
        }
        verdicts.push(record[RESPONSE_RET]);
    }
    Ok(verdicts)
}

/// A hop's view of the clear-text build request addressed to it.
pub struct BuildRequest {
    pub receive_tunnel_id: u32,
    pub next_tunnel_id: u32,
    pub next_ident: IdentHash,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub is_gateway: bool,
    pub is_endpoint: bool,
    pub send_msg_id: u32,
}

/// Hop side: find our record, decrypt it, stamp the verdict, and re-encrypt
/// every record with our reply key. Returns the parsed request and the
/// updated payload to forward.
pub fn process_build_request(
    ctx: &RouterContext,
    payload: &[u8],
    accept: bool,
) -> Result<Option<(BuildRequest, Vec<u8>)>> {
    let num = *payload.first().ok_or(TunnelError::MalformedBuild)? as usize;
    if num == 0 || payload.len() < 1 + num * BUILD_RECORD_LEN {
        return Err(TunnelError::MalformedBuild);
    }
    let mut records = payload[1..1 + num * BUILD_RECORD_LEN].to_vec();
    let our_ident = ctx.ident_hash();
    let our_prefix = &our_ident.as_bytes()[..16];

    let mut ours: Option<(usize, BuildRequest, [u8; 32], [u8; 16])> = None;
    for index in 0..num {
        let record = &records[index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
        if &record[TO_PEER..TO_PEER + 16] != our_prefix {
            continue;
        }
        let clear = match ctx.decrypt_tunnel_build_record(&record[ENCRYPTED..]) {
            Ok(clear) => clear,
            Err(err) => {
                debug!(%err, "tunnel build record undecryptable");
                return Err(TunnelError::MalformedBuild);
            }
        };
        let request = BuildRequest {
            receive_tunnel_id: u32::from_be_bytes(
                clear[RECEIVE_TUNNEL..RECEIVE_TUNNEL + 4]
                    .try_into()
                    .expect("fixed split"),
            ),
            next_tunnel_id: u32::from_be_bytes(
                clear[NEXT_TUNNEL..NEXT_TUNNEL + 4]
                    .try_into()
                    .expect("fixed split"),
            ),
            next_ident: IdentHash::from_bytes(&clear[NEXT_IDENT..NEXT_IDENT + 32])
                .expect("fixed length"),
            layer_key: clear[LAYER_KEY..LAYER_KEY + 32]
                .try_into()
                .expect("fixed split"),
            iv_key: clear[IV_KEY..IV_KEY + 32].try_into().expect("fixed split"),
            is_gateway: clear[FLAG] & FLAG_GATEWAY != 0,
            is_endpoint: clear[FLAG] & FLAG_ENDPOINT != 0,
            send_msg_id: u32::from_be_bytes(
                clear[SEND_MSG_ID..SEND_MSG_ID + 4]
                    .try_into()
                    .expect("fixed split"),
            ),
        };
        let reply_key: [u8; 32] = clear[REPLY_KEY..REPLY_KEY + 32]
            .try_into()
            .expect("fixed split");
        let reply_iv: [u8; 16] = clear[REPLY_IV..REPLY_IV + 16]
            .try_into()
            .expect("fixed split");
        ours = Some((index, request, reply_key, reply_iv));
        break;
    }

    let Some((index, request, reply_key, reply_iv)) = ours else {
        return Ok(None);
    };

    // replace our record with the response
    {
        let record = &mut records[index * BUILD_RECORD_LEN..][..BUILD_RECORD_LEN];
        rand::thread_rng().fill_bytes(&mut record[RESPONSE_PADDING..RESPONSE_RET]);
        record[RESPONSE_RET] = if accept { BUILD_RET_ACCEPT } else { BUILD_RET_REJECT };
        let digest = sha256(&record[RESPONSE_PADDING..]);
        record[RESPONSE_HASH..RESPONSE_HASH + 32].copy_from_slice(&digest);
    }
    // add our reply layer over every record
    for record in records.chunks_exact_mut(BUILD_RECORD_LEN) {
        cbc_encrypt(&reply_key, &reply_iv, record);
    }

    let mut forwarded = Vec::with_capacity(payload.len());
    forwarded.push(num as u8);
    forwarded.extend_from_slice(&records);
    Ok(Some((request, forwarded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::TunnelConfig;
    use veilnet_core::RouterInfo;

    #[test]
    fn record_layout_constants() {
        assert_eq!(PADDING + 29, BUILD_RECORD_CLEAR_LEN);
        assert_eq!(RESPONSE_RET, 527);
        assert_eq!(ENCRYPTED + 512, BUILD_RECORD_LEN);
    }

    #[test]
    fn single_hop_roundtrip_accept() {
        // a one-hop inbound tunnel: build, process at the hop, verify reply
        let hop_ctx = RouterContext::ephemeral().unwrap();
        let mut hop_ri = RouterInfo::new(hop_ctx.keys().identity().clone());
        hop_ri.sign(hop_ctx.keys()).unwrap();

        let us = IdentHash([1u8; 32]);
        let config = TunnelConfig::inbound(vec![hop_ri], us);
        let reply_msg_id = 0xABCD;
        let payload = build_request_payload(&config, reply_msg_id).unwrap();

        let (request, forwarded) = process_build_request(&hop_ctx, &payload, true)
            .unwrap()
            .expect("record addressed to hop");
        assert_eq!(request.receive_tunnel_id, config.first_hop().tunnel_id);
        assert_eq!(request.next_ident, us);
        assert_eq!(request.send_msg_id, reply_msg_id);
        assert!(request.is_gateway);
        assert!(!request.is_endpoint);

        let verdicts = process_build_reply(&config, &forwarded).unwrap();
        assert_eq!(verdicts, vec![BUILD_RET_ACCEPT]);
    }

    #[test]
    fn two_hop_roundtrip_with_reject() {
        let hop1_ctx = RouterContext::ephemeral().unwrap();
        let mut hop1_ri = RouterInfo::new(hop1_ctx.keys().identity().clone());
        hop1_ri.sign(hop1_ctx.keys()).unwrap();
        let hop2_ctx = RouterContext::ephemeral().unwrap();
        let mut hop2_ri = RouterInfo::new(hop2_ctx.keys().identity().clone());
        hop2_ri.sign(hop2_ctx.keys()).unwrap();

        let config = TunnelConfig::outbound(vec![hop1_ri, hop2_ri], IdentHash([2u8; 32]), 777);
        let payload = build_request_payload(&config, 42).unwrap();

        let (req1, fwd1) = process_build_request(&hop1_ctx, &payload, true)
            .unwrap()
            .expect("first hop record");
        assert!(!req1.is_gateway);
        assert!(!req1.is_endpoint);
        assert_eq!(req1.next_tunnel_id, config.last_hop().tunnel_id);

        let (req2, fwd2) = process_build_request(&hop2_ctx, &fwd1, false)
            .unwrap()
            .expect("second hop record");
        assert!(req2.is_endpoint);
        assert_eq!(req2.next_tunnel_id, 777);

        let verdicts = process_build_reply(&config, &fwd2).unwrap();
        assert_eq!(verdicts, vec![BUILD_RET_ACCEPT, BUILD_RET_REJECT]);
    }

    #[test]
    fn request_not_for_us_returns_none() {
        let hop_ctx = RouterContext::ephemeral().unwrap();
        let stranger_ctx = RouterContext::ephemeral().unwrap();
        let mut hop_ri = RouterInfo::new(hop_ctx.keys().identity().clone());
        hop_ri.sign(hop_ctx.keys()).unwrap();

        let config = TunnelConfig::inbound(vec![hop_ri], IdentHash([3u8; 32]));
        let payload = build_request_payload(&config, 1).unwrap();
        assert!(process_build_request(&stranger_ctx, &payload, true)
            .unwrap()
            .is_none());
    }
}
