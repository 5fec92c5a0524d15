//! One SSU peer session: the intro-key handshake with signed address
//! binding, followed by the reliable data channel in `data.rs`.
//!
//! Sessions are plain state owned by the server task; methods build the
//! packets to emit and the server puts them on the socket.

use std::net::SocketAddr;
use std::time::Instant;

use rand::RngCore;
use tracing::debug;

use veilnet_core::{IdentHash, RouterContext, RouterIdentity, RouterInfo, TransportStyle};
use veilnet_crypto::{cbc_decrypt, cbc_encrypt, derive_session_keys, AesKey, DhKeys, MacKey};

use crate::ssu::data::SsuData;
use crate::ssu::packet::{
    build_packet_with_iv, read_sized_ip, write_sized_ip, Packet, PAYLOAD_SESSION_CONFIRMED,
    PAYLOAD_SESSION_CREATED, PAYLOAD_SESSION_REQUEST, SSU_V4_MAX_PACKET_LEN, SSU_V6_MAX_PACKET_LEN,
};
use crate::{Result, SessionRole, TransportError};

/// Session AES and MAC keys derived from the handshake DH.
#[derive(Clone)]
pub struct SessionKeys {
    pub session_key: AesKey,
    pub mac_key: MacKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SsuState {
    Unknown,
    /// Waiting for a hole punch after a relay request.
    Introduced,
    RequestSent,
    CreatedSent,
    Established,
    Failed,
}

pub(crate) struct SsuSession {
    pub remote_endpoint: SocketAddr,
    pub remote_router: Option<RouterInfo>,
    pub remote_ident: Option<IdentHash>,
    pub state: SsuState,
    pub role: SessionRole,
    dh: Option<DhKeys>,
    pub keys: Option<SessionKeys>,
    x: [u8; 256],
    y: [u8; 256],
    /// Alice's address bytes (ip then port) as bound into the handshake
    /// signatures.
    alice_addr: Vec<u8>,
    /// Our advertised endpoint as signed into session-created (server side).
    our_advertised: Option<SocketAddr>,
    /// Relay tag we allotted to this peer (server side).
    sent_relay_tag: u32,
    /// Relay tag the peer allotted us (we can be introduced through them).
    pub relay_tag_in: u32,
    pub data: SsuData,
    pub last_activity: Instant,
    pub last_send: Instant,
    pub created_at: Instant,
    /// Run a peer test once this session establishes.
    pub want_peer_test: bool,
}

impl SsuSession {
    pub fn new(
        remote_endpoint: SocketAddr,
        remote_router: Option<RouterInfo>,
        role: SessionRole,
    ) -> Self {
        let max_packet = if remote_endpoint.is_ipv6() {
            SSU_V6_MAX_PACKET_LEN
        } else {
            SSU_V4_MAX_PACKET_LEN
        };
        let mut session = Self {
            remote_endpoint,
            remote_ident: remote_router.as_ref().map(|r| r.ident_hash()),
            remote_router,
            state: SsuState::Unknown,
            role,
            dh: None,
            keys: None,
            x: [0u8; 256],
            y: [0u8; 256],
            alice_addr: Vec::new(),
            our_advertised: None,
            sent_relay_tag: 0,
            relay_tag_in: 0,
            data: SsuData::new(max_packet),
            last_activity: Instant::now(),
            last_send: Instant::now(),
            created_at: Instant::now(),
            want_peer_test: false,
        };
        session.adopt_peer_mtu();
        session
    }

    fn adopt_peer_mtu(&mut self) {
        let Some(router) = &self.remote_router else {
            return;
        };
        let Some(mtu) = router.ssu_address().and_then(|a| a.mtu()) else {
            return;
        };
        let (overhead, max) = if self.remote_endpoint.is_ipv6() {
            (48, SSU_V6_MAX_PACKET_LEN)
        } else {
            (28, SSU_V4_MAX_PACKET_LEN)
        };
        self.data.adjust_packet_size(mtu as usize, overhead, max);
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_established(&self) -> bool {
        self.state == SsuState::Established
    }

    /// Peer's intro key: from their descriptor when dialing, ours when
    /// answering (the initiator always encrypts to the responder's key).
    /// Firewalled peers advertise a key without a host, so any SSU address
    /// qualifies.
    fn peer_intro_key(&self, ctx: &RouterContext) -> Result<AesKey> {
        match &self.remote_router {
            Some(router) => router
                .address(TransportStyle::Ssu, |_| true)
                .and_then(|a| a.intro_key())
                .ok_or(TransportError::NoAddress("SSU intro key")),
            None => Ok(*ctx.ident_hash().as_bytes()),
        }
    }

    /// Alice: open with a session request under Bob's intro key.
    pub fn send_session_request(&mut self, ctx: &RouterContext, dh: DhKeys) -> Result<Vec<u8>> {
        let intro_key = self.peer_intro_key(ctx)?;
        self.x = *dh.public();
        self.dh = Some(dh);
        self.state = SsuState::RequestSent;

        let mut payload = Vec::with_capacity(256 + 17);
        payload.extend_from_slice(&self.x);
        write_sized_ip(&mut payload, &self.remote_endpoint.ip());
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        Ok(build_packet_with_iv(
            PAYLOAD_SESSION_REQUEST,
            &payload,
            &intro_key,
            &intro_key,
            &iv,
        ))
    }

    /// Bob: answer a session request; derives keys and signs the address
    /// binding. `our_addr` is our published SSU endpoint, `relay_tag` is
    /// nonzero when we offer introduction.
    pub fn handle_session_request(
        &mut self,
        ctx: &RouterContext,
        packet: &Packet,
        dh: DhKeys,
        our_addr: SocketAddr,
        relay_tag: u32,
    ) -> Result<Vec<u8>> {
        let payload = &packet.payload;
        if payload.len() < 256 + 2 {
            return Err(TransportError::Handshake("session request too short"));
        }
        self.x.copy_from_slice(&payload[..256]);
        // the initiator's view of our IP follows; we sign our published one
        let _ = read_sized_ip(&payload[256..]);

        self.y = *dh.public();
        let shared = dh.agree(&self.x)?;
        let (session_key, mac_key) = derive_session_keys(&shared)?;
        self.keys = Some(SessionKeys {
            session_key,
            mac_key,
        });
        self.dh = Some(dh);

        // alice's address as we observed it: raw ip+port inside signatures,
        // size-prefixed on the wire
        let mut alice_signed = Vec::new();
        push_addr(&mut alice_signed, &self.remote_endpoint);
        self.alice_addr = alice_signed.clone();
        self.our_advertised = Some(our_addr);
        self.sent_relay_tag = relay_tag;

        let signed_on = now_secs();
        let mut signed = Vec::with_capacity(512 + 64);
        signed.extend_from_slice(&self.x);
        signed.extend_from_slice(&self.y);
        signed.extend_from_slice(&alice_signed);
        push_addr(&mut signed, &our_addr);
        signed.extend_from_slice(&relay_tag.to_be_bytes());
        signed.extend_from_slice(&signed_on.to_be_bytes());
        let signature = ctx.keys().sign(&signed).map_err(TransportError::Core)?;

        // signature section is pre-encrypted with the session key under the
        // packet IV, then the whole packet is wrapped with the intro key
        let sig_padded = (signature.len() + 15) & !15;
        let mut sig_section = Vec::with_capacity(sig_padded);
        sig_section.extend_from_slice(&signature);
        let mut padding = vec![0u8; sig_padded - signature.len()];
        rand::thread_rng().fill_bytes(&mut padding);
        sig_section.extend_from_slice(&padding);

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        cbc_encrypt(&session_key, &iv, &mut sig_section);

        let mut payload_out = Vec::with_capacity(256 + alice_signed.len() + 9 + sig_section.len());
        payload_out.extend_from_slice(&self.y);
        write_sized_ip(&mut payload_out, &self.remote_endpoint.ip());
        payload_out.extend_from_slice(&self.remote_endpoint.port().to_be_bytes());
        payload_out.extend_from_slice(&relay_tag.to_be_bytes());
        payload_out.extend_from_slice(&signed_on.to_be_bytes());
        payload_out.extend_from_slice(&sig_section);

        let intro_key = self.peer_intro_key(ctx)?;
        self.state = SsuState::CreatedSent;
        Ok(build_packet_with_iv(
            PAYLOAD_SESSION_CREATED,
            &payload_out,
            &intro_key,
            &intro_key,
            &iv,
        ))
    }

    /// Alice: process session created, verify Bob's signature, and reply
    /// with session confirmed under the new session key.
    pub fn handle_session_created(
        &mut self,
        ctx: &RouterContext,
        packet: &Packet,
    ) -> Result<(Vec<u8>, Option<std::net::IpAddr>)> {
        let router = self
            .remote_router
            .clone()
            .ok_or(TransportError::Handshake("unsolicited session created"))?;
        let payload = &packet.payload;
        if payload.len() < 256 + 1 + 4 + 2 + 8 {
            return Err(TransportError::Handshake("session created too short"));
        }
        self.y.copy_from_slice(&payload[..256]);
        let dh = self
            .dh
            .take()
            .ok_or(TransportError::Handshake("no DH state"))?;
        let shared = dh.agree(&self.y)?;
        let (session_key, mac_key) = derive_session_keys(&shared)?;

        let mut offset = 256;
        let (our_ip, consumed) = read_sized_ip(&payload[offset..])
            .ok_or(TransportError::Handshake("bad address"))?;
        // our ip+port as bob observed them, raw, for the signatures
        let alice_addr = payload[offset + 1..offset + consumed + 2].to_vec();
        offset += consumed + 2;
        let relay_tag = u32::from_be_bytes(
            payload[offset..offset + 4]
                .try_into()
                .expect("fixed split"),
        );
        offset += 4;
        let signed_on = u32::from_be_bytes(
            payload[offset..offset + 4]
                .try_into()
                .expect("fixed split"),
        );
        offset += 4;

        // decrypt the signature section with the session key and packet IV
        let sig_len = router.identity().signing_key().sig_type().signature_len();
        let sig_padded = (sig_len + 15) & !15;
        if payload.len() < offset + sig_padded {
            return Err(TransportError::Handshake("session created truncated"));
        }
        let mut sig_section = payload[offset..offset + sig_padded].to_vec();
        cbc_decrypt(&session_key, &packet.iv, &mut sig_section);

        let mut signed = Vec::with_capacity(512 + 64);
        signed.extend_from_slice(&self.x);
        signed.extend_from_slice(&self.y);
        signed.extend_from_slice(&alice_addr);
        push_addr(&mut signed, &self.remote_endpoint);
        signed.extend_from_slice(&relay_tag.to_be_bytes());
        signed.extend_from_slice(&signed_on.to_be_bytes());
        router
            .identity()
            .verify(&signed, &sig_section[..sig_len])
            .map_err(|_| TransportError::Handshake("session created signature"))?;

        self.relay_tag_in = relay_tag;
        self.keys = Some(SessionKeys {
            session_key,
            mac_key,
        });
        self.alice_addr = alice_addr.clone();

        // session confirmed: our identity and signature over the same shape
        // with a fresh signed-on time
        let our_signed_on = now_secs();
        let ident_bytes = ctx.keys().identity().to_bytes();
        let mut confirm_signed = Vec::with_capacity(512 + 64);
        confirm_signed.extend_from_slice(&self.x);
        confirm_signed.extend_from_slice(&self.y);
        confirm_signed.extend_from_slice(&alice_addr);
        push_addr(&mut confirm_signed, &self.remote_endpoint);
        confirm_signed.extend_from_slice(&relay_tag.to_be_bytes());
        confirm_signed.extend_from_slice(&our_signed_on.to_be_bytes());
        let signature = ctx.keys().sign(&confirm_signed).map_err(TransportError::Core)?;

        let mut payload_out = Vec::with_capacity(3 + ident_bytes.len() + 4 + signature.len() + 16);
        payload_out.push(0x01); // single identity fragment
        payload_out.extend_from_slice(&(ident_bytes.len() as u16).to_be_bytes());
        payload_out.extend_from_slice(ident_bytes);
        payload_out.extend_from_slice(&our_signed_on.to_be_bytes());
        // pad so the encrypted body (flag + time + payload + signature) is
        // block aligned without trailing slack after the signature
        let body_len = 1 + 4 + payload_out.len() + signature.len();
        let padding = (16 - body_len % 16) % 16;
        let mut pad = vec![0u8; padding];
        rand::thread_rng().fill_bytes(&mut pad);
        payload_out.extend_from_slice(&pad);
        payload_out.extend_from_slice(&signature);

        let keys = self.keys.as_ref().expect("just set");
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let packet_out = build_packet_with_iv(
            PAYLOAD_SESSION_CONFIRMED,
            &payload_out,
            &keys.session_key,
            &keys.mac_key,
            &iv,
        );
        self.state = SsuState::Established;
        debug!(peer = %self.remote_endpoint, "SSU session established (client)");
        Ok((packet_out, our_ip))
    }

    /// Bob: process session confirmed; learn and verify Alice's identity.
    pub fn handle_session_confirmed(&mut self, packet: &Packet) -> Result<IdentHash> {
        let payload = &packet.payload;
        if payload.len() < 3 {
            return Err(TransportError::Handshake("session confirmed too short"));
        }
        let ident_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        if payload.len() < 3 + ident_len + 4 {
            return Err(TransportError::Handshake("session confirmed truncated"));
        }
        let (identity, consumed) = RouterIdentity::from_buffer(&payload[3..3 + ident_len])
            .map_err(TransportError::Core)?;
        if consumed != ident_len {
            return Err(TransportError::Handshake("identity length mismatch"));
        }
        let signed_on = u32::from_be_bytes(
            payload[3 + ident_len..3 + ident_len + 4]
                .try_into()
                .expect("fixed split"),
        );

        let sig_len = identity.signing_key().sig_type().signature_len();
        let body_prefix = 1 + 4 + 3 + ident_len + 4;
        let padding = (16 - (body_prefix + sig_len) % 16) % 16;
        let sig_start = 3 + ident_len + 4 + padding;
        if payload.len() < sig_start + sig_len {
            return Err(TransportError::Handshake("session confirmed truncated"));
        }

        let our_addr = self
            .our_advertised
            .ok_or(TransportError::Handshake("confirmed before created"))?;
        let mut signed = Vec::with_capacity(512 + 64);
        signed.extend_from_slice(&self.x);
        signed.extend_from_slice(&self.y);
        signed.extend_from_slice(&self.alice_addr);
        push_addr(&mut signed, &our_addr);
        signed.extend_from_slice(&self.sent_relay_tag.to_be_bytes());
        signed.extend_from_slice(&signed_on.to_be_bytes());
        identity
            .verify(&signed, &payload[sig_start..sig_start + sig_len])
            .map_err(|_| TransportError::Handshake("session confirmed signature"))?;

        let hash = identity.hash();
        self.remote_ident = Some(hash);
        self.state = SsuState::Established;
        debug!(peer = %self.remote_endpoint, ident = %hash.abbrev(), "SSU session established (server)");
        Ok(hash)
    }
}

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// ip bytes then port, the shape used inside handshake signatures.
fn push_addr(out: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}
