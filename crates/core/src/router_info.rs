//! Signed router descriptors: identity, transport addresses, capability
//! properties, and the trailing signature over everything before it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use tracing::warn;

use crate::base64::{base64_decode, base64_encode};
use crate::error::{CoreError, Result};
use crate::identity::{IdentHash, PrivateKeys, RouterIdentity};
use crate::NET_ID;

/// Serialized descriptors above this size are rejected outright.
pub const MAX_ROUTER_INFO_LEN: usize = 64 * 1024;

pub const PROP_CAPS: &str = "caps";
pub const PROP_NET_ID: &str = "netId";
pub const PROP_FAMILY: &str = "family";
pub const PROP_VERSION: &str = "router.version";

pub const CAP_FLOODFILL: char = 'f';
pub const CAP_REACHABLE: char = 'R';
pub const CAP_UNREACHABLE: char = 'U';

/// Address option keys.
const OPT_HOST: &str = "host";
const OPT_PORT: &str = "port";
const OPT_KEY: &str = "key";
const OPT_MTU: &str = "mtu";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStyle {
    Ntcp,
    Ssu,
}

impl TransportStyle {
    fn as_str(&self) -> &'static str {
        match self {
            TransportStyle::Ntcp => "NTCP",
            TransportStyle::Ssu => "SSU",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "NTCP" => Some(TransportStyle::Ntcp),
            "SSU" => Some(TransportStyle::Ssu),
            _ => None,
        }
    }
}

impl fmt::Display for TransportStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A third router that relays hole punches to a firewalled peer, as listed in
/// the peer's SSU address options (`ihostN`/`iportN`/`ikeyN`/`itagN`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Introducer {
    pub host: IpAddr,
    pub port: u16,
    pub tag: u32,
    pub key: [u8; 32],
}

/// One transport address inside a descriptor. Host and port live in the
/// option map on the wire; typed accessors parse them on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterAddress {
    pub style: TransportStyle,
    pub cost: u8,
    /// Milliseconds since epoch; zero means no expiration.
    pub expiration: u64,
    pub options: BTreeMap<String, String>,
}

impl RouterAddress {
    pub fn new(style: TransportStyle, addr: SocketAddr) -> Self {
        let mut options = BTreeMap::new();
        options.insert(OPT_HOST.into(), addr.ip().to_string());
        options.insert(OPT_PORT.into(), addr.port().to_string());
        RouterAddress {
            style,
            cost: match style {
                TransportStyle::Ntcp => 10,
                TransportStyle::Ssu => 5,
            },
            expiration: 0,
            options,
        }
    }

    pub fn host(&self) -> Option<IpAddr> {
        self.options.get(OPT_HOST)?.parse().ok()
    }

    pub fn port(&self) -> Option<u16> {
        self.options.get(OPT_PORT)?.parse().ok()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.host()?, self.port()?))
    }

    pub fn set_host(&mut self, host: IpAddr) {
        self.options.insert(OPT_HOST.into(), host.to_string());
    }

    /// SSU intro key (base64 in the options).
    pub fn intro_key(&self) -> Option<[u8; 32]> {
        let decoded = base64_decode(self.options.get(OPT_KEY)?)?;
        decoded.try_into().ok()
    }

    pub fn set_intro_key(&mut self, key: &[u8; 32]) {
        self.options.insert(OPT_KEY.into(), base64_encode(key));
    }

    pub fn mtu(&self) -> Option<u16> {
        self.options.get(OPT_MTU)?.parse().ok()
    }

    /// Introducers advertised on an SSU address, indexed 0..2.
    pub fn introducers(&self) -> Vec<Introducer> {
        let mut out = Vec::new();
        for i in 0..3 {
            let host = self
                .options
                .get(&format!("ihost{}", i))
                .and_then(|h| h.parse().ok());
            let port = self
                .options
                .get(&format!("iport{}", i))
                .and_then(|p| p.parse().ok());
            let tag = self
                .options
                .get(&format!("itag{}", i))
                .and_then(|t| t.parse().ok());
            let key = self
                .options
                .get(&format!("ikey{}", i))
                .and_then(|k| base64_decode(k))
                .and_then(|k| <[u8; 32]>::try_from(k).ok());
            if let (Some(host), Some(port), Some(tag), Some(key)) = (host, port, tag, key) {
                out.push(Introducer {
                    host,
                    port,
                    tag,
                    key,
                });
            }
        }
        out
    }

    pub fn add_introducer(&mut self, index: usize, intro: &Introducer) {
        self.options
            .insert(format!("ihost{}", index), intro.host.to_string());
        self.options
            .insert(format!("iport{}", index), intro.port.to_string());
        self.options
            .insert(format!("itag{}", index), intro.tag.to_string());
        self.options
            .insert(format!("ikey{}", index), base64_encode(&intro.key));
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u8(self.cost);
        out.put_u64(self.expiration);
        write_string(out, self.style.as_str());
        write_mapping(out, &self.options);
    }

    fn read_from(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 9 {
            return Err(CoreError::Malformed("router address"));
        }
        let cost = buf.get_u8();
        let expiration = buf.get_u64();
        let style_str = read_string(buf)?;
        let style = TransportStyle::from_str(&style_str)
            .ok_or(CoreError::Malformed("transport style"))?;
        let options = read_mapping(buf)?;
        Ok(RouterAddress {
            style,
            cost,
            expiration,
            options,
        })
    }
}

/// A router's published descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterInfo {
    identity: RouterIdentity,
    /// Milliseconds since epoch.
    published: u64,
    addresses: Vec<RouterAddress>,
    peers: Vec<IdentHash>,
    properties: BTreeMap<String, String>,
    signature: Option<Vec<u8>>,
}

impl RouterInfo {
    pub fn new(identity: RouterIdentity) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(PROP_NET_ID.into(), NET_ID.to_string());
        RouterInfo {
            identity,
            published: now_ms(),
            addresses: Vec::new(),
            peers: Vec::new(),
            properties,
            signature: None,
        }
    }

    /// Parse and verify a descriptor. The signature must check out under the
    /// embedded identity and the whole thing must fit the size cap.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() > MAX_ROUTER_INFO_LEN {
            return Err(CoreError::TooLarge(buf.len()));
        }
        let (identity, ident_len) = RouterIdentity::from_buffer(buf)?;
        let mut rest = &buf[ident_len..];

        if rest.remaining() < 9 {
            return Err(CoreError::Malformed("router info"));
        }
        let published = rest.get_u64();
        let num_addresses = rest.get_u8() as usize;
        let mut addresses = Vec::with_capacity(num_addresses);
        for _ in 0..num_addresses {
            addresses.push(RouterAddress::read_from(&mut rest)?);
        }

        if rest.remaining() < 1 {
            return Err(CoreError::Malformed("router info"));
        }
        let num_peers = rest.get_u8() as usize;
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            if rest.remaining() < 32 {
                return Err(CoreError::Malformed("router info peers"));
            }
            peers.push(IdentHash::from_bytes(&rest[..32])?);
            rest.advance(32);
        }

        let properties = read_mapping(&mut rest)?;

        let sig_len = identity.signing_key().sig_type().signature_len();
        if rest.remaining() < sig_len {
            return Err(CoreError::ShortBuffer {
                need: sig_len,
                got: rest.remaining(),
            });
        }
        let signed_len = buf.len() - rest.remaining();
        let signature = rest[..sig_len].to_vec();
        identity.verify(&buf[..signed_len], &signature)?;

        Ok(RouterInfo {
            identity,
            published,
            addresses,
            peers,
            properties,
            signature: Some(signature),
        })
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(self.identity.to_bytes());
        out.put_u64(self.published);
        out.put_u8(self.addresses.len() as u8);
        for addr in &self.addresses {
            addr.write_to(&mut out);
        }
        out.put_u8(self.peers.len() as u8);
        for peer in &self.peers {
            out.extend_from_slice(peer.as_bytes());
        }
        write_mapping(&mut out, &self.properties);
        out
    }

    /// Serialized descriptor including the signature.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let signature = self.signature.as_ref().ok_or(CoreError::NotSigned)?;
        let mut out = self.signed_bytes();
        out.extend_from_slice(signature);
        Ok(out)
    }

    /// Re-stamp and sign. The timestamp is strictly monotonic so peers always
    /// prefer the newer descriptor.
    pub fn sign(&mut self, keys: &PrivateKeys) -> Result<()> {
        let now = now_ms();
        self.published = if now > self.published {
            now
        } else {
            self.published + 1
        };
        let signature = keys.sign(&self.signed_bytes())?;
        self.signature = Some(signature);
        Ok(())
    }

    pub fn verify(&self) -> Result<()> {
        let signature = self.signature.as_ref().ok_or(CoreError::NotSigned)?;
        self.identity.verify(&self.signed_bytes(), signature)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.identity.hash()
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn addresses(&self) -> &[RouterAddress] {
        &self.addresses
    }

    /// First address of the given style, optionally filtered.
    pub fn address<F>(&self, style: TransportStyle, filter: F) -> Option<&RouterAddress>
    where
        F: Fn(&RouterAddress) -> bool,
    {
        self.addresses
            .iter()
            .find(|a| a.style == style && filter(a))
    }

    pub fn ntcp_address(&self) -> Option<&RouterAddress> {
        self.address(TransportStyle::Ntcp, |a| a.socket_addr().is_some())
    }

    pub fn ssu_address(&self) -> Option<&RouterAddress> {
        self.address(TransportStyle::Ssu, |a| a.socket_addr().is_some())
    }

    /// Mutations clear the signature; the owner re-signs before publishing.
    pub fn set_addresses(&mut self, addresses: Vec<RouterAddress>) {
        self.addresses = addresses;
        self.signature = None;
    }

    pub fn addresses_mut(&mut self) -> &mut Vec<RouterAddress> {
        self.signature = None;
        &mut self.addresses
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.into(), value.into());
        self.signature = None;
    }

    pub fn net_id(&self) -> Option<u8> {
        self.property(PROP_NET_ID)?.parse().ok()
    }

    pub fn caps(&self) -> &str {
        self.property(PROP_CAPS).unwrap_or("")
    }

    pub fn is_floodfill(&self) -> bool {
        self.caps().contains(CAP_FLOODFILL)
    }

    pub fn is_reachable(&self) -> bool {
        self.caps().contains(CAP_REACHABLE)
    }

    /// Whether this router offers to relay hole punches ('C' in its SSU
    /// address caps).
    pub fn is_introducer(&self) -> bool {
        self.ssu_address()
            .and_then(|a| a.options.get("caps"))
            .map(|caps| caps.contains('C'))
            .unwrap_or(false)
    }

    /// Whether this router participates as a peer-test helper ('B' in its
    /// SSU address caps).
    pub fn is_peer_testing(&self) -> bool {
        self.ssu_address()
            .and_then(|a| a.options.get("caps"))
            .map(|caps| caps.contains('B'))
            .unwrap_or(false)
    }

    pub fn family(&self) -> Option<&str> {
        self.property(PROP_FAMILY)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(255);
    if len < s.len() {
        warn!(string = s, "truncating over-long string");
    }
    out.put_u8(len as u8);
    out.extend_from_slice(&s.as_bytes()[..len]);
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 1 {
        return Err(CoreError::Malformed("string"));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(CoreError::Malformed("string"));
    }
    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| CoreError::Malformed("string"))?;
    buf.advance(len);
    Ok(s)
}

/// Key/value mapping: 2-byte total size, then length-prefixed
/// `key=value;` pairs. Keys are written in sorted order so the signed byte
/// stream is deterministic.
fn write_mapping(out: &mut Vec<u8>, map: &BTreeMap<String, String>) {
    let mut body = Vec::new();
    for (key, value) in map {
        write_string(&mut body, key);
        body.put_u8(b'=');
        write_string(&mut body, value);
        body.put_u8(b';');
    }
    out.put_u16(body.len() as u16);
    out.extend_from_slice(&body);
}

fn read_mapping(buf: &mut &[u8]) -> Result<BTreeMap<String, String>> {
    if buf.remaining() < 2 {
        return Err(CoreError::Malformed("mapping"));
    }
    let size = buf.get_u16() as usize;
    if buf.remaining() < size {
        return Err(CoreError::Malformed("mapping"));
    }
    let mut body = &buf[..size];
    buf.advance(size);

    let mut map = BTreeMap::new();
    while body.has_remaining() {
        let key = read_string(&mut body)?;
        if !body.has_remaining() || body.get_u8() != b'=' {
            return Err(CoreError::Malformed("mapping"));
        }
        let value = read_string(&mut body)?;
        if !body.has_remaining() || body.get_u8() != b';' {
            return Err(CoreError::Malformed("mapping"));
        }
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateKeys;

    fn signed_router_info(keys: &PrivateKeys) -> RouterInfo {
        let mut ri = RouterInfo::new(keys.identity().clone());
        let mut ntcp = RouterAddress::new(TransportStyle::Ntcp, "127.0.0.1:12345".parse().unwrap());
        ntcp.cost = 10;
        let mut ssu = RouterAddress::new(TransportStyle::Ssu, "127.0.0.1:12346".parse().unwrap());
        ssu.set_intro_key(&[0xAB; 32]);
        ri.set_addresses(vec![ntcp, ssu]);
        ri.set_property(PROP_CAPS, "LR");
        ri.set_property(PROP_VERSION, "0.9.30");
        ri.sign(keys).unwrap();
        ri
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        let keys = PrivateKeys::generate();
        let ri = signed_router_info(&keys);
        let bytes = ri.to_bytes().unwrap();
        let parsed = RouterInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, ri);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn parse_verifies_signature() {
        let keys = PrivateKeys::generate();
        let ri = signed_router_info(&keys);
        let mut bytes = ri.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            RouterInfo::from_bytes(&bytes),
            Err(CoreError::BadSignature)
        ));
    }

    #[test]
    fn resign_bumps_timestamp_monotonically() {
        let keys = PrivateKeys::generate();
        let mut ri = signed_router_info(&keys);
        let first = ri.published();
        ri.set_property(PROP_FAMILY, "testfamily");
        assert!(ri.to_bytes().is_err());
        ri.sign(&keys).unwrap();
        assert!(ri.published() > first);
        ri.verify().unwrap();
        assert_eq!(ri.family(), Some("testfamily"));
    }

    #[test]
    fn address_accessors() {
        let keys = PrivateKeys::generate();
        let ri = signed_router_info(&keys);
        let ntcp = ri.ntcp_address().unwrap();
        assert_eq!(ntcp.port(), Some(12345));
        let ssu = ri.ssu_address().unwrap();
        assert_eq!(ssu.intro_key(), Some([0xAB; 32]));
        assert_eq!(ri.net_id(), Some(2));
    }

    #[test]
    fn introducer_options_roundtrip() {
        let mut addr = RouterAddress::new(TransportStyle::Ssu, "10.0.0.1:9000".parse().unwrap());
        let intro = Introducer {
            host: "192.0.2.7".parse().unwrap(),
            port: 8887,
            tag: 4242,
            key: [3u8; 32],
        };
        addr.add_introducer(0, &intro);
        assert_eq!(addr.introducers(), vec![intro]);
    }

    #[test]
    fn mapping_rejects_garbage() {
        let mut buf: &[u8] = &[0, 5, 1, b'a', b'x', 1, b'b', b';'];
        assert!(read_mapping(&mut buf).is_err());
    }
}
