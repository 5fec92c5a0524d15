//! Router identities: the long-term public-key bundle each participant is
//! addressed by, its 32-byte hash, and the daily routing key derived from it.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::base64::base64_encode;
use crate::error::{CoreError, Result};
use veilnet_crypto as crypto;

/// ElGamal public key length inside an identity.
pub const PUBLIC_KEY_LEN: usize = 256;
/// The fixed signing-key field; smaller keys are right-justified with random
/// padding in front, larger keys spill into the certificate.
pub const SIGNING_KEY_FIELD_LEN: usize = 128;
/// Identity length with a null certificate.
pub const IDENTITY_BASE_LEN: usize = PUBLIC_KEY_LEN + SIGNING_KEY_FIELD_LEN + 3;

const CERT_NULL: u8 = 0;
const CERT_KEY: u8 = 5;

/// ElGamal-2048 encryption key type code in key certificates.
const ENC_TYPE_ELGAMAL: u16 = 0;

/// The SHA-256 of a serialized identity. Peer selection distance is the XOR
/// metric over these hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentHash(pub [u8; 32]);

impl IdentHash {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = buf.try_into().map_err(|_| CoreError::Malformed("hash"))?;
        Ok(IdentHash(arr))
    }

    pub fn digest(data: &[u8]) -> Self {
        IdentHash(crypto::sha256(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another key.
    pub fn distance(&self, other: &IdentHash) -> [u8; 32] {
        let mut d = [0u8; 32];
        for i in 0..32 {
            d[i] = self.0[i] ^ other.0[i];
        }
        d
    }

    /// Short printable form for logs.
    pub fn abbrev(&self) -> String {
        base64_encode(&self.0[..4])
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base64_encode(&self.0))
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentHash({})", self.abbrev())
    }
}

/// Daily-rotated key: `SHA-256(ident || "YYYYMMDD")`.
pub fn routing_key(ident: &IdentHash, unix_secs: u64) -> IdentHash {
    let mut buf = [0u8; 40];
    buf[..32].copy_from_slice(&ident.0);
    buf[32..].copy_from_slice(date_string(unix_secs).as_bytes());
    IdentHash(crypto::sha256(&buf))
}

/// Today's routing key for an identity.
pub fn current_routing_key(ident: &IdentHash) -> IdentHash {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    routing_key(ident, now)
}

/// Civil date in "YYYYMMDD" form for a unix timestamp (UTC).
fn date_string(unix_secs: u64) -> String {
    // days-to-civil conversion (Gregorian), valid for the unix era
    let days = (unix_secs / 86_400) as i64;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{:04}{:02}{:02}", y, m, d)
}

/// Signature scheme of an identity, from its key certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigType {
    DsaSha1,
    EcdsaSha256P256,
    EcdsaSha384P384,
    EcdsaSha512P521,
    Ed25519,
    Ed25519ph,
    GostR3410A256,
    GostR3410B512,
    RedDsaEd25519,
}

impl SigType {
    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => SigType::DsaSha1,
            1 => SigType::EcdsaSha256P256,
            2 => SigType::EcdsaSha384P384,
            3 => SigType::EcdsaSha512P521,
            7 => SigType::Ed25519,
            8 => SigType::Ed25519ph,
            9 => SigType::GostR3410A256,
            10 => SigType::GostR3410B512,
            11 => SigType::RedDsaEd25519,
            other => return Err(CoreError::UnsupportedSigType(other)),
        })
    }

    pub fn code(&self) -> u16 {
        match self {
            SigType::DsaSha1 => 0,
            SigType::EcdsaSha256P256 => 1,
            SigType::EcdsaSha384P384 => 2,
            SigType::EcdsaSha512P521 => 3,
            SigType::Ed25519 => 7,
            SigType::Ed25519ph => 8,
            SigType::GostR3410A256 => 9,
            SigType::GostR3410B512 => 10,
            SigType::RedDsaEd25519 => 11,
        }
    }

    pub fn public_key_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 128,
            SigType::EcdsaSha256P256 => 64,
            SigType::EcdsaSha384P384 => 96,
            SigType::EcdsaSha512P521 => 132,
            SigType::Ed25519 | SigType::Ed25519ph | SigType::RedDsaEd25519 => 32,
            SigType::GostR3410A256 => 64,
            SigType::GostR3410B512 => 128,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 40,
            SigType::EcdsaSha256P256 => 64,
            SigType::EcdsaSha384P384 => 96,
            SigType::EcdsaSha512P521 => 132,
            SigType::Ed25519 | SigType::Ed25519ph | SigType::RedDsaEd25519 => 64,
            SigType::GostR3410A256 => 64,
            SigType::GostR3410B512 => 128,
        }
    }

    pub fn private_key_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 20,
            SigType::EcdsaSha256P256 => 32,
            SigType::EcdsaSha384P384 => 48,
            SigType::EcdsaSha512P521 => 66,
            SigType::Ed25519 | SigType::Ed25519ph | SigType::RedDsaEd25519 => 32,
            SigType::GostR3410A256 => 32,
            SigType::GostR3410B512 => 64,
        }
    }
}

/// A signing public key tagged with its scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey {
    sig_type: SigType,
    bytes: Vec<u8>,
}

impl SigningPublicKey {
    pub fn new(sig_type: SigType, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != sig_type.public_key_len() {
            return Err(CoreError::Malformed("signing public key"));
        }
        Ok(Self { sig_type, bytes })
    }

    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        if sig.len() != self.sig_type.signature_len() {
            return Err(CoreError::BadSignature);
        }
        let ok = match self.sig_type {
            SigType::DsaSha1 => crypto::dsa_verify(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
                sig.try_into().expect("length checked"),
            ),
            SigType::EcdsaSha256P256 => crypto::ecdsa_p256_verify(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
                sig.try_into().expect("length checked"),
            ),
            SigType::EcdsaSha384P384 => crypto::ecdsa_p384_verify(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
                sig.try_into().expect("length checked"),
            ),
            SigType::Ed25519 => crypto::ed25519_verify(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
                sig.try_into().expect("length checked"),
            ),
            _ => Err(veilnet_crypto::CryptoError::Unsupported),
        };
        ok.map_err(|_| CoreError::BadSignature)
    }
}

/// A signing private key tagged with its scheme.
#[derive(Clone)]
pub struct SigningPrivateKey {
    sig_type: SigType,
    bytes: Vec<u8>,
}

impl SigningPrivateKey {
    pub fn new(sig_type: SigType, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != sig_type.private_key_len() {
            return Err(CoreError::Malformed("signing private key"));
        }
        Ok(Self { sig_type, bytes })
    }

    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(match self.sig_type {
            SigType::DsaSha1 => {
                crypto::dsa_sign(self.bytes.as_slice().try_into().expect("length checked"), msg)
                    .to_vec()
            }
            SigType::EcdsaSha256P256 => crypto::ecdsa_p256_sign(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
            )?
            .to_vec(),
            SigType::EcdsaSha384P384 => crypto::ecdsa_p384_sign(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
            )?
            .to_vec(),
            SigType::Ed25519 => crypto::ed25519_sign(
                self.bytes.as_slice().try_into().expect("length checked"),
                msg,
            )
            .to_vec(),
            _ => return Err(CoreError::Crypto(veilnet_crypto::CryptoError::Unsupported)),
        })
    }
}

/// The immutable public identity of a router. Serialized bytes and the hash
/// are cached at construction; identities never change after parse.
#[derive(Clone, PartialEq, Eq)]
pub struct RouterIdentity {
    public_key: [u8; PUBLIC_KEY_LEN],
    signing_key: SigningPublicKey,
    bytes: Vec<u8>,
    hash: IdentHash,
}

impl RouterIdentity {
    /// Assemble an identity from raw key material, generating fresh padding
    /// for short signing keys.
    pub fn from_keys(public_key: [u8; PUBLIC_KEY_LEN], signing_key: SigningPublicKey) -> Self {
        let mut bytes = Vec::with_capacity(IDENTITY_BASE_LEN + 8);
        bytes.extend_from_slice(&public_key);

        let key_len = signing_key.as_bytes().len();
        let (field, excess): (&[u8], &[u8]) = if key_len <= SIGNING_KEY_FIELD_LEN {
            (signing_key.as_bytes(), &[])
        } else {
            signing_key.as_bytes().split_at(SIGNING_KEY_FIELD_LEN)
        };
        if field.len() < SIGNING_KEY_FIELD_LEN {
            let mut padding = vec![0u8; SIGNING_KEY_FIELD_LEN - field.len()];
            rand::thread_rng().fill_bytes(&mut padding);
            bytes.extend_from_slice(&padding);
        }
        bytes.extend_from_slice(field);

        match (signing_key.sig_type(), excess.len()) {
            (SigType::DsaSha1, 0) => {
                bytes.push(CERT_NULL);
                bytes.extend_from_slice(&0u16.to_be_bytes());
            }
            (sig_type, excess_len) => {
                bytes.push(CERT_KEY);
                bytes.extend_from_slice(&((4 + excess_len) as u16).to_be_bytes());
                bytes.extend_from_slice(&sig_type.code().to_be_bytes());
                bytes.extend_from_slice(&ENC_TYPE_ELGAMAL.to_be_bytes());
                bytes.extend_from_slice(excess);
            }
        }

        let hash = IdentHash::digest(&bytes);
        Self {
            public_key,
            signing_key,
            bytes,
            hash,
        }
    }

    /// Parse an identity from the front of `buf`; returns the identity and
    /// the number of bytes consumed.
    pub fn from_buffer(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < IDENTITY_BASE_LEN {
            return Err(CoreError::ShortBuffer {
                need: IDENTITY_BASE_LEN,
                got: buf.len(),
            });
        }
        let cert_type = buf[384];
        let cert_len = u16::from_be_bytes([buf[385], buf[386]]) as usize;
        let total = IDENTITY_BASE_LEN + cert_len;
        if buf.len() < total {
            return Err(CoreError::ShortBuffer {
                need: total,
                got: buf.len(),
            });
        }

        let (sig_type, excess) = match cert_type {
            CERT_NULL => (SigType::DsaSha1, &[][..]),
            CERT_KEY => {
                if cert_len < 4 {
                    return Err(CoreError::Malformed("key certificate"));
                }
                let code = u16::from_be_bytes([buf[387], buf[388]]);
                (SigType::from_code(code)?, &buf[391..total])
            }
            other => return Err(CoreError::UnsupportedCertificate(other)),
        };

        let key_len = sig_type.public_key_len();
        let mut key_bytes = Vec::with_capacity(key_len);
        if key_len <= SIGNING_KEY_FIELD_LEN {
            key_bytes.extend_from_slice(&buf[384 - key_len..384]);
        } else {
            let from_cert = key_len - SIGNING_KEY_FIELD_LEN;
            if excess.len() != from_cert {
                return Err(CoreError::Malformed("key certificate"));
            }
            key_bytes.extend_from_slice(&buf[PUBLIC_KEY_LEN..384]);
            key_bytes.extend_from_slice(excess);
        }

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&buf[..PUBLIC_KEY_LEN]);
        let bytes = buf[..total].to_vec();
        let hash = IdentHash::digest(&bytes);
        Ok((
            Self {
                public_key,
                signing_key: SigningPublicKey::new(sig_type, key_bytes)?,
                bytes,
                hash,
            },
            total,
        ))
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    pub fn signing_key(&self) -> &SigningPublicKey {
        &self.signing_key
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        self.signing_key.verify(msg, sig)
    }
}

impl fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterIdentity")
            .field("hash", &self.hash)
            .field("sig_type", &self.signing_key.sig_type())
            .finish()
    }
}

/// The local router's full key material: identity plus the ElGamal and
/// signing private keys. Persisted as `router.keys`.
#[derive(Clone)]
pub struct PrivateKeys {
    identity: RouterIdentity,
    private_key: [u8; PUBLIC_KEY_LEN],
    signing_private_key: SigningPrivateKey,
}

impl PrivateKeys {
    /// Generate a fresh identity. New identities default to Ed25519; legacy
    /// schemes remain parseable and verifiable on receive.
    pub fn generate() -> Self {
        Self::generate_with_type(SigType::Ed25519).expect("ed25519 keygen is infallible")
    }

    pub fn generate_with_type(sig_type: SigType) -> Result<Self> {
        let (enc_priv, enc_pub) = crypto::elgamal_generate_keypair();
        let (sig_priv, sig_pub): (Vec<u8>, Vec<u8>) = match sig_type {
            SigType::DsaSha1 => {
                let (sk, pk) = crypto::dsa_generate_keypair();
                (sk.to_vec(), pk.to_vec())
            }
            SigType::EcdsaSha256P256 => {
                let (sk, pk) = crypto::ecdsa_p256_generate_keypair();
                (sk.to_vec(), pk.to_vec())
            }
            SigType::EcdsaSha384P384 => {
                let (sk, pk) = crypto::ecdsa_p384_generate_keypair();
                (sk.to_vec(), pk.to_vec())
            }
            SigType::Ed25519 => {
                let (sk, pk) = crypto::ed25519_generate_keypair();
                (sk.to_vec(), pk.to_vec())
            }
            _ => return Err(CoreError::UnsupportedSigType(sig_type.code())),
        };
        let signing_key = SigningPublicKey::new(sig_type, sig_pub)?;
        Ok(Self {
            identity: RouterIdentity::from_keys(enc_pub, signing_key),
            private_key: enc_priv,
            signing_private_key: SigningPrivateKey::new(sig_type, sig_priv)?,
        })
    }

    /// Parse from the `router.keys` layout: identity, ElGamal private key,
    /// signing private key.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (identity, offset) = RouterIdentity::from_buffer(buf)?;
        let sig_type = identity.signing_key().sig_type();
        let need = offset + PUBLIC_KEY_LEN + sig_type.private_key_len();
        if buf.len() < need {
            return Err(CoreError::ShortBuffer {
                need,
                got: buf.len(),
            });
        }
        let mut private_key = [0u8; PUBLIC_KEY_LEN];
        private_key.copy_from_slice(&buf[offset..offset + PUBLIC_KEY_LEN]);
        let sk_start = offset + PUBLIC_KEY_LEN;
        let signing_private_key = SigningPrivateKey::new(
            sig_type,
            buf[sk_start..sk_start + sig_type.private_key_len()].to_vec(),
        )?;
        Ok(Self {
            identity,
            private_key,
            signing_private_key,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.identity.len()
                + PUBLIC_KEY_LEN
                + self.signing_private_key.sig_type().private_key_len(),
        );
        out.extend_from_slice(self.identity.to_bytes());
        out.extend_from_slice(&self.private_key);
        out.extend_from_slice(self.signing_private_key.as_bytes());
        out
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.identity.hash()
    }

    /// ElGamal private key, used to decrypt tunnel build records.
    pub fn private_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.private_key
    }

    pub fn signing_private_key(&self) -> &SigningPrivateKey {
        &self.signing_private_key
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        self.signing_private_key.sign(msg)
    }

    pub fn signature_len(&self) -> usize {
        self.signing_private_key.sig_type().signature_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_metric_properties() {
        let a = IdentHash([1u8; 32]);
        let b = IdentHash([2u8; 32]);
        let c = IdentHash([7u8; 32]);
        assert_eq!(a.distance(&a), [0u8; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
        // triangle inequality holds per byte for xor: d(a,c) <= d(a,b) ^ d(b,c) pointwise
        let ab = a.distance(&b);
        let bc = b.distance(&c);
        let ac = a.distance(&c);
        for i in 0..32 {
            assert_eq!(ac[i], ab[i] ^ bc[i]);
        }
    }

    #[test]
    fn routing_key_rotates_daily() {
        let ident = IdentHash([9u8; 32]);
        let day = 86_400;
        let k1 = routing_key(&ident, 1_700_000_000);
        let k2 = routing_key(&ident, 1_700_000_000 + day);
        let k3 = routing_key(&ident, 1_700_000_000 + 10);
        assert_ne!(k1, k2);
        // same calendar day, same key
        assert_eq!(k1, k3);
    }

    #[test]
    fn date_string_known_value() {
        // 2026-08-01T00:00:10Z
        assert_eq!(date_string(1_785_542_410), "20260801");
        // epoch
        assert_eq!(date_string(0), "19700101");
    }

    #[test]
    fn ed25519_identity_roundtrip() {
        let keys = PrivateKeys::generate();
        let bytes = keys.identity().to_bytes().to_vec();
        assert_eq!(bytes.len(), IDENTITY_BASE_LEN + 4);
        let (parsed, consumed) = RouterIdentity::from_buffer(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, *keys.identity());
        assert_eq!(parsed.hash(), keys.identity().hash());
    }

    #[test]
    fn dsa_identity_has_null_cert() {
        let keys = PrivateKeys::generate_with_type(SigType::DsaSha1).unwrap();
        let bytes = keys.identity().to_bytes();
        assert_eq!(bytes.len(), IDENTITY_BASE_LEN);
        assert_eq!(bytes[384], CERT_NULL);
    }

    #[test]
    fn sign_verify_through_identity() {
        for sig_type in [
            SigType::DsaSha1,
            SigType::EcdsaSha256P256,
            SigType::EcdsaSha384P384,
            SigType::Ed25519,
        ] {
            let keys = PrivateKeys::generate_with_type(sig_type).unwrap();
            let sig = keys.sign(b"payload").unwrap();
            assert_eq!(sig.len(), sig_type.signature_len());
            keys.identity().verify(b"payload", &sig).unwrap();
            assert!(keys.identity().verify(b"payloae", &sig).is_err());
        }
    }

    #[test]
    fn private_keys_roundtrip() {
        let keys = PrivateKeys::generate();
        let bytes = keys.to_bytes();
        let parsed = PrivateKeys::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ident_hash(), keys.ident_hash());
        let sig = parsed.sign(b"check").unwrap();
        keys.identity().verify(b"check", &sig).unwrap();
    }

    #[test]
    fn truncated_identity_rejected() {
        let keys = PrivateKeys::generate();
        let bytes = keys.identity().to_bytes();
        assert!(RouterIdentity::from_buffer(&bytes[..300]).is_err());
        assert!(RouterIdentity::from_buffer(&bytes[..bytes.len() - 1]).is_err());
    }
}
