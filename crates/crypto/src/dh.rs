//! Diffie-Hellman key agreement in the fixed 2048-bit group, plus the
//! shared-secret normalization both transports use to derive their session
//! keys.

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;

use crate::constants::{elgamal_g, elgamal_p, to_fixed_be};
use crate::{sha256, AesKey, CryptoError, MacKey, Result};

pub const DH_KEY_SIZE: usize = 256;

/// An ephemeral DH keypair. Generated ahead of time by the keys supplier,
/// consumed by exactly one handshake.
pub struct DhKeys {
    secret: BigUint,
    public: [u8; DH_KEY_SIZE],
}

impl DhKeys {
    pub fn generate() -> Self {
        let p = elgamal_p();
        let secret = OsRng.gen_biguint_below(p);
        let public_num = elgamal_g().modpow(&secret, p);
        let mut public = [0u8; DH_KEY_SIZE];
        public.copy_from_slice(&to_fixed_be(&public_num, DH_KEY_SIZE));
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; DH_KEY_SIZE] {
        &self.public
    }

    /// Agree on a 256-byte shared secret with the peer's public value.
    pub fn agree(&self, peer_public: &[u8; DH_KEY_SIZE]) -> Result<[u8; DH_KEY_SIZE]> {
        let p = elgamal_p();
        let peer = BigUint::from_bytes_be(peer_public);
        if peer < BigUint::from(2u32) || peer >= *p {
            return Err(CryptoError::InvalidKey);
        }
        let shared = peer.modpow(&self.secret, p);
        let mut out = [0u8; DH_KEY_SIZE];
        out.copy_from_slice(&to_fixed_be(&shared, DH_KEY_SIZE));
        Ok(out)
    }
}

/// Derive the session AES key and the second 32-byte key (MAC key for SSU,
/// IV material for NTCP) from a raw DH shared secret.
///
/// The rules mirror the wire protocol exactly: if the high bit of the first
/// byte is set, the secret is treated as a signed bignum and a zero byte is
/// prepended; leading zero bytes are skipped otherwise, and a zero-run longer
/// than 32 bytes hashes the remainder instead.
pub fn derive_session_keys(shared: &[u8; DH_KEY_SIZE]) -> Result<(AesKey, MacKey)> {
    let mut session = [0u8; 32];
    let mut mac = [0u8; 32];
    if shared[0] & 0x80 != 0 {
        session[0] = 0;
        session[1..32].copy_from_slice(&shared[..31]);
        mac.copy_from_slice(&shared[31..63]);
    } else if shared[0] != 0 {
        session.copy_from_slice(&shared[..32]);
        mac.copy_from_slice(&shared[32..64]);
    } else {
        let mut offset = 1;
        while shared[offset] == 0 {
            offset += 1;
            if offset > 32 {
                return Err(CryptoError::WeakSharedSecret);
            }
        }
        session.copy_from_slice(&shared[offset..offset + 32]);
        mac = sha256(&shared[offset..64]);
    }
    Ok((session, mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let alice = DhKeys::generate();
        let bob = DhKeys::generate();
        let s1 = alice.agree(bob.public()).unwrap();
        let s2 = bob.agree(alice.public()).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn rejects_degenerate_public() {
        let alice = DhKeys::generate();
        let zero = [0u8; DH_KEY_SIZE];
        assert!(alice.agree(&zero).is_err());
        let mut one = [0u8; DH_KEY_SIZE];
        one[DH_KEY_SIZE - 1] = 1;
        assert!(alice.agree(&one).is_err());
    }

    #[test]
    fn normalization_high_bit() {
        let mut shared = [0u8; DH_KEY_SIZE];
        shared[0] = 0x80;
        for (i, b) in shared.iter_mut().enumerate().skip(1) {
            *b = i as u8;
        }
        let (session, mac) = derive_session_keys(&shared).unwrap();
        assert_eq!(session[0], 0);
        assert_eq!(session[1], 0x80);
        assert_eq!(&session[2..32], &shared[1..31]);
        assert_eq!(&mac[..], &shared[31..63]);
    }

    #[test]
    fn normalization_plain() {
        let mut shared = [0u8; DH_KEY_SIZE];
        for (i, b) in shared.iter_mut().enumerate() {
            *b = (i as u8) | 1;
        }
        shared[0] = 0x7F;
        let (session, mac) = derive_session_keys(&shared).unwrap();
        assert_eq!(&session[..], &shared[..32]);
        assert_eq!(&mac[..], &shared[32..64]);
    }

    #[test]
    fn normalization_leading_zeros() {
        let mut shared = [0u8; DH_KEY_SIZE];
        for b in shared.iter_mut().skip(3) {
            *b = 0x11;
        }
        let (session, mac) = derive_session_keys(&shared).unwrap();
        assert_eq!(&session[..], &shared[3..35]);
        assert_eq!(mac, sha256(&shared[3..64]));
    }

    #[test]
    fn normalization_all_zero_rejected() {
        let shared = [0u8; DH_KEY_SIZE];
        assert!(derive_session_keys(&shared).is_err());
    }
}
