//! DSA-SHA1 with the network's fixed 1024/160-bit parameters.
//!
//! Legacy identities sign with this scheme; new local identities default to
//! Ed25519 but must keep verifying DSA descriptors and handshakes.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};

use crate::constants::{dsa_g, dsa_p, dsa_q, to_fixed_be};
use crate::{CryptoError, Result};

pub const DSA_PUBLIC_KEY_LEN: usize = 128;
pub const DSA_PRIVATE_KEY_LEN: usize = 20;
pub const DSA_SIGNATURE_LEN: usize = 40;

fn sha1_digest(msg: &[u8]) -> BigUint {
    let mut hasher = Sha1::new();
    hasher.update(msg);
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Modular inverse in the prime-order subgroup via Fermat's little theorem.
fn inv_mod_q(n: &BigUint) -> BigUint {
    let q = dsa_q();
    n.modpow(&(q - BigUint::from(2u32)), q)
}

pub fn dsa_generate_keypair() -> ([u8; DSA_PRIVATE_KEY_LEN], [u8; DSA_PUBLIC_KEY_LEN]) {
    let q = dsa_q();
    let mut x = BigUint::zero();
    while x.is_zero() {
        x = OsRng.gen_biguint_below(q);
    }
    let y = dsa_g().modpow(&x, dsa_p());
    let mut sk = [0u8; DSA_PRIVATE_KEY_LEN];
    let mut pk = [0u8; DSA_PUBLIC_KEY_LEN];
    sk.copy_from_slice(&to_fixed_be(&x, DSA_PRIVATE_KEY_LEN));
    pk.copy_from_slice(&to_fixed_be(&y, DSA_PUBLIC_KEY_LEN));
    (sk, pk)
}

pub fn dsa_sign(private_key: &[u8; DSA_PRIVATE_KEY_LEN], msg: &[u8]) -> [u8; DSA_SIGNATURE_LEN] {
    let p = dsa_p();
    let q = dsa_q();
    let g = dsa_g();
    let x = BigUint::from_bytes_be(private_key);
    let h = sha1_digest(msg) % q;

    loop {
        let k = OsRng.gen_biguint_below(q);
        if k.is_zero() {
            continue;
        }
        let r = g.modpow(&k, p) % q;
        if r.is_zero() {
            continue;
        }
        let s = (inv_mod_q(&k) * (&h + &x * &r)) % q;
        if s.is_zero() {
            continue;
        }
        let mut sig = [0u8; DSA_SIGNATURE_LEN];
        sig[..20].copy_from_slice(&to_fixed_be(&r, 20));
        sig[20..].copy_from_slice(&to_fixed_be(&s, 20));
        return sig;
    }
}

pub fn dsa_verify(
    public_key: &[u8; DSA_PUBLIC_KEY_LEN],
    msg: &[u8],
    sig: &[u8; DSA_SIGNATURE_LEN],
) -> Result<()> {
    let p = dsa_p();
    let q = dsa_q();
    let g = dsa_g();
    let y = BigUint::from_bytes_be(public_key);
    let r = BigUint::from_bytes_be(&sig[..20]);
    let s = BigUint::from_bytes_be(&sig[20..]);
    if r.is_zero() || s.is_zero() || r >= *q || s >= *q {
        return Err(CryptoError::InvalidSignature);
    }

    let h = sha1_digest(msg) % q;
    let w = inv_mod_q(&s);
    let u1 = (&h * &w) % q;
    let u2 = (&r * &w) % q;
    let v = ((g.modpow(&u1, p) * y.modpow(&u2, p)) % p) % q;
    if v == r {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, pk) = dsa_generate_keypair();
        let msg = b"tunnel build request";
        let sig = dsa_sign(&sk, msg);
        assert!(dsa_verify(&pk, msg, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let (sk, pk) = dsa_generate_keypair();
        let sig = dsa_sign(&sk, b"original");
        assert!(dsa_verify(&pk, b"originaL", &sig).is_err());
    }

    #[test]
    fn tampered_signature_fails() {
        let (sk, pk) = dsa_generate_keypair();
        let mut sig = dsa_sign(&sk, b"message");
        sig[5] ^= 0x40;
        assert!(dsa_verify(&pk, b"message", &sig).is_err());
    }

    #[test]
    fn zero_signature_rejected() {
        let (_, pk) = dsa_generate_keypair();
        let sig = [0u8; DSA_SIGNATURE_LEN];
        assert!(dsa_verify(&pk, b"message", &sig).is_err());
    }
}
