//! ElGamal encryption over the 2048-bit group, as used for tunnel build
//! records.
//!
//! The 222-byte plaintext is framed into a 255-byte block: a nonzero marker
//! byte, the SHA-256 of the data, then the data itself. Ciphertext is the two
//! group elements `(a, b)` at 256 bytes each; the zero-padded variant
//! prefixes each element with a zero byte (514 bytes total).

use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use rand::rngs::OsRng;

use crate::constants::{elgamal_g, elgamal_p, to_fixed_be};
use crate::{sha256, CryptoError, Result};

/// Maximum plaintext per block.
pub const ELGAMAL_DATA_LEN: usize = 222;
/// Ciphertext length without zero padding.
pub const ELGAMAL_BLOCK_LEN: usize = 512;

const FRAME_LEN: usize = 255;

/// Generate a long-term ElGamal keypair `(private, public)`.
pub fn elgamal_generate_keypair() -> ([u8; 256], [u8; 256]) {
    let p = elgamal_p();
    let x = OsRng.gen_biguint_below(p);
    let y = elgamal_g().modpow(&x, p);
    let mut private = [0u8; 256];
    let mut public = [0u8; 256];
    private.copy_from_slice(&to_fixed_be(&x, 256));
    public.copy_from_slice(&to_fixed_be(&y, 256));
    (private, public)
}

pub fn elgamal_encrypt(
    public_key: &[u8; 256],
    data: &[u8],
    encrypted: &mut [u8],
    zero_padding: bool,
) -> Result<()> {
    if data.len() > ELGAMAL_DATA_LEN {
        return Err(CryptoError::PlaintextTooLong(data.len()));
    }
    let expected = if zero_padding { 514 } else { 512 };
    if encrypted.len() != expected {
        return Err(CryptoError::BadCiphertext);
    }

    let p = elgamal_p();
    let y = BigUint::from_bytes_be(public_key);

    let mut frame = [0u8; FRAME_LEN];
    frame[0] = 0xFF;
    frame[33..33 + data.len()].copy_from_slice(data);
    let digest = sha256(&frame[33..]);
    frame[1..33].copy_from_slice(&digest);

    let k = OsRng.gen_biguint_below(p);
    let a = elgamal_g().modpow(&k, p);
    let m = BigUint::from_bytes_be(&frame);
    let b = (y.modpow(&k, p) * m) % p;

    let a_bytes = to_fixed_be(&a, 256);
    let b_bytes = to_fixed_be(&b, 256);
    if zero_padding {
        encrypted[0] = 0;
        encrypted[1..257].copy_from_slice(&a_bytes);
        encrypted[257] = 0;
        encrypted[258..].copy_from_slice(&b_bytes);
    } else {
        encrypted[..256].copy_from_slice(&a_bytes);
        encrypted[256..].copy_from_slice(&b_bytes);
    }
    Ok(())
}

pub fn elgamal_decrypt(
    private_key: &[u8; 256],
    encrypted: &[u8],
    zero_padding: bool,
) -> Result<[u8; ELGAMAL_DATA_LEN]> {
    let (a_bytes, b_bytes) = if zero_padding {
        if encrypted.len() != 514 {
            return Err(CryptoError::BadCiphertext);
        }
        (&encrypted[1..257], &encrypted[258..514])
    } else {
        if encrypted.len() != 512 {
            return Err(CryptoError::BadCiphertext);
        }
        (&encrypted[..256], &encrypted[256..])
    };

    let p = elgamal_p();
    let x = BigUint::from_bytes_be(private_key);
    let a = BigUint::from_bytes_be(a_bytes);
    let b = BigUint::from_bytes_be(b_bytes);

    // m = b * a^(p-1-x), i.e. multiply by the inverse of a^x
    let exp = p - BigUint::one() - x;
    let m = (b * a.modpow(&exp, p)) % p;
    let frame = to_fixed_be(&m, FRAME_LEN);

    let digest = sha256(&frame[33..]);
    if digest != frame[1..33] {
        return Err(CryptoError::BadCiphertext);
    }
    let mut out = [0u8; ELGAMAL_DATA_LEN];
    out.copy_from_slice(&frame[33..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 256], [u8; 256]) {
        elgamal_generate_keypair()
    }

    #[test]
    fn roundtrip() {
        let (sk, pk) = keypair();
        let data = [0x5Au8; ELGAMAL_DATA_LEN];
        let mut ct = [0u8; 512];
        elgamal_encrypt(&pk, &data, &mut ct, false).unwrap();
        let out = elgamal_decrypt(&sk, &ct, false).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn roundtrip_zero_padded() {
        let (sk, pk) = keypair();
        let mut data = [0u8; ELGAMAL_DATA_LEN];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut ct = [0u8; 514];
        elgamal_encrypt(&pk, &data, &mut ct, true).unwrap();
        let out = elgamal_decrypt(&sk, &ct, true).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn tampering_detected() {
        let (sk, pk) = keypair();
        let data = [1u8; ELGAMAL_DATA_LEN];
        let mut ct = [0u8; 512];
        elgamal_encrypt(&pk, &data, &mut ct, false).unwrap();
        ct[300] ^= 0x01;
        assert!(elgamal_decrypt(&sk, &ct, false).is_err());
    }

    #[test]
    fn short_plaintext_is_zero_extended() {
        let (sk, pk) = keypair();
        let data = [9u8; 40];
        let mut ct = [0u8; 512];
        elgamal_encrypt(&pk, &data, &mut ct, false).unwrap();
        let out = elgamal_decrypt(&sk, &ct, false).unwrap();
        assert_eq!(&out[..40], &data[..]);
        assert!(out[40..].iter().all(|&b| b == 0));
    }
}
