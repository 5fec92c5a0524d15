//! Cryptographic primitives for the veilnet router.
//!
//! Thin, allocation-conscious wrappers over the RustCrypto and dalek crates,
//! plus the handful of constructions the wire protocols require verbatim:
//! AES-256 ECB/CBC with the double-IV tunnel transform, DH and ElGamal in the
//! fixed 2048-bit group, DSA-SHA1 with the network's fixed parameters, and
//! the truncated HMAC-MD5 used by the UDP transport.

mod aes;
mod checksum;
mod constants;
mod dh;
mod dsa;
mod elgamal;
mod hmac;
mod sig;
mod x25519;

pub use crate::aes::{
    cbc_decrypt, cbc_encrypt, AesKey, CbcDecryption, CbcEncryption, EcbDecryption, EcbEncryption,
    LayerCipher, AES_BLOCK_SIZE,
};
pub use checksum::adler32;
pub use dh::{derive_session_keys, DhKeys, DH_KEY_SIZE};
pub use dsa::{
    dsa_generate_keypair, dsa_sign, dsa_verify, DSA_PRIVATE_KEY_LEN, DSA_PUBLIC_KEY_LEN,
    DSA_SIGNATURE_LEN,
};
pub use elgamal::{
    elgamal_decrypt, elgamal_encrypt, elgamal_generate_keypair, ELGAMAL_BLOCK_LEN, ELGAMAL_DATA_LEN,
};
pub use hmac::{hmac_md5_digest, MacKey, HMAC_DIGEST_LEN};
pub use sig::{
    ecdsa_p256_generate_keypair, ecdsa_p256_sign, ecdsa_p256_verify, ecdsa_p384_generate_keypair,
    ecdsa_p384_sign, ecdsa_p384_verify, ed25519_generate_keypair, ed25519_sign, ed25519_verify,
};
pub use crate::x25519::{x25519_agree, x25519_generate_keypair};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Plaintext too long: {0} bytes")]
    PlaintextTooLong(usize),
    #[error("Ciphertext malformed")]
    BadCiphertext,
    #[error("Weak shared secret")]
    WeakSharedSecret,
    #[error("Unsupported operation")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Hash data using SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
