//! Signature schemes for router identities: Ed25519 for modern identities,
//! ECDSA P-256/P-384 for the intermediate legacy types. Raw byte APIs so the
//! identity layer can dispatch on the certificate's signing type.

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use p256::ecdsa::signature::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::{CryptoError, Result};

pub fn ed25519_generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing = SigningKey::generate(&mut OsRng);
    (signing.to_bytes(), signing.verifying_key().to_bytes())
}

pub fn ed25519_sign(private_key: &[u8; 32], msg: &[u8]) -> [u8; 64] {
    let signing = SigningKey::from_bytes(private_key);
    signing.sign(msg).to_bytes()
}

pub fn ed25519_verify(public_key: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<()> {
    let verifying = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidKey)?;
    let signature = ed25519_dalek::Signature::from_bytes(sig);
    verifying
        .verify(msg, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn ecdsa_p256_generate_keypair() -> ([u8; 32], [u8; 64]) {
    let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
    let point = signing.verifying_key().to_encoded_point(false);
    let mut public = [0u8; 64];
    public.copy_from_slice(&point.as_bytes()[1..]);
    let mut private = [0u8; 32];
    private.copy_from_slice(&signing.to_bytes());
    (private, public)
}

pub fn ecdsa_p256_sign(private_key: &[u8; 32], msg: &[u8]) -> Result<[u8; 64]> {
    let signing =
        p256::ecdsa::SigningKey::from_slice(private_key).map_err(|_| CryptoError::InvalidKey)?;
    let signature: p256::ecdsa::Signature = signing.sign(msg);
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    Ok(out)
}

pub fn ecdsa_p256_verify(public_key: &[u8; 64], msg: &[u8], sig: &[u8; 64]) -> Result<()> {
    let point = p256::EncodedPoint::from_untagged_bytes(public_key.into());
    let verifying = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
        .map_err(|_| CryptoError::InvalidKey)?;
    let signature =
        p256::ecdsa::Signature::from_slice(sig).map_err(|_| CryptoError::InvalidSignature)?;
    verifying
        .verify(msg, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn ecdsa_p384_generate_keypair() -> ([u8; 48], [u8; 96]) {
    let signing = p384::ecdsa::SigningKey::random(&mut OsRng);
    let point = signing.verifying_key().to_encoded_point(false);
    let mut public = [0u8; 96];
    public.copy_from_slice(&point.as_bytes()[1..]);
    let mut private = [0u8; 48];
    private.copy_from_slice(&signing.to_bytes());
    (private, public)
}

pub fn ecdsa_p384_sign(private_key: &[u8; 48], msg: &[u8]) -> Result<[u8; 96]> {
    let signing =
        p384::ecdsa::SigningKey::from_slice(private_key).map_err(|_| CryptoError::InvalidKey)?;
    let signature: p384::ecdsa::Signature = signing.sign(msg);
    let mut out = [0u8; 96];
    out.copy_from_slice(&signature.to_bytes());
    Ok(out)
}

pub fn ecdsa_p384_verify(public_key: &[u8; 96], msg: &[u8], sig: &[u8; 96]) -> Result<()> {
    let point = p384::EncodedPoint::from_untagged_bytes(
        p384::elliptic_curve::generic_array::GenericArray::from_slice(public_key),
    );
    let verifying = p384::ecdsa::VerifyingKey::from_encoded_point(&point)
        .map_err(|_| CryptoError::InvalidKey)?;
    let signature =
        p384::ecdsa::Signature::from_slice(sig).map_err(|_| CryptoError::InvalidSignature)?;
    verifying
        .verify(msg, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_roundtrip() {
        let (sk, pk) = ed25519_generate_keypair();
        let sig = ed25519_sign(&sk, b"router info");
        assert!(ed25519_verify(&pk, b"router info", &sig).is_ok());
        assert!(ed25519_verify(&pk, b"router inf0", &sig).is_err());
    }

    #[test]
    fn p256_roundtrip() {
        let (sk, pk) = ecdsa_p256_generate_keypair();
        let sig = ecdsa_p256_sign(&sk, b"session created").unwrap();
        assert!(ecdsa_p256_verify(&pk, b"session created", &sig).is_ok());
        let mut bad = sig;
        bad[10] ^= 1;
        assert!(ecdsa_p256_verify(&pk, b"session created", &bad).is_err());
    }

    #[test]
    fn p384_roundtrip() {
        let (sk, pk) = ecdsa_p384_generate_keypair();
        let sig = ecdsa_p384_sign(&sk, b"descriptor").unwrap();
        assert!(ecdsa_p384_verify(&pk, b"descriptor", &sig).is_ok());
        assert!(ecdsa_p384_verify(&pk, b"descriptot", &sig).is_err());
    }
}
