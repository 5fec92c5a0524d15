//! X25519 key agreement. Not used by the legacy wire handshakes, but exposed
//! alongside the other primitives for the modern key-exchange paths layered
//! above the core.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

pub fn x25519_generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

pub fn x25519_agree(secret: &[u8; 32], their_public: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret);
    let public = PublicKey::from(*their_public);
    *secret.diffie_hellman(&public).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let (a_sk, a_pk) = x25519_generate_keypair();
        let (b_sk, b_pk) = x25519_generate_keypair();
        assert_eq!(x25519_agree(&a_sk, &b_pk), x25519_agree(&b_sk, &a_pk));
    }
}
