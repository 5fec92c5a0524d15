//! The UDP transport's truncated HMAC-MD5.
//!
//! Not RFC 2104: the 32-byte key is XOR-padded into the first half of the
//! 64-byte block only, and the outer hash input appends 16 zero bytes after
//! the inner digest (the protocol assumes a 32-byte inner hash). Both quirks
//! are load-bearing for wire compatibility.

use md5::{Digest, Md5};

pub type MacKey = [u8; 32];

pub const HMAC_DIGEST_LEN: usize = 16;

const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;

pub fn hmac_md5_digest(msg: &[u8], key: &MacKey) -> [u8; HMAC_DIGEST_LEN] {
    let mut ipad_block = [IPAD; 64];
    for (b, k) in ipad_block.iter_mut().zip(key.iter()) {
        *b ^= k;
    }
    let mut inner = Md5::new();
    inner.update(ipad_block);
    inner.update(msg);
    let inner_hash = inner.finalize();

    let mut outer_block = [0u8; 96];
    outer_block[..64].fill(OPAD);
    for (b, k) in outer_block.iter_mut().zip(key.iter()) {
        *b ^= k;
    }
    outer_block[64..80].copy_from_slice(&inner_hash);
    // bytes 80..96 stay zero

    let mut outer = Md5::new();
    outer.update(outer_block);
    outer.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let key = [0x42u8; 32];
        let a = hmac_md5_digest(b"packet body", &key);
        let b = hmac_md5_digest(b"packet body", &key);
        assert_eq!(a, b);
    }

    #[test]
    fn key_and_message_sensitivity() {
        let key1 = [1u8; 32];
        let key2 = [2u8; 32];
        assert_ne!(
            hmac_md5_digest(b"payload", &key1),
            hmac_md5_digest(b"payload", &key2)
        );
        assert_ne!(
            hmac_md5_digest(b"payload", &key1),
            hmac_md5_digest(b"payloae", &key1)
        );
    }

    #[test]
    fn differs_from_plain_md5() {
        let key = [0u8; 32];
        let plain: [u8; 16] = Md5::digest(b"data").into();
        assert_ne!(hmac_md5_digest(b"data", &key), plain);
    }
}
