//! AES-256 in the modes the wire formats require.
//!
//! ECB is only ever applied to single 16-byte blocks (tunnel IVs); CBC runs
//! over block-aligned buffers with no padding. `LayerCipher` implements the
//! double-IV tunnel transform: the IV is ECB-encrypted, the payload is
//! CBC-processed under the resulting IV, and the IV is ECB-encrypted again so
//! no hop sees the same IV twice.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;

pub const AES_BLOCK_SIZE: usize = 16;

pub type AesKey = [u8; 32];

/// Single-block AES-256 encryption (ECB).
pub struct EcbEncryption {
    cipher: Aes256,
}

impl EcbEncryption {
    pub fn new(key: &AesKey) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Single-block AES-256 decryption (ECB).
pub struct EcbDecryption {
    cipher: Aes256,
}

impl EcbDecryption {
    pub fn new(key: &AesKey) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Streaming AES-256-CBC encryption. Chaining state carries across calls, so
/// a long-lived instance encrypts a TCP link as one continuous CBC stream.
pub struct CbcEncryption {
    inner: cbc::Encryptor<Aes256>,
}

impl CbcEncryption {
    pub fn new(key: &AesKey, iv: &[u8; AES_BLOCK_SIZE]) -> Self {
        Self {
            inner: cbc::Encryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// Encrypt `buf` in place. The length must be a multiple of 16.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Streaming AES-256-CBC decryption.
pub struct CbcDecryption {
    inner: cbc::Decryptor<Aes256>,
}

impl CbcDecryption {
    pub fn new(key: &AesKey, iv: &[u8; AES_BLOCK_SIZE]) -> Self {
        Self {
            inner: cbc::Decryptor::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    /// Decrypt `buf` in place. The length must be a multiple of 16.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % AES_BLOCK_SIZE, 0);
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.inner
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// One-shot CBC encryption of a block-aligned buffer.
pub fn cbc_encrypt(key: &AesKey, iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) {
    CbcEncryption::new(key, iv).encrypt(buf);
}

/// One-shot CBC decryption of a block-aligned buffer.
pub fn cbc_decrypt(key: &AesKey, iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) {
    CbcDecryption::new(key, iv).decrypt(buf);
}

/// Per-hop tunnel layer cipher (double-IV).
///
/// `decrypt` is the transform every participant and endpoint applies to a
/// received tunnel data message; `encrypt` is its exact inverse, applied by
/// the tunnel owner once per hop (in reverse hop order) so the layers cancel
/// as the message traverses the tunnel.
pub struct LayerCipher {
    layer_key: AesKey,
    iv_cipher: Aes256,
}

impl LayerCipher {
    pub fn new(layer_key: &AesKey, iv_key: &AesKey) -> Self {
        Self {
            layer_key: *layer_key,
            iv_cipher: Aes256::new(GenericArray::from_slice(iv_key)),
        }
    }

    /// Hop transform: buf is `[iv; 16][payload]`, payload block-aligned.
    pub fn decrypt(&self, buf: &mut [u8]) {
        let (iv, payload) = buf.split_at_mut(AES_BLOCK_SIZE);
        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(iv));
        let iv1: [u8; AES_BLOCK_SIZE] = iv.try_into().expect("split is exact");
        cbc_decrypt(&self.layer_key, &iv1, payload);
        self.iv_cipher
            .encrypt_block(GenericArray::from_mut_slice(iv));
    }

    /// Inverse of [`LayerCipher::decrypt`].
    pub fn encrypt(&self, buf: &mut [u8]) {
        let (iv, payload) = buf.split_at_mut(AES_BLOCK_SIZE);
        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(iv));
        let iv1: [u8; AES_BLOCK_SIZE] = iv.try_into().expect("split is exact");
        cbc_encrypt(&self.layer_key, &iv1, payload);
        self.iv_cipher
            .decrypt_block(GenericArray::from_mut_slice(iv));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let mut buf = [0u8; 64];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = buf;
        cbc_encrypt(&key, &iv, &mut buf);
        assert_ne!(buf, original);
        cbc_decrypt(&key, &iv, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn cbc_streaming_matches_one_shot() {
        let key = [9u8; 32];
        let iv = [1u8; 16];
        let mut whole = [0x42u8; 96];
        let mut split = whole;

        cbc_encrypt(&key, &iv, &mut whole);

        let mut enc = CbcEncryption::new(&key, &iv);
        enc.encrypt(&mut split[..32]);
        enc.encrypt(&mut split[32..]);

        assert_eq!(whole, split);
    }

    #[test]
    fn layer_cipher_is_invertible() {
        let cipher = LayerCipher::new(&[0x11; 32], &[0x22; 32]);
        let mut buf = vec![0u8; 16 + 1008];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let original = buf.clone();

        cipher.encrypt(&mut buf);
        assert_ne!(buf, original);
        cipher.decrypt(&mut buf);
        assert_eq!(buf, original);

        // and in the other order, as seen by a participant
        cipher.decrypt(&mut buf);
        cipher.encrypt(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn ecb_pair_is_invertible() {
        let key = [0xAB; 32];
        let enc = EcbEncryption::new(&key);
        let dec = EcbDecryption::new(&key);
        let mut block = [0x5Au8; 16];
        enc.encrypt_block(&mut block);
        dec.decrypt_block(&mut block);
        assert_eq!(block, [0x5Au8; 16]);
    }
}
