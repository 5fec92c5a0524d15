//! Base64/base32 with the network's alphabets. Base64 swaps `+/` for `-~`
//! so hashes survive inside URLs and hostnames; base32 is the lowercase
//! RFC 4648 alphabet used for `.b32` addresses.

use std::sync::OnceLock;

use data_encoding::{Encoding, Specification};

fn b64() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols
            .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
        spec.padding = Some('=');
        spec.encoding().expect("valid base64 spec")
    })
}

fn b32() -> &'static Encoding {
    static ENC: OnceLock<Encoding> = OnceLock::new();
    ENC.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
        spec.encoding().expect("valid base32 spec")
    })
}

pub fn base64_encode(data: &[u8]) -> String {
    b64().encode(data)
}

pub fn base64_decode(s: &str) -> Option<Vec<u8>> {
    b64().decode(s.as_bytes()).ok()
}

pub fn base32_encode(data: &[u8]) -> String {
    b32().encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_uses_network_alphabet() {
        // 0xFF 0xFF maps onto the last symbols of the alphabet
        let encoded = base64_encode(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(encoded, "~~~~");
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
    }

    #[test]
    fn base64_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        let encoded = base64_encode(&data);
        assert_eq!(base64_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn base64_rejects_standard_alphabet() {
        assert!(base64_decode("ab+/").is_none());
    }

    #[test]
    fn base32_is_lowercase_unpadded() {
        let encoded = base32_encode(&[0u8; 32]);
        assert!(encoded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(!encoded.contains('='));
    }
}
