//! Adler-32, the integrity check on decrypted TCP transport frames.

pub fn adler32(data: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(data).hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        // Adler-32 of the empty string is 1 by definition.
        assert_eq!(adler32(&[]), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }
}
