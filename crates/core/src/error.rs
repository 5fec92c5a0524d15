use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed {0}")]
    Malformed(&'static str),

    #[error("Buffer too short: need {need}, got {got}")]
    ShortBuffer { need: usize, got: usize },

    #[error("Unsupported signature type {0}")]
    UnsupportedSigType(u16),

    #[error("Unsupported certificate type {0}")]
    UnsupportedCertificate(u8),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Checksum mismatch")]
    BadChecksum,

    #[error("Message expired")]
    Expired,

    #[error("Descriptor too large: {0} bytes")]
    TooLarge(usize),

    #[error("Missing signature")]
    NotSigned,

    #[error("Crypto error: {0}")]
    Crypto(#[from] veilnet_crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
