//! Crypto Error Types

use thiserror::Error;

/// Errors from key handling and data-channel crypto setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Unknown cipher or digest name in configuration
    #[error("unknown algorithm: '{0}'")]
    UnknownAlgorithm(String),

    /// Key material has the wrong size for the algorithm
    #[error("bad key length: got {got}, need {need}")]
    BadKeyLength { got: usize, need: usize },

    /// Static key file body malformed
    #[error("static key parse error: {0}")]
    KeyParse(String),

    /// Cipher context missing required key material
    #[error("cipher not initialized")]
    NotInitialized,

    /// Encryption failed
    #[error("encryption failed")]
    EncryptFailed,

    /// Decryption or authentication failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Auth record string exceeds the 16-bit length field
    #[error("auth string overflow")]
    AuthStringOverflow,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
