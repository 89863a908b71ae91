//! Cipher and digest registries.
//!
//! Maps the algorithm names accepted by the `cipher`, `auth`, and
//! `tls-auth-digest` directives to key/IV/block geometry.

use crate::errors::{CryptoError, CryptoResult};

/// Data-channel cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlg {
    None,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    BfCbc,
}

impl CipherAlg {
    /// Look up by configuration name (case-insensitive).
    pub fn lookup(name: &str) -> CryptoResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Ok(CipherAlg::None),
            "AES-128-CBC" => Ok(CipherAlg::Aes128Cbc),
            "AES-192-CBC" => Ok(CipherAlg::Aes192Cbc),
            "AES-256-CBC" => Ok(CipherAlg::Aes256Cbc),
            "AES-128-GCM" => Ok(CipherAlg::Aes128Gcm),
            "AES-192-GCM" => Ok(CipherAlg::Aes192Gcm),
            "AES-256-GCM" => Ok(CipherAlg::Aes256Gcm),
            "BF-CBC" => Ok(CipherAlg::BfCbc),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherAlg::None => "none",
            CipherAlg::Aes128Cbc => "AES-128-CBC",
            CipherAlg::Aes192Cbc => "AES-192-CBC",
            CipherAlg::Aes256Cbc => "AES-256-CBC",
            CipherAlg::Aes128Gcm => "AES-128-GCM",
            CipherAlg::Aes192Gcm => "AES-192-GCM",
            CipherAlg::Aes256Gcm => "AES-256-GCM",
            CipherAlg::BfCbc => "BF-CBC",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherAlg::None => 0,
            CipherAlg::Aes128Cbc | CipherAlg::Aes128Gcm => 16,
            CipherAlg::Aes192Cbc | CipherAlg::Aes192Gcm => 24,
            CipherAlg::Aes256Cbc | CipherAlg::Aes256Gcm => 32,
            CipherAlg::BfCbc => 16,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlg::None => 0,
            CipherAlg::Aes128Gcm | CipherAlg::Aes192Gcm | CipherAlg::Aes256Gcm => 12,
            CipherAlg::BfCbc => 8,
            _ => 16,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            CipherAlg::None => 0,
            CipherAlg::BfCbc => 8,
            _ => 16,
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlg::Aes128Gcm | CipherAlg::Aes192Gcm | CipherAlg::Aes256Gcm
        )
    }

    /// 64-bit block-size ciphers need per-key data limits (CVE-2016-6329).
    pub fn is_bs64(&self) -> bool {
        self.block_size() == 8
    }
}

/// HMAC digest algorithms for tls-auth and the CBC data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlg {
    None,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlg {
    pub fn lookup(name: &str) -> CryptoResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Ok(DigestAlg::None),
            "MD5" => Ok(DigestAlg::Md5),
            "SHA1" => Ok(DigestAlg::Sha1),
            "SHA256" => Ok(DigestAlg::Sha256),
            "SHA512" => Ok(DigestAlg::Sha512),
            _ => Err(CryptoError::UnknownAlgorithm(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlg::None => "none",
            DigestAlg::Md5 => "MD5",
            DigestAlg::Sha1 => "SHA1",
            DigestAlg::Sha256 => "SHA256",
            DigestAlg::Sha512 => "SHA512",
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            DigestAlg::None => 0,
            DigestAlg::Md5 => 16,
            DigestAlg::Sha1 => 20,
            DigestAlg::Sha256 => 32,
            DigestAlg::Sha512 => 64,
        }
    }
}
