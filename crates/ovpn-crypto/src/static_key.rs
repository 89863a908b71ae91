//! OpenVPN static key material.
//!
//! A static key block is 256 bytes laid out as four 64-byte slots:
//! cipher-encrypt, hmac-encrypt, cipher-decrypt, hmac-decrypt. One
//! endpoint reads the slots as written (NORMAL) and its peer reads
//! them with the directions flipped (INVERSE), so both sides agree
//! on which key encrypts which direction.

use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::errors::{CryptoError, CryptoResult};

/// Directional slice selectors for [`OpenVpnStaticKey::slice`].
pub mod key_dir {
    pub const CIPHER: u8 = 0;
    pub const HMAC: u8 = 1 << 0;
    pub const ENCRYPT: u8 = 0;
    pub const DECRYPT: u8 = 1 << 1;
    pub const NORMAL: u8 = 0;
    pub const INVERSE: u8 = 1 << 2;
}

/// One 64-byte key slot, zeroized on drop.
#[derive(Clone)]
pub struct StaticKey(Zeroizing<Vec<u8>>);

impl StaticKey {
    pub fn new(data: &[u8]) -> Self {
        Self(Zeroizing::new(data.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Leading `n` bytes, erroring if the slot is too small.
    pub fn truncated(&self, n: usize) -> CryptoResult<&[u8]> {
        self.0.get(..n).ok_or(CryptoError::BadKeyLength {
            got: self.0.len(),
            need: n,
        })
    }
}

impl std::fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StaticKey({} bytes)", self.0.len())
    }
}

/// Size of a full static key block.
pub const STATIC_KEY_SIZE: usize = 256;

const SLOT_SIZE: usize = 64;

const PEM_HEAD: &str = "-----BEGIN OpenVPN Static key V1-----";
const PEM_FOOT: &str = "-----END OpenVPN Static key V1-----";

/// A 256-byte static key block as produced by `--genkey`.
pub struct OpenVpnStaticKey([u8; STATIC_KEY_SIZE]);

impl OpenVpnStaticKey {
    /// Generate a fresh random key block.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        let mut data = [0u8; STATIC_KEY_SIZE];
        rng.fill_bytes(&mut data);
        Self(data)
    }

    pub fn from_bytes(data: [u8; STATIC_KEY_SIZE]) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; STATIC_KEY_SIZE] {
        &self.0
    }

    /// Select one directional 64-byte slot.
    pub fn slice(&self, flags: u8) -> StaticKey {
        // INVERSE flips which direction a slot serves
        static KEY_TABLE: [usize; 8] = [0, 1, 2, 3, 2, 3, 0, 1];
        let index = KEY_TABLE[(flags & 0x07) as usize];
        StaticKey::new(&self.0[index * SLOT_SIZE..(index + 1) * SLOT_SIZE])
    }

    /// Parse the `-----BEGIN OpenVPN Static key V1-----` text form.
    /// Header and footer lines are optional so inline config blocks
    /// parse the same way as key files.
    pub fn parse(text: &str) -> CryptoResult<Self> {
        let mut hex_body = String::with_capacity(STATIC_KEY_SIZE * 2);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line == PEM_HEAD || line == PEM_FOOT || line.starts_with('#') {
                continue;
            }
            hex_body.push_str(line);
        }
        let bytes = hex::decode(&hex_body)
            .map_err(|e| CryptoError::KeyParse(format!("bad hex: {e}")))?;
        if bytes.len() != STATIC_KEY_SIZE {
            return Err(CryptoError::KeyParse(format!(
                "key body is {} bytes, expected {}",
                bytes.len(),
                STATIC_KEY_SIZE
            )));
        }
        let mut data = [0u8; STATIC_KEY_SIZE];
        data.copy_from_slice(&bytes);
        Ok(Self(data))
    }

    /// Render the text form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(PEM_HEAD);
        out.push('\n');
        for chunk in self.0.chunks(16) {
            out.push_str(&hex::encode(chunk));
            out.push('\n');
        }
        out.push_str(PEM_FOOT);
        out.push('\n');
        out
    }
}

impl Drop for OpenVpnStaticKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for OpenVpnStaticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpenVpnStaticKey(256 bytes)")
    }
}

#[cfg(test)]
mod tests {
    use super::key_dir::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_key() -> OpenVpnStaticKey {
        let mut data = [0u8; STATIC_KEY_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / SLOT_SIZE) as u8;
        }
        OpenVpnStaticKey::from_bytes(data)
    }

    #[test]
    fn test_slice_slots() {
        let key = test_key();
        assert_eq!(key.slice(CIPHER | ENCRYPT | NORMAL).as_bytes()[0], 0);
        assert_eq!(key.slice(HMAC | ENCRYPT | NORMAL).as_bytes()[0], 1);
        assert_eq!(key.slice(CIPHER | DECRYPT | NORMAL).as_bytes()[0], 2);
        assert_eq!(key.slice(HMAC | DECRYPT | NORMAL).as_bytes()[0], 3);
    }

    #[test]
    fn test_inverse_flips_direction() {
        let key = test_key();
        // one side's encrypt slot is the other side's decrypt slot
        assert_eq!(
            key.slice(CIPHER | ENCRYPT | NORMAL).as_bytes(),
            key.slice(CIPHER | DECRYPT | INVERSE).as_bytes()
        );
        assert_eq!(
            key.slice(HMAC | DECRYPT | NORMAL).as_bytes(),
            key.slice(HMAC | ENCRYPT | INVERSE).as_bytes()
        );
    }

    #[test]
    fn test_parse_render_roundtrip() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = OpenVpnStaticKey::random(&mut rng);
        let text = key.render();
        assert!(text.starts_with(PEM_HEAD));
        let parsed = OpenVpnStaticKey::parse(&text).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_parse_without_pem_lines() {
        let key = test_key();
        let body: String = key
            .as_bytes()
            .chunks(32)
            .map(|c| format!("{}\n", hex::encode(c)))
            .collect();
        let parsed = OpenVpnStaticKey::parse(&body).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_parse_bad_length() {
        let err = OpenVpnStaticKey::parse("aabbcc\n").unwrap_err();
        assert!(matches!(err, CryptoError::KeyParse(_)));
    }

    #[test]
    fn test_truncated() {
        let key = test_key().slice(CIPHER | ENCRYPT | NORMAL);
        assert_eq!(key.truncated(16).unwrap().len(), 16);
        assert!(key.truncated(65).is_err());
    }
}
