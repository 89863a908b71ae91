//! Protocol session IDs.
//!
//! Each endpoint instance identifies itself with 8 random bytes
//! drawn at session reset. The peer's ID is learned from its first
//! control packet and must match on every packet after that.

use rand::RngCore;

use ovpn_core::buf::{BufResult, Reader};

/// Size of a session ID on the wire.
pub const PSID_SIZE: usize = 8;

/// 8-byte random endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtoSessionId([u8; PSID_SIZE]);

impl ProtoSessionId {
    /// Draw a fresh ID from a cryptographic RNG.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        let mut id = [0u8; PSID_SIZE];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; PSID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn read(r: &mut Reader<'_>) -> BufResult<Self> {
        Ok(Self(r.array()?))
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    pub fn as_bytes(&self) -> &[u8; PSID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for ProtoSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
