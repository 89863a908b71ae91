//! TLS 1.0 PRF and key-method 2 key expansion.
//!
//! The data channel is keyed from randomness exchanged inside the
//! TLS session: the client contributes a 48-byte pre-master plus two
//! 32-byte randoms, the server two 32-byte randoms. Both sides run
//! the TLS 1.0 PRF (P_MD5 xor P_SHA1 over split secret halves) to
//! derive a master secret and then the 256-byte static key block,
//! mixing in both session IDs.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ovpn_core::buf::Reader;

use crate::errors::{CryptoError, CryptoResult};
use crate::static_key::{OpenVpnStaticKey, STATIC_KEY_SIZE};

const PRE_MASTER_SIZE: usize = 48;
const RANDOM_SIZE: usize = 32;
const MASTER_SECRET_SIZE: usize = 48;

const MASTER_SECRET_LABEL: &[u8] = b"OpenVPN master secret";
const KEY_EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

// P_hash per RFC 2246 section 5, XORed into `out` so that calling it
// once per half-secret yields the combined PRF output.
fn p_hash_xor<M>(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8])
where
    M: Mac + KeyInit,
{
    let mut a = {
        let mut mac = <M as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(label);
        mac.update(seed);
        mac.finalize().into_bytes()
    };

    let mut pos = 0;
    while pos < out.len() {
        let mut mac = <M as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&a);
        mac.update(label);
        mac.update(seed);
        let chunk = mac.finalize().into_bytes();

        let n = chunk.len().min(out.len() - pos);
        for (dst, src) in out[pos..pos + n].iter_mut().zip(chunk.iter()) {
            *dst ^= src;
        }
        pos += n;

        let mut mac = <M as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }
}

/// TLS 1.0 PRF: split the secret into two (overlapping) halves, run
/// P_MD5 over the first and P_SHA1 over the second, XOR the streams.
pub fn tls1_prf(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) {
    out.fill(0);
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];
    p_hash_xor::<Hmac<Md5>>(s1, label, seed, out);
    p_hash_xor::<Hmac<Sha1>>(s2, label, seed, out);
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct PrfData {
    pre_master: [u8; PRE_MASTER_SIZE],
    random1: [u8; RANDOM_SIZE],
    random2: [u8; RANDOM_SIZE],
    initialized: bool,
}

impl Default for PrfData {
    fn default() -> Self {
        Self {
            pre_master: [0; PRE_MASTER_SIZE],
            random1: [0; RANDOM_SIZE],
            random2: [0; RANDOM_SIZE],
            initialized: false,
        }
    }
}

/// Per-key-context PRF state: our randomness plus the peer's.
pub struct TlsPrf {
    server: bool,
    self_data: PrfData,
    peer_data: PrfData,
}

impl TlsPrf {
    pub fn new(server: bool) -> Self {
        Self {
            server,
            self_data: PrfData::default(),
            peer_data: PrfData::default(),
        }
    }

    /// Draw our contribution from the RNG. The pre-master is only
    /// generated on the client.
    pub fn self_randomize(&mut self, rng: &mut dyn RngCore) {
        if !self.server {
            rng.fill_bytes(&mut self.self_data.pre_master);
        }
        rng.fill_bytes(&mut self.self_data.random1);
        rng.fill_bytes(&mut self.self_data.random2);
        self.self_data.initialized = true;
    }

    /// Serialize our contribution into the auth record.
    pub fn self_write(&self, buf: &mut Vec<u8>) -> CryptoResult<()> {
        if !self.self_data.initialized {
            return Err(CryptoError::NotInitialized);
        }
        if !self.server {
            buf.extend_from_slice(&self.self_data.pre_master);
        }
        buf.extend_from_slice(&self.self_data.random1);
        buf.extend_from_slice(&self.self_data.random2);
        Ok(())
    }

    /// Bytes the peer's contribution occupies in its auth record.
    pub fn peer_input_size(&self) -> usize {
        // the peer sends a pre-master only if it is the client
        if self.server {
            PRE_MASTER_SIZE + 2 * RANDOM_SIZE
        } else {
            2 * RANDOM_SIZE
        }
    }

    /// Parse the peer's contribution out of its auth record.
    pub fn peer_read(&mut self, r: &mut Reader<'_>) -> CryptoResult<()> {
        let take = |r: &mut Reader<'_>, out: &mut [u8]| -> CryptoResult<()> {
            let bytes = r.take(out.len()).map_err(|_| CryptoError::DecryptFailed)?;
            out.copy_from_slice(bytes);
            Ok(())
        };
        if self.server {
            take(r, &mut self.peer_data.pre_master)?;
        }
        take(r, &mut self.peer_data.random1)?;
        take(r, &mut self.peer_data.random2)?;
        self.peer_data.initialized = true;
        Ok(())
    }

    /// Run the two-stage key expansion once both contributions are
    /// present. Session IDs are mixed into the second stage, client
    /// first.
    pub fn generate_key_expansion(
        &self,
        psid_self: &[u8; 8],
        psid_peer: &[u8; 8],
    ) -> CryptoResult<OpenVpnStaticKey> {
        if !self.self_data.initialized || !self.peer_data.initialized {
            return Err(CryptoError::NotInitialized);
        }
        let (client, server) = if self.server {
            (&self.peer_data, &self.self_data)
        } else {
            (&self.self_data, &self.peer_data)
        };
        let (psid_client, psid_server) = if self.server {
            (psid_peer, psid_self)
        } else {
            (psid_self, psid_peer)
        };

        let mut master = [0u8; MASTER_SECRET_SIZE];
        let mut seed = Vec::with_capacity(2 * RANDOM_SIZE);
        seed.extend_from_slice(&client.random1);
        seed.extend_from_slice(&server.random1);
        tls1_prf(&client.pre_master, MASTER_SECRET_LABEL, &seed, &mut master);

        let mut key_block = [0u8; STATIC_KEY_SIZE];
        let mut seed = Vec::with_capacity(2 * RANDOM_SIZE + 16);
        seed.extend_from_slice(&client.random2);
        seed.extend_from_slice(&server.random2);
        seed.extend_from_slice(psid_client);
        seed.extend_from_slice(psid_server);
        tls1_prf(&master, KEY_EXPANSION_LABEL, &seed, &mut key_block);

        master.zeroize();
        Ok(OpenVpnStaticKey::from_bytes(key_block))
    }

    /// Wipe all randomness once the data channel is keyed.
    pub fn erase(&mut self) {
        self.self_data.zeroize();
        self.peer_data.zeroize();
    }
}

impl std::fmt::Debug for TlsPrf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TlsPrf({})",
            if self.server { "server" } else { "client" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_prf_deterministic() {
        let mut out1 = [0u8; 64];
        let mut out2 = [0u8; 64];
        tls1_prf(b"secret", b"label", b"seed", &mut out1);
        tls1_prf(b"secret", b"label", b"seed", &mut out2);
        assert_eq!(out1, out2);

        tls1_prf(b"secret", b"label", b"other seed", &mut out2);
        assert_ne!(out1, out2);
    }

    #[test]
    fn test_prf_rfc_shape() {
        // odd-length secrets must split into overlapping halves
        let mut out = [0u8; 16];
        tls1_prf(b"abc", b"l", b"s", &mut out);
        assert_ne!(out, [0u8; 16]);
    }

    fn exchange() -> (TlsPrf, TlsPrf) {
        let mut rng = StdRng::seed_from_u64(42);
        let mut client = TlsPrf::new(false);
        let mut server = TlsPrf::new(true);
        client.self_randomize(&mut rng);
        server.self_randomize(&mut rng);

        let mut c2s = Vec::new();
        client.self_write(&mut c2s).unwrap();
        assert_eq!(c2s.len(), server.peer_input_size());
        server.peer_read(&mut Reader::new(&c2s)).unwrap();

        let mut s2c = Vec::new();
        server.self_write(&mut s2c).unwrap();
        assert_eq!(s2c.len(), client.peer_input_size());
        client.peer_read(&mut Reader::new(&s2c)).unwrap();

        (client, server)
    }

    #[test]
    fn test_key_expansion_agrees() {
        let (client, server) = exchange();
        let psid_c = [1u8; 8];
        let psid_s = [2u8; 8];

        let ck = client.generate_key_expansion(&psid_c, &psid_s).unwrap();
        let sk = server.generate_key_expansion(&psid_s, &psid_c).unwrap();
        assert_eq!(ck.as_bytes(), sk.as_bytes());
    }

    #[test]
    fn test_key_expansion_binds_psids() {
        let (client, server) = exchange();
        let ck = client.generate_key_expansion(&[1; 8], &[2; 8]).unwrap();
        let sk = server.generate_key_expansion(&[2; 8], &[3; 8]).unwrap();
        assert_ne!(ck.as_bytes(), sk.as_bytes());
    }

    #[test]
    fn test_uninitialized_rejected() {
        let prf = TlsPrf::new(false);
        assert!(prf.generate_key_expansion(&[0; 8], &[0; 8]).is_err());
        let mut buf = Vec::new();
        assert!(prf.self_write(&mut buf).is_err());
    }
}
