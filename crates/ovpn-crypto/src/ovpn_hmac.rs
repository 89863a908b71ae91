//! Control-channel HMAC (tls-auth).
//!
//! Every control packet carries an HMAC keyed by a pre-shared static
//! key, giving cheap early rejection of junk before any TLS work.
//! The in-packet layout is `[header][hmac][packet-id][payload]` but
//! the HMAC input is ordered `packet-id, header, payload`.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::algs::DigestAlg;
use crate::errors::{CryptoError, CryptoResult};
use crate::static_key::StaticKey;

pub(crate) fn mac_parts<M>(key: &[u8], parts: &[&[u8]]) -> Vec<u8>
where
    M: Mac + KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// HMAC instance for one direction of the control channel.
pub struct OvpnHmac {
    alg: DigestAlg,
    key: StaticKey,
}

impl OvpnHmac {
    /// Key material is truncated to the digest output size, matching
    /// the wire format of the reference implementation.
    pub fn new(alg: DigestAlg, key_slice: &StaticKey) -> CryptoResult<Self> {
        if alg == DigestAlg::None {
            return Err(CryptoError::NotInitialized);
        }
        let key = StaticKey::new(key_slice.truncated(alg.output_size())?);
        Ok(Self { alg, key })
    }

    pub fn output_size(&self) -> usize {
        self.alg.output_size()
    }

    fn compute(&self, parts: &[&[u8]]) -> Vec<u8> {
        let key = self.key.as_bytes();
        match self.alg {
            DigestAlg::Md5 => mac_parts::<Hmac<Md5>>(key, parts),
            DigestAlg::Sha1 => mac_parts::<Hmac<Sha1>>(key, parts),
            DigestAlg::Sha256 => mac_parts::<Hmac<Sha256>>(key, parts),
            DigestAlg::Sha512 => mac_parts::<Hmac<Sha512>>(key, parts),
            DigestAlg::None => unreachable!("rejected in constructor"),
        }
    }

    fn split<'a>(
        &self,
        data: &'a [u8],
        l1: usize,
        l2: usize,
    ) -> CryptoResult<(&'a [u8], &'a [u8], &'a [u8], &'a [u8])> {
        let hs = self.output_size();
        if data.len() < l1 + hs + l2 {
            return Err(CryptoError::DecryptFailed);
        }
        let head = &data[..l1];
        let hmac = &data[l1..l1 + hs];
        let pid = &data[l1 + hs..l1 + hs + l2];
        let payload = &data[l1 + hs + l2..];
        Ok((head, hmac, pid, payload))
    }

    /// Fill the HMAC hole of an assembled packet. `l1` is the header
    /// size (opcode + PSID), `l2` the packet-id size.
    pub fn sign(&self, data: &mut [u8], l1: usize, l2: usize) -> CryptoResult<()> {
        let (head, _, pid, payload) = self.split(data, l1, l2)?;
        let digest = self.compute(&[pid, head, payload]);
        let hs = digest.len();
        data[l1..l1 + hs].copy_from_slice(&digest);
        Ok(())
    }

    /// Verify the HMAC of a received packet; constant-time compare.
    pub fn verify(&self, data: &[u8], l1: usize, l2: usize) -> bool {
        match self.split(data, l1, l2) {
            Ok((head, hmac, pid, payload)) => {
                let digest = self.compute(&[pid, head, payload]);
                digest.ct_eq(hmac).into()
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for OvpnHmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OvpnHmac({})", self.alg.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hmac() -> OvpnHmac {
        let key = StaticKey::new(&[0x5a; 64]);
        OvpnHmac::new(DigestAlg::Sha1, &key).unwrap()
    }

    fn build_packet(hmac: &OvpnHmac, l1: usize, l2: usize, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(std::iter::repeat(0x11).take(l1));
        data.extend(std::iter::repeat(0x00).take(hmac.output_size()));
        data.extend(std::iter::repeat(0x22).take(l2));
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_sign_verify() {
        let hmac = test_hmac();
        let mut pkt = build_packet(&hmac, 9, 8, b"payload bytes");
        hmac.sign(&mut pkt, 9, 8).unwrap();
        assert!(hmac.verify(&pkt, 9, 8));
    }

    #[test]
    fn test_tamper_detected() {
        let hmac = test_hmac();
        let mut pkt = build_packet(&hmac, 9, 8, b"payload bytes");
        hmac.sign(&mut pkt, 9, 8).unwrap();

        for pos in [0usize, 5, 9 + 20, 9 + 20 + 8] {
            let mut bad = pkt.clone();
            bad[pos] ^= 0x01;
            assert!(!hmac.verify(&bad, 9, 8), "flip at {pos} not caught");
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let hmac = test_hmac();
        let other = OvpnHmac::new(DigestAlg::Sha1, &StaticKey::new(&[0xa5; 64])).unwrap();
        let mut pkt = build_packet(&hmac, 9, 8, b"data");
        hmac.sign(&mut pkt, 9, 8).unwrap();
        assert!(!other.verify(&pkt, 9, 8));
    }

    #[test]
    fn test_short_packet() {
        let hmac = test_hmac();
        assert!(!hmac.verify(&[0u8; 10], 9, 8));
        let mut short = vec![0u8; 10];
        assert!(hmac.sign(&mut short, 9, 8).is_err());
    }

    #[test]
    fn test_none_digest_rejected() {
        let key = StaticKey::new(&[0; 64]);
        assert!(OvpnHmac::new(DigestAlg::None, &key).is_err());
    }
}
