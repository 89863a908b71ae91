//! Data-channel crypto instances.
//!
//! One instance per key context, built after key expansion. Three
//! wire layouts:
//!
//! ```text
//! AEAD (AES-GCM):  [pid 4][tag 16][ciphertext]
//!                  nonce = pid || implicit tail, AD = op header || pid
//! CBC+HMAC:        [hmac][iv][ciphertext]     hmac over iv||ciphertext
//!                  plaintext = [pid 4][payload], PKCS#7 padding
//! null:            [pid 4][payload]
//! ```
//!
//! The op header is only authenticated in AEAD mode, where the caller
//! passes the 4-byte DATA_V2 head as additional data.

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use blowfish::Blowfish;
use cipher::block_padding::Pkcs7;
use cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use rand::RngCore;

use ovpn_core::buf::Reader;
use ovpn_core::pid::{PacketId, PacketIdSend, PidForm, PidMode, ReplayWindow};
use ovpn_core::stats::ErrorCode;

use crate::algs::{CipherAlg, DigestAlg};
use crate::errors::{CryptoError, CryptoResult};
use crate::ovpn_hmac::mac_parts;
use crate::static_key::StaticKey;

use hmac::Hmac;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Capability flags reported by a crypto instance.
pub mod crypto_flags {
    pub const CIPHER_DEFINED: u32 = 1 << 0;
    pub const HMAC_DEFINED: u32 = 1 << 1;
    pub const CRYPTO_DEFINED: u32 = 1 << 2;
}

/// Key lifecycle notifications forwarded from the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyType {
    ActivatePrimary,
    NewSecondary,
    PromoteSecondaryToPrimary,
    DeactivateSecondary,
    DeactivateAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DcMode {
    Null,
    CbcHmac,
    Aead,
}

const AEAD_TAG_SIZE: usize = 16;
const AEAD_NONCE_TAIL: usize = 8;
const PID_SIZE: usize = 4;

/// Per-key data-channel cipher/HMAC state.
pub struct DataChannelCrypto {
    cipher: CipherAlg,
    digest: DigestAlg,
    mode: DcMode,
    enc_cipher_key: Option<StaticKey>,
    dec_cipher_key: Option<StaticKey>,
    enc_hmac_key: Option<StaticKey>,
    dec_hmac_key: Option<StaticKey>,
    enc_nonce_tail: [u8; AEAD_NONCE_TAIL],
    dec_nonce_tail: [u8; AEAD_NONCE_TAIL],
    pid_send: PacketIdSend,
    pid_recv: Option<ReplayWindow>,
}

impl DataChannelCrypto {
    pub fn new(cipher: CipherAlg, digest: DigestAlg) -> Self {
        let mode = if cipher == CipherAlg::None {
            DcMode::Null
        } else if cipher.is_aead() {
            DcMode::Aead
        } else {
            DcMode::CbcHmac
        };
        Self {
            cipher,
            digest,
            mode,
            enc_cipher_key: None,
            dec_cipher_key: None,
            enc_hmac_key: None,
            dec_hmac_key: None,
            enc_nonce_tail: [0; AEAD_NONCE_TAIL],
            dec_nonce_tail: [0; AEAD_NONCE_TAIL],
            pid_send: PacketIdSend::new(PidForm::Short),
            pid_recv: None,
        }
    }

    /// Which components this instance wants keyed.
    pub fn defined(&self) -> u32 {
        let mut flags = crypto_flags::CRYPTO_DEFINED;
        if self.cipher != CipherAlg::None {
            flags |= crypto_flags::CIPHER_DEFINED;
        }
        // AEAD consumes the HMAC slices as the implicit nonce tail
        if self.mode == DcMode::Aead || (self.mode == DcMode::CbcHmac && self.digest != DigestAlg::None)
        {
            flags |= crypto_flags::HMAC_DEFINED;
        }
        flags
    }

    pub fn init_cipher(&mut self, enc: StaticKey, dec: StaticKey) -> CryptoResult<()> {
        let need = self.cipher.key_len();
        let enc = StaticKey::new(enc.truncated(need)?);
        let dec = StaticKey::new(dec.truncated(need)?);
        self.enc_cipher_key = Some(enc);
        self.dec_cipher_key = Some(dec);
        Ok(())
    }

    pub fn init_hmac(&mut self, enc: StaticKey, dec: StaticKey) -> CryptoResult<()> {
        match self.mode {
            DcMode::Aead => {
                self.enc_nonce_tail
                    .copy_from_slice(enc.truncated(AEAD_NONCE_TAIL)?);
                self.dec_nonce_tail
                    .copy_from_slice(dec.truncated(AEAD_NONCE_TAIL)?);
            }
            _ => {
                let need = self.digest.output_size();
                self.enc_hmac_key = Some(StaticKey::new(enc.truncated(need)?));
                self.dec_hmac_key = Some(StaticKey::new(dec.truncated(need)?));
            }
        }
        Ok(())
    }

    pub fn init_pid(&mut self, mode: PidMode) {
        self.pid_recv = Some(ReplayWindow::new(mode));
    }

    /// Lifecycle notification; state transitions carry no key
    /// material in this engine, so this only exists for symmetry
    /// with hardware-offload implementations.
    pub fn rekey(&mut self, _rekey_type: RekeyType) {}

    /// Whether the configured compression context may be honored.
    pub fn consider_compression(&self) -> bool {
        true
    }

    /// Worst-case bytes added by encryption, excluding the packet ID.
    pub fn encap_overhead(cipher: CipherAlg, digest: DigestAlg) -> usize {
        if cipher.is_aead() {
            AEAD_TAG_SIZE
        } else if cipher == CipherAlg::None {
            0
        } else {
            digest.output_size() + cipher.iv_len() + cipher.block_size()
        }
    }

    /// Encrypt `buf` in place (payload in, wire format out). Returns
    /// true when the packet-ID counter is near wraparound and a
    /// rekey must be scheduled.
    pub fn encrypt(
        &mut self,
        buf: &mut Vec<u8>,
        now_secs: u32,
        ad_head: Option<[u8; 4]>,
        rng: &mut dyn RngCore,
    ) -> CryptoResult<bool> {
        match self.mode {
            DcMode::Null => {
                let mut out = Vec::with_capacity(PID_SIZE + buf.len());
                let wrap = self.pid_send.write_next(&mut out, now_secs);
                out.extend_from_slice(buf);
                *buf = out;
                Ok(wrap)
            }
            DcMode::CbcHmac => {
                let key = self
                    .enc_cipher_key
                    .as_ref()
                    .ok_or(CryptoError::NotInitialized)?;

                let mut plain = Vec::with_capacity(PID_SIZE + buf.len());
                let wrap = self.pid_send.write_next(&mut plain, now_secs);
                plain.extend_from_slice(buf);

                let mut iv = vec![0u8; self.cipher.iv_len()];
                rng.fill_bytes(&mut iv);

                let ct = cbc_encrypt(self.cipher, key.as_bytes(), &iv, &plain)?;

                let mut out = Vec::with_capacity(
                    self.digest.output_size() + iv.len() + ct.len(),
                );
                if let Some(hmac_key) = &self.enc_hmac_key {
                    out.extend_from_slice(&hmac_tag(self.digest, hmac_key.as_bytes(), &iv, &ct));
                }
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ct);
                *buf = out;
                Ok(wrap)
            }
            DcMode::Aead => {
                let key = self
                    .enc_cipher_key
                    .as_ref()
                    .ok_or(CryptoError::NotInitialized)?;

                let mut pid = Vec::with_capacity(PID_SIZE);
                let wrap = self.pid_send.write_next(&mut pid, now_secs);

                let mut nonce = [0u8; 12];
                nonce[..PID_SIZE].copy_from_slice(&pid);
                nonce[PID_SIZE..].copy_from_slice(&self.enc_nonce_tail);

                let mut ad = Vec::with_capacity(8);
                if let Some(head) = ad_head {
                    ad.extend_from_slice(&head);
                }
                ad.extend_from_slice(&pid);

                let tag = aead_encrypt(self.cipher, key.as_bytes(), &nonce, &ad, buf)?;

                let mut out = Vec::with_capacity(PID_SIZE + AEAD_TAG_SIZE + buf.len());
                out.extend_from_slice(&pid);
                out.extend_from_slice(&tag);
                out.extend_from_slice(buf);
                *buf = out;
                Ok(wrap)
            }
        }
    }

    /// Decrypt `buf` in place (wire format in, payload out).
    pub fn decrypt(
        &mut self,
        buf: &mut Vec<u8>,
        _now_secs: u32,
        ad_head: Option<[u8; 4]>,
    ) -> Result<(), ErrorCode> {
        match self.mode {
            DcMode::Null => {
                let mut r = Reader::new(buf);
                let pid = PacketId::read(&mut r, PidForm::Short)
                    .map_err(|_| ErrorCode::BufferError)?;
                self.check_replay(pid)?;
                let rest = r.rest().to_vec();
                *buf = rest;
                Ok(())
            }
            DcMode::CbcHmac => {
                let key = self
                    .dec_cipher_key
                    .as_ref()
                    .ok_or(ErrorCode::DecryptError)?;
                let hmac_size = if self.dec_hmac_key.is_some() {
                    self.digest.output_size()
                } else {
                    0
                };
                let iv_len = self.cipher.iv_len();
                if buf.len() < hmac_size + iv_len + self.cipher.block_size() {
                    return Err(ErrorCode::BufferError);
                }
                let (mac, rest) = buf.split_at(hmac_size);
                let (iv, ct) = rest.split_at(iv_len);
                if ct.len() % self.cipher.block_size() != 0 {
                    return Err(ErrorCode::BufferError);
                }
                if let Some(hmac_key) = &self.dec_hmac_key {
                    let expect = hmac_tag(self.digest, hmac_key.as_bytes(), iv, ct);
                    if !bool::from(expect.ct_eq(mac)) {
                        return Err(ErrorCode::HmacError);
                    }
                }
                let plain = cbc_decrypt(self.cipher, key.as_bytes(), iv, ct)
                    .map_err(|_| ErrorCode::DecryptError)?;

                let mut r = Reader::new(&plain);
                let pid = PacketId::read(&mut r, PidForm::Short)
                    .map_err(|_| ErrorCode::DecryptError)?;
                self.check_replay(pid)?;
                let payload = r.rest().to_vec();
                *buf = payload;
                Ok(())
            }
            DcMode::Aead => {
                let key = self
                    .dec_cipher_key
                    .as_ref()
                    .ok_or(ErrorCode::DecryptError)?;
                let mut r = Reader::new(buf);
                let pid_bytes: [u8; PID_SIZE] =
                    r.array().map_err(|_| ErrorCode::BufferError)?;
                let tag: [u8; AEAD_TAG_SIZE] =
                    r.array().map_err(|_| ErrorCode::BufferError)?;
                let mut ct = r.rest().to_vec();

                let mut nonce = [0u8; 12];
                nonce[..PID_SIZE].copy_from_slice(&pid_bytes);
                nonce[PID_SIZE..].copy_from_slice(&self.dec_nonce_tail);

                let mut ad = Vec::with_capacity(8);
                if let Some(head) = ad_head {
                    ad.extend_from_slice(&head);
                }
                ad.extend_from_slice(&pid_bytes);

                aead_decrypt(self.cipher, key.as_bytes(), &nonce, &ad, &mut ct, &tag)
                    .map_err(|_| ErrorCode::DecryptError)?;

                let pid = PacketId {
                    id: u32::from_be_bytes(pid_bytes),
                    time: 0,
                };
                self.check_replay(pid)?;
                *buf = ct;
                Ok(())
            }
        }
    }

    fn check_replay(&mut self, pid: PacketId) -> Result<(), ErrorCode> {
        if let Some(window) = &mut self.pid_recv {
            if !window.test_add(pid, true) {
                return Err(ErrorCode::ReplayError);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataChannelCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DataChannelCrypto({}/{})",
            self.cipher.name(),
            self.digest.name()
        )
    }
}

fn hmac_tag(digest: DigestAlg, key: &[u8], iv: &[u8], ct: &[u8]) -> Vec<u8> {
    let parts: [&[u8]; 2] = [iv, ct];
    match digest {
        DigestAlg::Md5 => mac_parts::<Hmac<Md5>>(key, &parts),
        DigestAlg::Sha1 => mac_parts::<Hmac<Sha1>>(key, &parts),
        DigestAlg::Sha256 => mac_parts::<Hmac<Sha256>>(key, &parts),
        DigestAlg::Sha512 => mac_parts::<Hmac<Sha512>>(key, &parts),
        DigestAlg::None => Vec::new(),
    }
}

fn cbc_enc<C>(key: &[u8], iv: &[u8], plain: &[u8]) -> CryptoResult<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let core = C::new_from_slice(key).map_err(|_| CryptoError::EncryptFailed)?;
    let enc =
        cbc::Encryptor::<C>::inner_iv_slice_init(core, iv).map_err(|_| CryptoError::EncryptFailed)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plain))
}

fn cbc_dec<C>(key: &[u8], iv: &[u8], ct: &[u8]) -> CryptoResult<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let core = C::new_from_slice(key).map_err(|_| CryptoError::DecryptFailed)?;
    let dec =
        cbc::Decryptor::<C>::inner_iv_slice_init(core, iv).map_err(|_| CryptoError::DecryptFailed)?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ct)
        .map_err(|_| CryptoError::DecryptFailed)
}

fn cbc_encrypt(alg: CipherAlg, key: &[u8], iv: &[u8], plain: &[u8]) -> CryptoResult<Vec<u8>> {
    match alg {
        CipherAlg::Aes128Cbc => cbc_enc::<Aes128>(key, iv, plain),
        CipherAlg::Aes192Cbc => cbc_enc::<Aes192>(key, iv, plain),
        CipherAlg::Aes256Cbc => cbc_enc::<Aes256>(key, iv, plain),
        CipherAlg::BfCbc => cbc_enc::<Blowfish>(key, iv, plain),
        _ => Err(CryptoError::NotInitialized),
    }
}

fn cbc_decrypt(alg: CipherAlg, key: &[u8], iv: &[u8], ct: &[u8]) -> CryptoResult<Vec<u8>> {
    match alg {
        CipherAlg::Aes128Cbc => cbc_dec::<Aes128>(key, iv, ct),
        CipherAlg::Aes192Cbc => cbc_dec::<Aes192>(key, iv, ct),
        CipherAlg::Aes256Cbc => cbc_dec::<Aes256>(key, iv, ct),
        CipherAlg::BfCbc => cbc_dec::<Blowfish>(key, iv, ct),
        _ => Err(CryptoError::NotInitialized),
    }
}

fn aead_encrypt(
    alg: CipherAlg,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
) -> CryptoResult<[u8; AEAD_TAG_SIZE]> {
    fn run<A: AeadInPlace + KeyInit>(
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        data: &mut [u8],
    ) -> CryptoResult<[u8; AEAD_TAG_SIZE]> {
        let cipher = A::new_from_slice(key).map_err(|_| CryptoError::EncryptFailed)?;
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, data)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut out = [0u8; AEAD_TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }
    match alg {
        CipherAlg::Aes128Gcm => run::<Aes128Gcm>(key, nonce, aad, data),
        CipherAlg::Aes192Gcm => run::<Aes192Gcm>(key, nonce, aad, data),
        CipherAlg::Aes256Gcm => run::<Aes256Gcm>(key, nonce, aad, data),
        _ => Err(CryptoError::NotInitialized),
    }
}

fn aead_decrypt(
    alg: CipherAlg,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> CryptoResult<()> {
    fn run<A: AeadInPlace + KeyInit>(
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        data: &mut [u8],
        tag: &[u8],
    ) -> CryptoResult<()> {
        let cipher = A::new_from_slice(key).map_err(|_| CryptoError::DecryptFailed)?;
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                data,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }
    match alg {
        CipherAlg::Aes128Gcm => run::<Aes128Gcm>(key, nonce, aad, data, tag),
        CipherAlg::Aes192Gcm => run::<Aes192Gcm>(key, nonce, aad, data, tag),
        CipherAlg::Aes256Gcm => run::<Aes256Gcm>(key, nonce, aad, data, tag),
        _ => Err(CryptoError::NotInitialized),
    }
}
