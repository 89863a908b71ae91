//! Session error accounting.
//!
//! Per-packet failures on a datagram transport are counted, not
//! fatal; the host reads the counters to decide on reconnects and
//! for diagnostics.

use std::fmt;

/// Error kinds tracked over the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorCode {
    /// Packet too short or malformed for its framing.
    BufferError,
    /// tls-auth or data-channel HMAC verification failed.
    HmacError,
    /// Packet ID already seen or below the window.
    ReplayError,
    /// Data-channel decrypt failed.
    DecryptError,
    /// Control-channel semantic violation (e.g. PSID mismatch).
    CcError,
    /// No authenticated packet from peer within keepalive_timeout.
    KeepaliveTimeout,
    /// SSL/TLS negotiation did not complete within handshake_window.
    HandshakeTimeout,
    /// Primary key expired with no live secondary.
    PrimaryExpire,
    /// Renegotiation triggered by a per-key data limit or ID wrap.
    KeyLimitReneg,
    /// KEV_NEGOTIATE deadline hit on a key context.
    KevNegotiate,
    /// KEV_PRIMARY_PENDING deadline hit without peer dataflow.
    KevPendingTimeout,
    /// KEV_EXPIRE fired on a key context.
    KevExpire,
}

const N_ERROR_CODES: usize = 12;

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::BufferError => "BUFFER_ERROR",
            ErrorCode::HmacError => "HMAC_ERROR",
            ErrorCode::ReplayError => "REPLAY_ERROR",
            ErrorCode::DecryptError => "DECRYPT_ERROR",
            ErrorCode::CcError => "CC_ERROR",
            ErrorCode::KeepaliveTimeout => "KEEPALIVE_TIMEOUT",
            ErrorCode::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            ErrorCode::PrimaryExpire => "PRIMARY_EXPIRE",
            ErrorCode::KeyLimitReneg => "N_KEY_LIMIT_RENEG",
            ErrorCode::KevNegotiate => "KEV_NEGOTIATE_ERROR",
            ErrorCode::KevPendingTimeout => "KEV_PENDING_ERROR",
            ErrorCode::KevExpire => "N_KEV_EXPIRE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One counter per error code.
#[derive(Debug, Default)]
pub struct SessionStats {
    counters: [u64; N_ERROR_CODES],
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence of `code`.
    pub fn error(&mut self, code: ErrorCode) {
        self.counters[code as usize] += 1;
    }

    /// Number of times `code` has occurred.
    pub fn get(&self, code: ErrorCode) -> u64 {
        self.counters[code as usize]
    }

    /// Total errors of any kind.
    pub fn total(&self) -> u64 {
        self.counters.iter().sum()
    }
}
