//! Engine Error Types

use thiserror::Error;

use ovpn_core::buf::BufferError;
use ovpn_core::options::OptionError;
use ovpn_crypto::CryptoError;

/// Errors surfaced by the protocol engine. Per-packet failures on a
/// datagram transport are counted in `SessionStats` instead of being
/// returned; these variants cover configuration problems and
/// conditions that abort an operation.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Configuration directive problem; aborts initialization
    #[error("option error: {0}")]
    Options(#[from] OptionError),

    /// Key material or algorithm setup problem
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet parse underrun
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Auth record does not start with the key-method 2 prefix
    #[error("bad auth prefix")]
    BadAuthPrefix,

    /// Assembled control message exceeds APP_MSG_MAX
    #[error("control message too large")]
    AppMsgTooLarge,

    /// Auth string exceeds the 16-bit length field
    #[error("auth string overflow")]
    AuthStringOverflow,

    /// Need to send ACKs but the peer session ID is still unknown
    #[error("peer PSID undefined")]
    PeerPsidUndefined,

    /// Operation requires a primary key context
    #[error("no primary key context")]
    NoPrimary,

    /// Received packet does not match any live key context
    #[error("no key context for packet")]
    SelectKeyContext,

    /// TLS stream failure reported by the handshake engine
    #[error("tls: {0}")]
    Tls(String),

    /// Server-pushed option rejected
    #[error("server push rejected: {0}")]
    ServerPush(String),
}

/// Result type for engine operations
pub type ProtoResult<T> = Result<T, ProtoError>;
