//! # ovpn-crypto
//!
//! Key material and data-channel crypto for the ovpn protocol
//! engine:
//! - the 256-byte OpenVPN static key block with directional slices
//! - the TLS 1.0 PRF and key-method 2 key expansion
//! - the tls-auth control-channel HMAC with its packet-id-first
//!   input ordering
//! - data-channel cipher instances: AES-GCM (AEAD), AES/Blowfish-CBC
//!   with HMAC, and a null passthrough
//!
//! The TLS handshake engine itself is out of scope; only its
//! exchanged randomness flows through here.

pub mod algs;
pub mod dc;
pub mod errors;
pub mod ovpn_hmac;
pub mod prf;
pub mod static_key;

pub use algs::*;
pub use dc::*;
pub use errors::*;
pub use ovpn_hmac::OvpnHmac;
pub use prf::{tls1_prf, TlsPrf};
pub use static_key::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::algs::*;
    pub use crate::dc::*;
    pub use crate::errors::*;
    pub use crate::ovpn_hmac::OvpnHmac;
    pub use crate::prf::{tls1_prf, TlsPrf};
    pub use crate::static_key::*;
}
