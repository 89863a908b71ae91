//! # ovpn-proto
//!
//! OpenVPN-compatible session engine (wire protocol 2.x,
//! key-method 2): a reliable, authenticated control channel and an
//! encrypted data channel multiplexed over one datagram or stream
//! transport, usable symmetrically on client and server endpoints.
//!
//! ## Protocol flow
//!
//! ```text
//! Client                                        Server
//!   |-- HARD_RESET_CLIENT_V2 ------------------->|
//!   |<------------- HARD_RESET_SERVER_V2 + ack --|
//!   |-- ack, TLS handshake over CONTROL_V1 ----->|
//!   |<-- auth record (TLS-PRF randomness) ------>|
//!   |== data channel keyed from TLS-PRF =========|
//!   |<-- DATA_V1/DATA_V2 packets --------------->|
//!   |-- SOFT_RESET_V1 (renegotiation) ---------->|
//! ```
//!
//! The engine is single-threaded and never blocks or owns a socket:
//! the host feeds packets in, collects packets from the
//! `control_net_send` callback, and ticks `housekeeping()` at the
//! time returned by `next_housekeeping()`. The TLS handshake engine
//! and the tun device are external collaborators behind traits.

pub mod comp;
pub mod config;
pub mod datalimit;
pub mod errors;
pub mod key_context;
pub mod key_method;
pub mod packet;
pub mod proto;
pub mod psid;
pub mod reliable;
pub mod tls;

pub use comp::*;
pub use config::*;
pub use datalimit::*;
pub use errors::*;
pub use key_context::KeyEvent;
pub use key_method::*;
pub use packet::*;
pub use proto::*;
pub use psid::*;
pub use reliable::{MsgId, ReliableRecv, ReliableSend};
pub use tls::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::packet::*;
    pub use crate::proto::*;
    pub use crate::psid::*;
    pub use crate::tls::*;
    pub use ovpn_core::prelude::*;
    pub use ovpn_crypto::prelude::*;
}
