//! # ovpn-core
//!
//! Foundation types for the ovpn protocol engine:
//! - opcode tables and the fixed protocol magics
//! - a host-driven virtual clock (no system time in the engine)
//! - packet-ID counters and replay windows
//! - the line-oriented configuration directive parser
//! - session error counters
//!
//! Everything here is transport- and crypto-agnostic; the engine
//! proper lives in `ovpn-proto`.

pub mod buf;
pub mod constants;
pub mod options;
pub mod pid;
pub mod stats;
pub mod time;

pub use buf::*;
pub use constants::*;
pub use options::*;
pub use pid::*;
pub use stats::*;
pub use time::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buf::*;
    pub use crate::constants::*;
    pub use crate::options::*;
    pub use crate::pid::*;
    pub use crate::stats::*;
    pub use crate::time::*;
}
