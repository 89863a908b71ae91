//! Per-key data-usage metering for 64-bit block-size ciphers.
//!
//! Ciphers with 8-byte blocks (Blowfish, 3DES) leak plaintext after
//! too much traffic under one key (CVE-2016-6329), so each direction
//! carries a byte counter: Green once the first bytes flow, Red when
//! the limit is crossed and a renegotiation must be scheduled.

/// Traffic direction being metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLimitMode {
    Encrypt,
    Decrypt,
}

/// Meter state, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DataLimitState {
    #[default]
    None,
    /// First bytes processed under this key.
    Green,
    /// Limit exceeded; renegotiate.
    Red,
}

#[derive(Debug, Default)]
struct Meter {
    bytes: u64,
    state: DataLimitState,
}

/// Byte counters for both directions of one key.
#[derive(Debug)]
pub struct DataLimit {
    encrypt_red_limit: u64,
    decrypt_red_limit: u64,
    encrypt: Meter,
    decrypt: Meter,
}

impl DataLimit {
    pub fn new(encrypt_red_limit: u64, decrypt_red_limit: u64) -> Self {
        Self {
            encrypt_red_limit,
            decrypt_red_limit,
            encrypt: Meter::default(),
            decrypt: Meter::default(),
        }
    }

    fn meter_mut(&mut self, mode: DataLimitMode) -> (&mut Meter, u64) {
        match mode {
            DataLimitMode::Encrypt => (&mut self.encrypt, self.encrypt_red_limit),
            DataLimitMode::Decrypt => (&mut self.decrypt, self.decrypt_red_limit),
        }
    }

    /// Count `size` bytes; returns the new state on a transition,
    /// `None` otherwise.
    pub fn add(&mut self, mode: DataLimitMode, size: usize) -> DataLimitState {
        let (meter, limit) = self.meter_mut(mode);
        meter.bytes = meter.bytes.saturating_add(size as u64);
        let target = if meter.bytes > limit {
            DataLimitState::Red
        } else if meter.bytes > 0 {
            DataLimitState::Green
        } else {
            DataLimitState::None
        };
        if target > meter.state {
            meter.state = target;
            target
        } else {
            DataLimitState::None
        }
    }

    /// Merge an externally observed state; returns the merged state.
    pub fn update_state(&mut self, mode: DataLimitMode, state: DataLimitState) -> DataLimitState {
        let (meter, _) = self.meter_mut(mode);
        if state > meter.state {
            meter.state = state;
        }
        meter.state
    }

    /// Has at least one packet been decrypted under this key?
    pub fn is_decrypt_green(&self) -> bool {
        self.decrypt.state >= DataLimitState::Green
    }
}
