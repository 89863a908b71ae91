//! Packet-ID sequence numbers and replay protection.
//!
//! The send side is a monotone 32-bit counter, short form (4 bytes)
//! on the data channel and long form (8 bytes, counter + epoch
//! seconds) on the control channel. The receive side is a sliding
//! 64-deep bitmap for datagram transports and a strict-linear check
//! for stream transports.

use crate::buf::{BufResult, Reader};

/// Wire encoding of a packet ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidForm {
    /// 4 bytes: sequence number only (data channel).
    Short,
    /// 8 bytes: sequence number + epoch seconds (control channel).
    Long,
}

impl PidForm {
    pub fn size(&self) -> usize {
        match self {
            PidForm::Short => 4,
            PidForm::Long => 8,
        }
    }
}

/// Replay-window policy for received packet IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidMode {
    /// Sliding bitmap; tolerates reordering (datagram transports).
    Udp,
    /// Strict linear sequence (stream transports).
    Tcp,
}

/// A received or about-to-be-sent packet ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId {
    pub id: u32,
    /// Epoch seconds; zero in short form.
    pub time: u32,
}

impl PacketId {
    /// ID zero is never sent; it marks an unparsed or forged value.
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }

    pub fn read(r: &mut Reader<'_>, form: PidForm) -> BufResult<Self> {
        let id = r.u32()?;
        let time = match form {
            PidForm::Short => 0,
            PidForm::Long => r.u32()?,
        };
        Ok(PacketId { id, time })
    }

    pub fn write(&self, buf: &mut Vec<u8>, form: PidForm) {
        buf.extend_from_slice(&self.id.to_be_bytes());
        if form == PidForm::Long {
            buf.extend_from_slice(&self.time.to_be_bytes());
        }
    }
}

/// Counter nearing this value schedules a rekey before wraparound.
const WRAP_WARN_AT: u32 = 0xFF00_0000;

/// Outbound packet-ID counter.
///
/// The long-form timestamp marks when this ID sequence began; it
/// only moves forward when the 32-bit counter exhausts and restarts,
/// which the receiver reads as a fresh ID epoch.
#[derive(Debug)]
pub struct PacketIdSend {
    id: u32,
    time: u32,
    form: PidForm,
}

impl PacketIdSend {
    pub fn new(form: PidForm) -> Self {
        Self {
            id: 0,
            time: 0,
            form,
        }
    }

    /// Write the next ID into `buf`; returns true when the counter is
    /// close enough to wrapping that a rekey must be scheduled.
    pub fn write_next(&mut self, buf: &mut Vec<u8>, now_secs: u32) -> bool {
        self.id = self.id.wrapping_add(1);
        if self.id == 0 {
            // sequence exhausted: restart under a fresh epoch
            self.time = now_secs;
            self.id = 1;
        } else if self.time == 0 {
            self.time = now_secs;
        }
        let pid = PacketId {
            id: self.id,
            time: self.time,
        };
        pid.write(buf, self.form);
        self.id >= WRAP_WARN_AT
    }

    pub fn current(&self) -> u32 {
        self.id
    }
}

const SEQ_BACKTRACK: u32 = 64;

/// Receive-side replay window.
#[derive(Debug)]
pub struct ReplayWindow {
    mode: PidMode,
    id_high: u32,
    time_high: u32,
    /// Bit n set = id_high - n already seen (UDP mode only).
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new(mode: PidMode) -> Self {
        Self {
            mode,
            id_high: 0,
            time_high: 0,
            bitmap: 0,
        }
    }

    /// Probe whether `pid` would be accepted, and commit it to the
    /// window when `commit` is set. The probe-only form lets callers
    /// defer commitment until the packet passes later checks.
    pub fn test_add(&mut self, pid: PacketId, commit: bool) -> bool {
        if !self.test(pid) {
            return false;
        }
        if commit {
            self.add(pid);
        }
        true
    }

    fn test(&self, pid: PacketId) -> bool {
        if !pid.is_valid() {
            return false;
        }
        match self.mode {
            PidMode::Udp => {
                if pid.time < self.time_high {
                    return false; // packet from an earlier ID epoch
                }
                if pid.time > self.time_high {
                    return true; // time moved forward, counter restarts
                }
                if pid.id > self.id_high {
                    return true;
                }
                let delta = self.id_high - pid.id;
                if delta >= SEQ_BACKTRACK {
                    return false; // below the window low watermark
                }
                self.bitmap & (1u64 << delta) == 0
            }
            PidMode::Tcp => {
                // a stream transport delivers in order; anything else
                // is corruption or replay
                pid.time >= self.time_high && pid.id == self.id_high.wrapping_add(1)
            }
        }
    }

    fn add(&mut self, pid: PacketId) {
        if pid.time > self.time_high {
            self.time_high = pid.time;
            self.id_high = pid.id;
            self.bitmap = 1;
            return;
        }
        match self.mode {
            PidMode::Udp => {
                if pid.id > self.id_high {
                    let shift = pid.id - self.id_high;
                    self.bitmap = if shift >= 64 {
                        0
                    } else {
                        self.bitmap << shift
                    };
                    self.bitmap |= 1;
                    self.id_high = pid.id;
                } else {
                    let delta = self.id_high - pid.id;
                    if delta < 64 {
                        self.bitmap |= 1u64 << delta;
                    }
                }
            }
            PidMode::Tcp => {
                self.id_high = pid.id;
            }
        }
    }
}
