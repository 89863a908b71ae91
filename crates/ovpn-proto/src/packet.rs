//! Packet framing and inbound classification.
//!
//! The first byte of every packet carries the opcode in its high 5
//! bits and the key ID in its low 3 bits. DATA_V2 extends the head
//! to 4 bytes, with the low 24 bits carrying the peer ID.

use ovpn_core::constants::*;

/// A control-channel packet travelling through the reliability
/// layer. `buf` holds the payload before encapsulation and the full
/// wire image afterwards.
#[derive(Debug, Clone)]
pub struct Packet {
    pub opcode: u8,
    pub buf: Vec<u8>,
}

impl Packet {
    pub fn new(opcode: u8, buf: Vec<u8>) -> Self {
        Self { opcode, buf }
    }

    /// SSL ciphertext rides in CONTROL_V1; everything else (resets,
    /// ACKs) is a raw protocol message.
    pub fn is_raw(&self) -> bool {
        self.opcode != CONTROL_V1
    }
}

const FLAG_DEFINED: u8 = 1 << 0;
const FLAG_CONTROL: u8 = 1 << 1;
const FLAG_SECONDARY: u8 = 1 << 2;
const FLAG_SOFT_RESET: u8 = 1 << 3;

/// Classification of an inbound packet against the live key
/// contexts. Built by [`classify`]; consumed by the session layer to
/// route the packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketType {
    flags: u8,
    opcode: u8,
    peer_id: i32,
}

impl PacketType {
    pub fn is_defined(&self) -> bool {
        self.flags & FLAG_DEFINED != 0
    }

    pub fn is_control(&self) -> bool {
        self.flags & (FLAG_CONTROL | FLAG_DEFINED) == (FLAG_CONTROL | FLAG_DEFINED)
    }

    pub fn is_data(&self) -> bool {
        self.flags & (FLAG_CONTROL | FLAG_DEFINED) == FLAG_DEFINED
    }

    /// Peer-initiated renegotiation: a soft reset addressed to the
    /// upcoming key ID.
    pub fn is_soft_reset(&self) -> bool {
        let mask = FLAG_CONTROL | FLAG_DEFINED | FLAG_SECONDARY | FLAG_SOFT_RESET;
        self.flags & mask == mask
    }

    pub fn is_secondary(&self) -> bool {
        self.flags & FLAG_SECONDARY != 0
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// DATA_V2 peer ID, -1 when absent or the undefined sentinel.
    pub fn peer_id(&self) -> i32 {
        self.peer_id
    }
}

/// Classify an inbound packet. `primary_kid`/`secondary_kid` are the
/// key IDs of the live contexts; `upcoming_kid` is the ID the next
/// renegotiation will use.
pub fn classify(
    buf: &[u8],
    is_server: bool,
    primary_kid: Option<u8>,
    secondary_kid: Option<u8>,
    upcoming_kid: u8,
) -> PacketType {
    let mut pt = PacketType {
        flags: 0,
        opcode: INVALID_OPCODE,
        peer_id: -1,
    };
    let Some(&op) = buf.first() else {
        return pt;
    };

    match opcode_extract(op) {
        opc @ (CONTROL_SOFT_RESET_V1 | CONTROL_V1 | ACK_V1) => {
            pt.flags |= FLAG_CONTROL;
            pt.opcode = opc;
        }
        DATA_V2 => {
            if buf.len() < OP_SIZE_V2 {
                return pt;
            }
            let opi = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & OP_PEER_ID_UNDEF;
            if opi != OP_PEER_ID_UNDEF {
                pt.peer_id = opi as i32;
            }
            pt.opcode = DATA_V2;
        }
        DATA_V1 => {
            pt.opcode = DATA_V1;
        }
        CONTROL_HARD_RESET_CLIENT_V2 => {
            // only a server accepts a client reset
            if !is_server {
                return pt;
            }
            pt.flags |= FLAG_CONTROL;
            pt.opcode = CONTROL_HARD_RESET_CLIENT_V2;
        }
        CONTROL_HARD_RESET_SERVER_V2 => {
            if is_server {
                return pt;
            }
            pt.flags |= FLAG_CONTROL;
            pt.opcode = CONTROL_HARD_RESET_SERVER_V2;
        }
        _ => return pt,
    }

    let kid = key_id_extract(op);
    if primary_kid == Some(kid) {
        pt.flags |= FLAG_DEFINED;
    } else if secondary_kid == Some(kid) {
        pt.flags |= FLAG_DEFINED | FLAG_SECONDARY;
    } else if pt.opcode == CONTROL_SOFT_RESET_V1 && kid == upcoming_kid {
        pt.flags |= FLAG_DEFINED | FLAG_SECONDARY | FLAG_SOFT_RESET;
    }
    pt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(opcode: u8, kid: u8) -> Vec<u8> {
        vec![op_compose(opcode, kid), 0xaa, 0xbb]
    }

    #[test]
    fn test_zero_length_invalid() {
        let pt = classify(&[], true, Some(0), None, 1);
        assert!(!pt.is_defined());
    }

    #[test]
    fn test_control_primary() {
        let pt = classify(&pkt(CONTROL_V1, 0), false, Some(0), None, 1);
        assert!(pt.is_defined());
        assert!(pt.is_control());
        assert!(!pt.is_data());
        assert!(!pt.is_secondary());
    }

    #[test]
    fn test_data_secondary() {
        let pt = classify(&pkt(DATA_V1, 2), false, Some(0), Some(2), 3);
        assert!(pt.is_data());
        assert!(pt.is_secondary());
    }

    #[test]
    fn test_unknown_key_id_undefined() {
        let pt = classify(&pkt(CONTROL_V1, 5), false, Some(0), Some(1), 2);
        assert!(!pt.is_defined());
    }

    #[test]
    fn test_hard_reset_role_gating() {
        let client_reset = pkt(CONTROL_HARD_RESET_CLIENT_V2, 0);
        assert!(classify(&client_reset, true, Some(0), None, 1).is_defined());
        assert!(!classify(&client_reset, false, Some(0), None, 1).is_defined());

        let server_reset = pkt(CONTROL_HARD_RESET_SERVER_V2, 0);
        assert!(classify(&server_reset, false, Some(0), None, 1).is_defined());
        assert!(!classify(&server_reset, true, Some(0), None, 1).is_defined());
    }

    #[test]
    fn test_soft_reset_upcoming_key() {
        let pt = classify(&pkt(CONTROL_SOFT_RESET_V1, 3), true, Some(2), None, 3);
        assert!(pt.is_soft_reset());
        assert!(pt.is_secondary());

        // soft reset for a dead key id is undefined
        let pt = classify(&pkt(CONTROL_SOFT_RESET_V1, 5), true, Some(2), None, 3);
        assert!(!pt.is_defined());
    }

    #[test]
    fn test_data_v2_peer_id() {
        let mut buf = op32_compose(DATA_V2, 1, 0x0102).to_be_bytes().to_vec();
        buf.push(0xff);
        let pt = classify(&buf, false, Some(1), None, 2);
        assert!(pt.is_data());
        assert_eq!(pt.peer_id(), 0x0102);

        // undefined sentinel maps to -1
        let mut buf = op32_compose(DATA_V2, 1, -1).to_be_bytes().to_vec();
        buf.push(0xff);
        let pt = classify(&buf, false, Some(1), None, 2);
        assert_eq!(pt.peer_id(), -1);

        // truncated DATA_V2 head
        let pt = classify(&buf[..3], false, Some(1), None, 2);
        assert!(!pt.is_defined());
    }
}
