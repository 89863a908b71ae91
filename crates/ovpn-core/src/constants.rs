//! Protocol Constants
//!
//! Opcodes, header composition helpers, and the fixed data-channel
//! magic messages shared by every endpoint.

/// Low 3 bits of the leading byte carry the key ID.
pub const KEY_ID_MASK: u8 = 0x07;

/// High 5 bits of the leading byte carry the opcode.
pub const OPCODE_SHIFT: u8 = 3;

/// New key, graceful transition from old to new key.
pub const CONTROL_SOFT_RESET_V1: u8 = 3;
/// Control channel packet (usually TLS ciphertext).
pub const CONTROL_V1: u8 = 4;
/// Acknowledgement for control packets received.
pub const ACK_V1: u8 = 5;
/// Data channel packet with 1-byte header.
pub const DATA_V1: u8 = 6;
/// Initial key from client, forget previous state (key-method 2).
pub const CONTROL_HARD_RESET_CLIENT_V2: u8 = 7;
/// Initial key from server, forget previous state (key-method 2).
pub const CONTROL_HARD_RESET_SERVER_V2: u8 = 8;
/// Data channel packet with 4-byte header carrying a 24-bit peer ID.
pub const DATA_V2: u8 = 9;

/// Range of legal opcodes.
pub const FIRST_OPCODE: u8 = 3;
pub const LAST_OPCODE: u8 = 9;
pub const INVALID_OPCODE: u8 = 0;

/// Size of the DATA_V2 leading header.
pub const OP_SIZE_V2: usize = 4;

/// Sentinel for an undefined peer ID in the DATA_V2 header.
pub const OP_PEER_ID_UNDEF: u32 = 0x00FF_FFFF;

/// Upper bound on an assembled app-level control message.
pub const APP_MSG_MAX: usize = 65536;

/// Per-key data limit for 64-bit block-size ciphers (CVE-2016-6329).
pub const BS64_DATA_LIMIT: u64 = 48_000_000;

/// Extract the opcode from a leading header byte.
#[inline]
pub fn opcode_extract(op: u8) -> u8 {
    op >> OPCODE_SHIFT
}

/// Extract the key ID from a leading header byte.
#[inline]
pub fn key_id_extract(op: u8) -> u8 {
    op & KEY_ID_MASK
}

/// Compose opcode and key ID into the leading header byte.
#[inline]
pub fn op_compose(opcode: u8, key_id: u8) -> u8 {
    (opcode << OPCODE_SHIFT) | (key_id & KEY_ID_MASK)
}

/// Compose the 32-bit DATA_V2 header: opcode, key ID, 24-bit peer ID.
#[inline]
pub fn op32_compose(opcode: u8, key_id: u8, op_peer_id: i32) -> u32 {
    ((op_compose(opcode, key_id) as u32) << 24) | (op_peer_id as u32 & OP_PEER_ID_UNDEF)
}

/// Size of the leading header for a given header byte.
#[inline]
pub fn op_head_size(op: u8) -> usize {
    if opcode_extract(op) == DATA_V2 {
        OP_SIZE_V2
    } else {
        1
    }
}

/// Human-readable opcode name for diagnostics.
pub fn opcode_name(opcode: u8) -> Option<&'static str> {
    match opcode {
        CONTROL_SOFT_RESET_V1 => Some("CONTROL_SOFT_RESET_V1"),
        CONTROL_V1 => Some("CONTROL_V1"),
        ACK_V1 => Some("ACK_V1"),
        DATA_V1 => Some("DATA_V1"),
        DATA_V2 => Some("DATA_V2"),
        CONTROL_HARD_RESET_CLIENT_V2 => Some("CONTROL_HARD_RESET_CLIENT_V2"),
        CONTROL_HARD_RESET_SERVER_V2 => Some("CONTROL_HARD_RESET_SERVER_V2"),
        _ => None,
    }
}

/// Prefix identifying a key-method 2 auth record.
pub const AUTH_PREFIX: [u8; 5] = [0, 0, 0, 0, 2];

/// Fixed keepalive message sent through the data channel.
pub const KEEPALIVE_MESSAGE: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Fixed explicit-exit-notify message; trailing byte is OCC_EXIT.
pub const EXPLICIT_EXIT_NOTIFY_MESSAGE: [u8; 17] = [
    0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5, 0x45,
    0x9c, 6,
];

/// Does a decrypted data-channel payload carry the keepalive magic?
#[inline]
pub fn is_keepalive(buf: &[u8]) -> bool {
    buf.len() >= KEEPALIVE_MESSAGE.len()
        && buf[0] == KEEPALIVE_MESSAGE[0]
        && buf[..KEEPALIVE_MESSAGE.len()] == KEEPALIVE_MESSAGE
}

/// Does a decrypted data-channel payload carry the explicit-exit magic?
#[inline]
pub fn is_explicit_exit_notify(buf: &[u8]) -> bool {
    buf.len() >= EXPLICIT_EXIT_NOTIFY_MESSAGE.len()
        && buf[0] == EXPLICIT_EXIT_NOTIFY_MESSAGE[0]
        && buf[..EXPLICIT_EXIT_NOTIFY_MESSAGE.len()] == EXPLICIT_EXIT_NOTIFY_MESSAGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_compose_extract_roundtrip() {
        for opcode in FIRST_OPCODE..=LAST_OPCODE {
            for key_id in 0..8u8 {
                let op = op_compose(opcode, key_id);
                assert_eq!(opcode_extract(op), opcode);
                assert_eq!(key_id_extract(op), key_id);
            }
        }
    }

    #[test]
    fn test_op32_compose() {
        let op32 = op32_compose(DATA_V2, 3, 0x123456);
        assert_eq!(op32 >> 24, op_compose(DATA_V2, 3) as u32);
        assert_eq!(op32 & OP_PEER_ID_UNDEF, 0x123456);

        // -1 peer id maps to the undefined sentinel
        let op32 = op32_compose(DATA_V2, 0, -1);
        assert_eq!(op32 & OP_PEER_ID_UNDEF, OP_PEER_ID_UNDEF);
    }

    #[test]
    fn test_op_head_size() {
        assert_eq!(op_head_size(op_compose(DATA_V2, 1)), OP_SIZE_V2);
        assert_eq!(op_head_size(op_compose(DATA_V1, 1)), 1);
        assert_eq!(op_head_size(op_compose(CONTROL_V1, 0)), 1);
    }

    #[test]
    fn test_keepalive_probe() {
        assert!(is_keepalive(&KEEPALIVE_MESSAGE));
        let mut long = KEEPALIVE_MESSAGE.to_vec();
        long.extend_from_slice(b"trailing");
        assert!(is_keepalive(&long));
        assert!(!is_keepalive(&KEEPALIVE_MESSAGE[..15]));
        let mut bad = KEEPALIVE_MESSAGE;
        bad[5] ^= 0xff;
        assert!(!is_keepalive(&bad));
    }

    #[test]
    fn test_exit_notify_probe() {
        assert!(is_explicit_exit_notify(&EXPLICIT_EXIT_NOTIFY_MESSAGE));
        assert!(!is_explicit_exit_notify(&KEEPALIVE_MESSAGE));
    }
}
