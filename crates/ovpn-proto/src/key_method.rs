//! Key-method 2 auth record.
//!
//! After the TLS handshake each side sends one record over the
//! cleartext channel:
//!
//! ```text
//! prefix(5 = 0,0,0,0,2) | PRF randomness | auth_string(options)
//!   | [client only: auth_string(user), auth_string(pass),
//!      auth_string(peer_info)]
//! ```
//!
//! `auth_string(s)` is `u16be(len+1) | bytes | 0x00`, or `u16be(0)`
//! for the empty string.

use ovpn_core::buf::Reader;
use ovpn_core::constants::AUTH_PREFIX;

use crate::errors::{ProtoError, ProtoResult};

/// Serialize a length-prefixed, null-terminated auth string.
pub fn write_auth_string(s: &str, buf: &mut Vec<u8>) -> ProtoResult<()> {
    let len = s.len();
    if len == 0 {
        buf.extend_from_slice(&0u16.to_be_bytes());
        return Ok(());
    }
    if len + 1 > 0xffff {
        return Err(ProtoError::AuthStringOverflow);
    }
    buf.extend_from_slice(&((len + 1) as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

/// Serialize the empty auth string.
pub fn write_empty_auth_string(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&0u16.to_be_bytes());
}

/// Parse one auth string.
pub fn read_auth_string(r: &mut Reader<'_>) -> ProtoResult<String> {
    let len = r.u16()? as usize;
    if len == 0 {
        return Ok(String::new());
    }
    let bytes = r.take(len)?;
    // strip the trailing null
    Ok(String::from_utf8_lossy(&bytes[..len - 1]).into_owned())
}

fn skip_auth_string(r: &mut Reader<'_>) -> bool {
    match r.u16() {
        Ok(len) => r.skip(len as usize).is_ok(),
        Err(_) => false,
    }
}

/// Does `data` hold a complete auth record? The cleartext channel is
/// a stream, so a partially received record must be retried after
/// more TLS output arrives. `prf_peer_len` is the size of the peer's
/// PRF contribution, `from_client` whether the record carries
/// credentials and peer info.
pub fn auth_record_complete(data: &[u8], from_client: bool, prf_peer_len: usize) -> bool {
    let mut r = Reader::new(data);
    if r.skip(AUTH_PREFIX.len()).is_err() || r.skip(prf_peer_len).is_err() {
        return false;
    }
    if !skip_auth_string(&mut r) {
        return false; // options
    }
    if from_client {
        for _ in 0..3 {
            // username, password, peer info
            if !skip_auth_string(&mut r) {
                return false;
            }
        }
    }
    true
}

/// Verify the record prefix.
pub fn check_auth_prefix(r: &mut Reader<'_>) -> ProtoResult<()> {
    let prefix = r.take(AUTH_PREFIX.len())?;
    if prefix != AUTH_PREFIX {
        return Err(ProtoError::BadAuthPrefix);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_string_roundtrip() {
        let mut buf = Vec::new();
        write_auth_string("V4,dev-type tun", &mut buf).unwrap();
        let mut r = Reader::new(&buf);
        assert_eq!(read_auth_string(&mut r).unwrap(), "V4,dev-type tun");
        assert!(r.is_empty());
    }

    #[test]
    fn test_empty_auth_string() {
        let mut buf = Vec::new();
        write_auth_string("", &mut buf).unwrap();
        assert_eq!(buf, vec![0, 0]);
        let mut r = Reader::new(&buf);
        assert_eq!(read_auth_string(&mut r).unwrap(), "");
    }

    #[test]
    fn test_overlong_string_rejected() {
        let huge = "x".repeat(0x10000);
        let mut buf = Vec::new();
        assert!(matches!(
            write_auth_string(&huge, &mut buf),
            Err(ProtoError::AuthStringOverflow)
        ));
    }

    fn build_record(from_client: bool, prf_len: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&AUTH_PREFIX);
        buf.extend(std::iter::repeat(0x55).take(prf_len));
        write_auth_string("options", &mut buf).unwrap();
        if from_client {
            write_auth_string("user", &mut buf).unwrap();
            write_auth_string("pass", &mut buf).unwrap();
            write_auth_string("IV_VER=1\n", &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_record_completeness() {
        let rec = build_record(true, 112);
        assert!(auth_record_complete(&rec, true, 112));
        // every strict prefix is incomplete
        for cut in 0..rec.len() {
            assert!(
                !auth_record_complete(&rec[..cut], true, 112),
                "prefix of {cut} bytes judged complete"
            );
        }
        // trailing bytes (a control message) do not hurt
        let mut long = rec.clone();
        long.extend_from_slice(b"PUSH_REQUEST\0");
        assert!(auth_record_complete(&long, true, 112));
    }

    #[test]
    fn test_server_record_completeness() {
        let rec = build_record(false, 64);
        assert!(auth_record_complete(&rec, false, 64));
        assert!(!auth_record_complete(&rec[..rec.len() - 1], false, 64));
    }

    #[test]
    fn test_prefix_check() {
        let rec = build_record(false, 64);
        assert!(check_auth_prefix(&mut Reader::new(&rec)).is_ok());
        let mut bad = rec.clone();
        bad[4] = 9;
        assert!(matches!(
            check_auth_prefix(&mut Reader::new(&bad)),
            Err(ProtoError::BadAuthPrefix)
        ));
    }
}
