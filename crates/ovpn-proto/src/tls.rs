//! Opaque TLS stream interface.
//!
//! The handshake engine is an external collaborator: the session
//! layer only moves bytes. Ciphertext flows to and from the network
//! through the reliable control channel; cleartext flows to and from
//! the application (the key-method 2 auth record, then control
//! messages).

use crate::errors::{ProtoError, ProtoResult};

/// Outcome of offering cleartext to the TLS stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppWrite {
    /// Bytes accepted into the stream.
    Consumed,
    /// Handshake not far enough along; offer the same bytes later.
    Retry,
}

/// One TLS session, byte-oriented duplex.
pub trait TlsSession {
    /// Begin the handshake; ciphertext becomes available via
    /// [`read_ciphertext`](Self::read_ciphertext).
    fn start_handshake(&mut self) -> ProtoResult<()>;

    /// Feed network-side ciphertext into the stream.
    fn write_ciphertext(&mut self, data: &[u8]) -> ProtoResult<()>;

    /// Drain ciphertext destined for the network, frame-sized.
    fn read_ciphertext(&mut self) -> Option<Vec<u8>>;

    /// Offer application cleartext for encryption.
    fn write_cleartext(&mut self, data: &[u8]) -> ProtoResult<AppWrite>;

    /// Drain decrypted application cleartext.
    fn read_cleartext(&mut self) -> Option<Vec<u8>>;

    /// Has the handshake completed?
    fn handshake_complete(&self) -> bool;
}

/// Creates one [`TlsSession`] per key context.
pub trait TlsFactory {
    fn new_session(&self, server: bool) -> Box<dyn TlsSession>;
}

/// Deterministic in-process stand-in for a real TLS engine, used by
/// the integration tests: a two-message toy handshake, then
/// length-framed passthrough records. Not encryption.
pub mod testing {
    use std::collections::VecDeque;

    use super::{AppWrite, TlsFactory, TlsSession};
    use crate::errors::{ProtoError, ProtoResult};

    const REC_HANDSHAKE: u8 = 1;
    const REC_DATA: u8 = 2;

    const CLIENT_HELLO: &[u8] = b"loopback-hello";
    const SERVER_DONE: &[u8] = b"loopback-done";

    /// Factory for [`LoopbackTls`] sessions.
    #[derive(Debug, Default)]
    pub struct LoopbackTlsFactory;

    impl TlsFactory for LoopbackTlsFactory {
        fn new_session(&self, server: bool) -> Box<dyn TlsSession> {
            Box::new(LoopbackTls::new(server))
        }
    }

    /// See [`LoopbackTlsFactory`].
    pub struct LoopbackTls {
        server: bool,
        started: bool,
        complete: bool,
        /// reassembly buffer for inbound records
        inbound: Vec<u8>,
        /// ciphertext queued for the network
        net_out: VecDeque<Vec<u8>>,
        /// cleartext queued for the application
        app_out: VecDeque<Vec<u8>>,
    }

    impl LoopbackTls {
        pub fn new(server: bool) -> Self {
            Self {
                server,
                started: false,
                complete: false,
                inbound: Vec::new(),
                net_out: VecDeque::new(),
                app_out: VecDeque::new(),
            }
        }

        fn push_record(&mut self, rec_type: u8, payload: &[u8]) {
            let mut rec = Vec::with_capacity(3 + payload.len());
            rec.push(rec_type);
            rec.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            rec.extend_from_slice(payload);
            self.net_out.push_back(rec);
        }

        fn process_records(&mut self) -> ProtoResult<()> {
            loop {
                if self.inbound.len() < 3 {
                    return Ok(());
                }
                let rec_type = self.inbound[0];
                let len = u16::from_be_bytes([self.inbound[1], self.inbound[2]]) as usize;
                if self.inbound.len() < 3 + len {
                    return Ok(());
                }
                let payload: Vec<u8> = self.inbound.drain(..3 + len).skip(3).collect();

                match rec_type {
                    REC_HANDSHAKE => self.on_handshake(&payload)?,
                    REC_DATA if self.complete => self.app_out.push_back(payload),
                    _ => {
                        return Err(ProtoError::Tls(format!(
                            "unexpected record type {rec_type}"
                        )))
                    }
                }
            }
        }

        fn on_handshake(&mut self, payload: &[u8]) -> ProtoResult<()> {
            if self.server {
                if payload != CLIENT_HELLO {
                    return Err(ProtoError::Tls("bad client hello".into()));
                }
                self.push_record(REC_HANDSHAKE, SERVER_DONE);
                self.complete = true;
            } else {
                if payload != SERVER_DONE {
                    return Err(ProtoError::Tls("bad server response".into()));
                }
                self.complete = true;
            }
            Ok(())
        }
    }

    impl TlsSession for LoopbackTls {
        fn start_handshake(&mut self) -> ProtoResult<()> {
            if !self.started {
                self.started = true;
                if !self.server {
                    self.push_record(REC_HANDSHAKE, CLIENT_HELLO);
                }
            }
            Ok(())
        }

        fn write_ciphertext(&mut self, data: &[u8]) -> ProtoResult<()> {
            self.inbound.extend_from_slice(data);
            self.process_records()
        }

        fn read_ciphertext(&mut self) -> Option<Vec<u8>> {
            self.net_out.pop_front()
        }

        fn write_cleartext(&mut self, data: &[u8]) -> ProtoResult<AppWrite> {
            if !self.complete {
                return Ok(AppWrite::Retry);
            }
            let mut rec = Vec::with_capacity(3 + data.len());
            rec.push(REC_DATA);
            rec.extend_from_slice(&(data.len() as u16).to_be_bytes());
            rec.extend_from_slice(data);
            self.net_out.push_back(rec);
            Ok(AppWrite::Consumed)
        }

        fn read_cleartext(&mut self) -> Option<Vec<u8>> {
            self.app_out.pop_front()
        }

        fn handshake_complete(&self) -> bool {
            self.complete
        }
    }

}
