//! Compression negotiation and stub framing.
//!
//! Real codecs are out of scope; what matters for wire compatibility
//! is the negotiated framing byte. The stub variants emit and strip
//! the one-byte no-compression marker so a compressing peer can
//! interoperate with us.

use ovpn_core::stats::ErrorCode;

/// LZO-family framing byte: payload follows uncompressed.
const LZO_NO_COMPRESS: u8 = 0xfa;
/// LZO-family framing byte: payload is compressed (unsupported here).
const LZO_COMPRESS: u8 = 0x66;

/// Negotiated compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMethod {
    /// No compression layer at all.
    #[default]
    None,
    /// `compress stub`: framing byte, never compresses.
    Stub,
    /// `comp-lzo` in stub mode: LZO framing byte, never compresses.
    LzoStub,
}

/// Compression settings negotiated via the options string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressContext {
    method: CompressMethod,
}

impl CompressContext {
    pub fn new(method: CompressMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> CompressMethod {
        self.method
    }

    /// Fragment of the options consistency string, if any.
    pub fn options_fragment(&self) -> Option<&'static str> {
        match self.method {
            CompressMethod::None => None,
            CompressMethod::Stub => Some("compress"),
            CompressMethod::LzoStub => Some("comp-lzo"),
        }
    }

    /// Peer-info capability line, if any.
    pub fn peer_info_fragment(&self) -> Option<&'static str> {
        match self.method {
            CompressMethod::None => None,
            CompressMethod::Stub => Some("IV_COMP_STUB=1\n"),
            CompressMethod::LzoStub => Some("IV_LZO_STUB=1\n"),
        }
    }

    /// Bytes the framing adds to each data packet.
    pub fn extra_payload_bytes(&self) -> usize {
        match self.method {
            CompressMethod::None => 0,
            _ => 1,
        }
    }

    pub fn new_compressor(&self) -> Compressor {
        match self.method {
            CompressMethod::None => Compressor::NoComp,
            CompressMethod::Stub | CompressMethod::LzoStub => Compressor::Stub,
        }
    }
}

/// Per-key compressor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// Fully transparent.
    NoComp,
    /// Emits the no-compress marker; rejects compressed input.
    Stub,
}

impl Compressor {
    pub fn compress(&self, buf: &mut Vec<u8>, _hint: bool) {
        match self {
            Compressor::NoComp => {}
            Compressor::Stub => {
                buf.insert(0, LZO_NO_COMPRESS);
            }
        }
    }

    pub fn decompress(&self, buf: &mut Vec<u8>) -> Result<(), ErrorCode> {
        match self {
            Compressor::NoComp => Ok(()),
            Compressor::Stub => match buf.first() {
                Some(&LZO_NO_COMPRESS) => {
                    buf.remove(0);
                    Ok(())
                }
                // a compressed payload cannot be expanded here
                Some(&LZO_COMPRESS) => Err(ErrorCode::BufferError),
                _ => Err(ErrorCode::BufferError),
            },
        }
    }
}
