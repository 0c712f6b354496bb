use bytes::Bytes;
use strum::FromRepr;

use crate::{constants::HEADER_LEN, error::ProtoError};

/// Frame protocol marker (first header byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum Protocol {
    Edonkey = 0xE3,
    Packed = 0xD4,
}

/// Frame header (wire format).
///
/// Layout:
/// - 0      protocol marker
/// - 1..5   length (u32 LE) of `[opcode][payload]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol: Protocol,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = HEADER_LEN;

    /// Decode the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_LEN`] bytes are available.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, ProtoError> {
        let Some(header) = buf.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let marker = header[0];
        let protocol = Protocol::from_repr(marker).ok_or(ProtoError::UnknownProtocol(marker))?;

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&header[1..]);

        Ok(Some(Self {
            protocol,
            length: u32::from_le_bytes(raw),
        }))
    }

    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0] = self.protocol as u8;
        out[1..5].copy_from_slice(&self.length.to_le_bytes());
    }

    /// Header plus declared body.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

/// One decoded frame with its opcode split off.
///
/// For packed frames `payload` holds the inflated bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: Protocol,
    pub opcode: u8,
    pub payload: Bytes,
}
