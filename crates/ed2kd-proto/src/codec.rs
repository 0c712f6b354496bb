use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compression, Decompress, FlushDecompress, Status, write::ZlibEncoder};

use crate::{
    constants::HEADER_LEN,
    error::ProtoError,
    packet::{FrameHeader, Packet, Protocol},
};

/// Upper bound of the inflate buffer for frames on a client connection.
pub const SERVER_INFLATE_CAP: usize = 50_000;

/// Inflate buffer size for frames on the port-check link.
pub const PEER_INFLATE_LIMIT: usize = 300 * 1024;

/// How large an inflated payload may get before the frame is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateLimit {
    /// `min(cap, declared_len * 10 + 300)`.
    Scaled { cap: usize },
    Fixed(usize),
}

impl InflateLimit {
    pub const SERVER: Self = Self::Scaled {
        cap: SERVER_INFLATE_CAP,
    };
    pub const PEER: Self = Self::Fixed(PEER_INFLATE_LIMIT);

    pub fn bound(&self, declared_len: u32) -> usize {
        match *self {
            InflateLimit::Scaled { cap } => (declared_len as usize)
                .saturating_mul(10)
                .saturating_add(300)
                .min(cap),
            InflateLimit::Fixed(limit) => limit,
        }
    }
}

/// Encode a plain frame: `[0xE3][u32 len][opcode][payload]`.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    put_frame(Protocol::Edonkey, opcode, payload)
}

/// Encode a zlib-packed frame. Only the payload is compressed, the opcode
/// stays in the clear.
pub fn encode_packed_frame(opcode: u8, payload: &[u8]) -> Result<Bytes, ProtoError> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2 + 16), Compression::default());
    enc.write_all(payload)
        .map_err(|e| ProtoError::Compress(e.to_string()))?;
    let packed = enc.finish().map_err(|e| ProtoError::Compress(e.to_string()))?;
    Ok(put_frame(Protocol::Packed, opcode, &packed))
}

fn put_frame(protocol: Protocol, opcode: u8, body: &[u8]) -> Bytes {
    let header = FrameHeader {
        protocol,
        length: (body.len() + 1) as u32,
    };
    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);

    let mut out = BytesMut::with_capacity(header.frame_len());
    out.put_slice(&hbuf);
    out.put_u8(opcode);
    out.put_slice(body);
    out.freeze()
}

/// Inspect the head of a receive buffer.
///
/// - `Ok(None)`: the header or the declared body has not fully arrived.
/// - `Ok(Some(header))`: `header.frame_len()` bytes form one complete frame.
/// - `Err(_)`: the stream cannot be framed any further.
pub fn peek_frame(buf: &[u8], max_frame_len: usize) -> Result<Option<FrameHeader>, ProtoError> {
    let Some(header) = FrameHeader::decode(buf)? else {
        return Ok(None);
    };
    if header.length == 0 {
        return Err(ProtoError::EmptyFrame);
    }

    let frame_len = header.frame_len();
    if frame_len > max_frame_len {
        return Err(ProtoError::FrameTooLarge(frame_len));
    }
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(header))
}

/// Turn one complete frame (as delimited by [`peek_frame`]) into a packet.
pub fn unpack_frame(
    header: FrameHeader,
    frame: &Bytes,
    limit: InflateLimit,
) -> Result<Packet, ProtoError> {
    let frame_len = header.frame_len();
    if frame.len() < frame_len {
        return Err(ProtoError::TooShort {
            needed: frame_len,
            remaining: frame.len(),
        });
    }

    let body = frame.slice(HEADER_LEN..frame_len);
    let opcode = *body.first().ok_or(ProtoError::EmptyFrame)?;

    let payload = match header.protocol {
        Protocol::Edonkey => body.slice(1..),
        Protocol::Packed => Bytes::from(inflate(&body[1..], limit.bound(header.length))?),
    };

    Ok(Packet {
        protocol: header.protocol,
        opcode,
        payload,
    })
}

/// Inflate a zlib stream into at most `limit` bytes.
///
/// The stream must end within `data` and within `limit`; anything else is an
/// error. Never reads outside `data`.
pub fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(limit);
    let mut z = Decompress::new(true);

    match z.decompress_vec(data, &mut out, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(out),
        Ok(_) => Err(ProtoError::Decompress(format!(
            "stream incomplete or larger than {limit} bytes"
        ))),
        Err(e) => Err(ProtoError::Decompress(e.to_string())),
    }
}
