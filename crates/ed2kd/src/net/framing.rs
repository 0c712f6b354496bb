use bytes::BytesMut;
use ed2kd_proto::codec::{InflateLimit, peek_frame, unpack_frame};
use ed2kd_proto::error::ProtoError;
use ed2kd_proto::packet::Packet;

/// Incremental frame reader over a byte stream.
///
/// - keeps an internal receive buffer (`BytesMut`)
/// - hands out one packet at a time, so callers can stop between frames
/// - keeps partial frames for the next read
pub struct Framer {
    buf: BytesMut,
    max_frame_len: usize,
    limit: InflateLimit,
}

impl Framer {
    pub fn new(initial_capacity: usize, max_frame_len: usize, limit: InflateLimit) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
            max_frame_len,
            limit,
        }
    }

    /// Get mutable access to the internal buffer for socket reads.
    ///
    /// Typical usage:
    /// - `framer.buf_mut().reserve(n)`
    /// - `socket.read_buf(framer.buf_mut()).await?`
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if any.
    ///
    /// A complete frame is removed from the buffer before its payload is
    /// inflated, so a decompression error still leaves the buffer at the next
    /// frame boundary. Any error means the stream is unusable.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtoError> {
        let Some(header) = peek_frame(&self.buf, self.max_frame_len)? else {
            return Ok(None);
        };
        let frame = self.buf.split_to(header.frame_len()).freeze();
        unpack_frame(header, &frame, self.limit).map(Some)
    }
}
