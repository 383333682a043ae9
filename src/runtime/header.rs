//! Wire header carried at the front of every request and response.
//!
//! ```text
//! offset  size  field
//!      0     4  length      i32, total message bytes including this header
//!      4     4  issue_time  u32, low 32 bits of the client's clock at issue
//!      8     4  server_id   i32, index of the target server on the client
//!     12     4  message_id  u32, unique per client node
//! ```
//!
//! All fields are little-endian. The server copies the header unchanged into
//! its response, which is how the client recovers the issue time.

use bytes::Bytes;

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub length: i32,
    pub issue_time: u32,
    pub server_id: i32,
    pub message_id: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.issue_time.to_le_bytes());
        out[8..12].copy_from_slice(&self.server_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.message_id.to_le_bytes());
        out
    }

    /// Decode a header from the first 16 bytes of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than a header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            issue_time: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            server_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            message_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Number of payload bytes following the header.
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }
}

/// A complete message: header plus `header.length - 16` body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Frame {
    /// Build a frame, rounding a too-short `length` up to the header size.
    ///
    /// The body is sliced out of `fill`, which must be at least
    /// `length - 16` bytes long; clients pass a shared zero buffer so that
    /// building a request never allocates.
    pub fn new(mut header: MessageHeader, fill: &Bytes) -> Self {
        if header.length < HEADER_LEN as i32 {
            header.length = HEADER_LEN as i32;
        }
        let body = fill.slice(..header.body_len());
        Self { header, body }
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Encode into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.body);
        out
    }
}
