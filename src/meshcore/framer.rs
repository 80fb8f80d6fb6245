//! Length-prefixed frame codec for the MeshCore companion serial link.
//!
//! Each frame on the wire is:
//!
//!   `<marker u8><length u16 LE><payload>`
//!
//! where the marker is `<` for host→device frames and `>` for device→host
//! frames. The decoder is incremental: feed it arbitrary chunks with
//! [`FrameDecoder::push`] and pull whole frames out with
//! [`FrameDecoder::decode`]. Malformed input is discarded up to the next
//! marker byte and reported once; there are no retries at this layer.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;

/// Largest payload the companion firmware accepts in one frame.
pub const MAX_FRAME_PAYLOAD: usize = 172;

/// Marker plus the two length bytes.
pub const HEADER_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to companion device.
    ToDevice,
    /// Companion device to host.
    FromDevice,
}

impl Direction {
    pub const fn marker(self) -> u8 {
        match self {
            Direction::ToDevice => b'<',
            Direction::FromDevice => b'>',
        }
    }
}

/// Build one frame around `payload`.
pub fn encode_frame(direction: Direction, payload: &[u8], max: usize) -> Result<Bytes, FramingError> {
    if payload.len() > max || payload.len() > u16::MAX as usize {
        return Err(FramingError::PayloadTooLarge { len: payload.len(), max });
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(direction.marker());
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    Ok(out.freeze())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Bytes),
    NeedMoreData,
}

/// Incremental decoder for frames travelling in one direction.
pub struct FrameDecoder {
    buf: BytesMut,
    marker: u8,
    max: usize,
}

impl FrameDecoder {
    pub fn new(direction: Direction, max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            marker: direction.marker(),
            max,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to take the next frame out of the buffer.
    ///
    /// On `Err` the malformed bytes are already gone; calling again continues
    /// from the next marker.
    pub fn decode(&mut self) -> Result<Decoded, FramingError> {
        if self.buf.is_empty() {
            return Ok(Decoded::NeedMoreData);
        }
        if self.buf[0] != self.marker {
            let skipped = self.skip_to_marker();
            return Err(FramingError::BadMarker {
                expected: self.marker,
                skipped,
            });
        }
        if self.buf.len() < HEADER_LEN {
            return Ok(Decoded::NeedMoreData);
        }
        let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
        if len > self.max {
            // The marker byte was a false positive or the header is corrupt.
            self.buf.advance(1);
            self.skip_to_marker();
            return Err(FramingError::Oversize { len, max: self.max });
        }
        if len == 0 {
            self.buf.advance(HEADER_LEN);
            return Err(FramingError::Empty);
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(Decoded::NeedMoreData);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Decoded::Frame(self.buf.split_to(len).freeze()))
    }

    fn skip_to_marker(&mut self) -> usize {
        let skip = self
            .buf
            .iter()
            .position(|&b| b == self.marker)
            .unwrap_or(self.buf.len());
        self.buf.advance(skip);
        skip
    }
}
