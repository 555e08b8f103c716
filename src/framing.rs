//! Chunk Framing
//!
//! A streamed body is a sequence of `;0x<8 hex digits>;<payload>` chunks. The
//! header gives the payload length in bytes. Readers accept input in
//! arbitrary fragments and hand out payloads as soon as they are complete.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::DecodeError;

/// `;0x` + 8 hex digits + `;`
pub const HEADER_LEN: usize = 12;

pub fn encode_chunk(payload: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(HEADER_LEN + payload.len());
    chunk.extend_from_slice(format!(";0x{:08x};", payload.len()).as_bytes());
    chunk.extend_from_slice(payload);
    chunk.freeze()
}

fn parse_header(header: &[u8], position: usize) -> Result<usize, DecodeError> {
    if header[0] != b';' || &header[1..3] != b"0x" || header[11] != b';' {
        return Err(DecodeError::BadHeader(position));
    }
    let digits = std::str::from_utf8(&header[3..11]).map_err(|_| DecodeError::BadHeader(position))?;
    usize::from_str_radix(digits, 16).map_err(|_| DecodeError::BadHeader(position))
}

#[derive(Debug, Default)]
pub struct ChunkReader {
    buffer: BytesMut,
    /// Bytes consumed so far, for error positions.
    consumed: usize,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete payload, or `None` until more input arrives.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = parse_header(&self.buffer[..HEADER_LEN], self.consumed)?;
        if self.buffer.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        self.consumed += HEADER_LEN + length;
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Call once the input is closed. Leftover bytes mean the stream was cut
    /// inside a chunk.
    pub fn finish(&self) -> Result<(), DecodeError> {
        let received = self.buffer.len();
        if received == 0 {
            return Ok(());
        }
        if received < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                received,
            });
        }
        let length = parse_header(&self.buffer[..HEADER_LEN], self.consumed)?;
        Err(DecodeError::Truncated {
            expected: length,
            received: received - HEADER_LEN,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Splits a complete body into its payloads.
pub fn decode_chunks(data: &[u8]) -> Result<Vec<Bytes>, DecodeError> {
    let mut reader = ChunkReader::new();
    reader.push(data);
    let mut chunks = Vec::new();
    while let Some(chunk) = reader.next_chunk()? {
        chunks.push(chunk);
    }
    reader.finish()?;
    Ok(chunks)
}
