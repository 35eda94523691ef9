//! CBOR codecs and length-delimited framing.
//!
//! Byte-stream transports carry `ChangeEvent`s as frames: a 4-byte
//! big-endian body length followed by the CBOR body.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::ChangeEvent;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame body (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Encodes one event as a length-prefixed frame.
pub fn encode_frame(event: &ChangeEvent) -> ProtocolResult<Vec<u8>> {
    let body = to_cbor(event)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame reader.
///
/// Feed arbitrary byte slices with [`FrameDecoder::push`]; complete events
/// come out of [`FrameDecoder::next_event`] in arrival order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame, or returns `None` if more bytes are
    /// needed.
    pub fn next_event(&mut self) -> ProtocolResult<Option<ChangeEvent>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let event = from_cbor(&self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])?;
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeltaChunk;
    use crate::row::Row;

    #[test]
    fn frames_split_across_reads() {
        let first = ChangeEvent::Delta(DeltaChunk::page("t", vec![Row::new("a", 1)], 10));
        let second = ChangeEvent::Heartbeat;
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let (head, tail) = bytes.split_at(3);
        decoder.push(head);
        assert!(decoder.next_event().unwrap().is_none());

        decoder.push(tail);
        assert_eq!(decoder.next_event().unwrap(), Some(first));
        assert_eq!(decoder.next_event().unwrap(), Some(second));
        assert!(decoder.next_event().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn oversized_header_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decoder.next_event(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&2u32.to_be_bytes());
        decoder.push(&[0xff, 0xff]);
        assert!(matches!(decoder.next_event(), Err(ProtocolError::Decode(_))));
    }
}
