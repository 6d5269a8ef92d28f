//! Length framing for stream-oriented local transports: a 4-byte big-endian
//! payload length followed by the payload.

use crate::error::{Error, NetResult};
use byteorder::{BigEndian, ByteOrder};

pub const FRAME_HEADER_SIZE: usize = 4;

/// Writes the frame header for a payload of the given length.
#[inline]
pub fn encode_header(length: usize) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    BigEndian::write_u32(&mut header, length as u32);
    header
}

#[derive(Copy, Clone)]
enum ReadState {
    Header,
    Body { expected: usize },
}

/// Incremental frame decoder.
///
/// Bytes arrive in arbitrary chunks; the reader accumulates them,
/// alternating between reading the header and the body, and hands each
/// complete payload to the sink. A header declaring more than the
/// configured maximum is a fatal protocol error raised before any of that
/// payload's bytes are surfaced.
pub struct FrameReader {
    state: ReadState,
    pending: Vec<u8>,
    max_message_size: usize,
}

impl FrameReader {
    pub fn new(max_message_size: usize) -> FrameReader {
        FrameReader {
            state: ReadState::Header,
            pending: Vec::with_capacity(FRAME_HEADER_SIZE),
            max_message_size,
        }
    }

    /// Feeds received bytes through the decoder, invoking `sink` once per
    /// completed frame payload.
    pub fn push<F: FnMut(Vec<u8>)>(&mut self, mut chunk: &[u8], mut sink: F) -> NetResult<()> {
        while !chunk.is_empty() {
            match self.state {
                ReadState::Header => {
                    let needed = FRAME_HEADER_SIZE - self.pending.len();
                    let take = needed.min(chunk.len());
                    self.pending.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.pending.len() == FRAME_HEADER_SIZE {
                        let expected = BigEndian::read_u32(&self.pending) as usize;

                        if expected > self.max_message_size {
                            return Err(Error::invalid_message(format!(
                                "Frame of {} bytes exceeds limit of {}",
                                expected, self.max_message_size
                            )));
                        }

                        self.pending.clear();
                        if expected == 0 {
                            sink(Vec::new());
                        } else {
                            self.pending.reserve(expected.min(1 << 20));
                            self.state = ReadState::Body { expected };
                        }
                    }
                }
                ReadState::Body { expected } => {
                    let needed = expected - self.pending.len();
                    let take = needed.min(chunk.len());
                    self.pending.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.pending.len() == expected {
                        let payload = std::mem::replace(&mut self.pending, Vec::with_capacity(FRAME_HEADER_SIZE));
                        self.state = ReadState::Header;
                        sink(payload);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(reader: &mut FrameReader, chunk: &[u8]) -> NetResult<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        reader.push(chunk, |payload| frames.push(payload))?;
        Ok(frames)
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut bytes = encode_header(payload.len()).to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_single_frame_in_one_chunk() {
        let mut reader = FrameReader::new(1024);
        let frames = collect(&mut reader, &framed(b"ping")).unwrap();
        assert_eq!(frames, vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_frame_split_byte_by_byte() {
        let mut reader = FrameReader::new(1024);
        let bytes = framed(b"hello");

        let mut frames = Vec::new();
        for byte in bytes {
            reader.push(&[byte], |payload| frames.push(payload)).unwrap();
        }
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut reader = FrameReader::new(1024);
        let mut bytes = framed(b"one");
        bytes.extend_from_slice(&framed(b"two"));
        bytes.extend_from_slice(&framed(b"three"));

        let frames = collect(&mut reader, &bytes).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_split_across_chunks_mid_header() {
        let mut reader = FrameReader::new(1024);
        let bytes = framed(b"payload");

        let mut frames = Vec::new();
        reader.push(&bytes[..2], |payload| frames.push(payload)).unwrap();
        assert!(frames.is_empty());
        reader.push(&bytes[2..], |payload| frames.push(payload)).unwrap();
        assert_eq!(frames, vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut reader = FrameReader::new(1024);
        let frames = collect(&mut reader, &framed(b"")).unwrap();
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_oversize_header_fails_before_payload_delivery() {
        let mut reader = FrameReader::new(16);

        let mut bytes = encode_header(17).to_vec();
        bytes.extend_from_slice(&[0u8; 17]);

        let mut frames = Vec::new();
        let err = reader.push(&bytes, |payload| frames.push(payload)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidMessage);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_exactly_max_size_is_accepted() {
        let mut reader = FrameReader::new(16);
        let payload = [7u8; 16];
        let frames = collect(&mut reader, &framed(&payload)).unwrap();
        assert_eq!(frames, vec![payload.to_vec()]);
    }
}
