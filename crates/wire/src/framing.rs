//! Length-prefixed message framing with magic-based resynchronization.
//!
//! A frame is `[magic:4][command:12, NUL padded][length:4 LE][checksum:4]`
//! followed by `length` payload bytes; the checksum is the first four bytes
//! of the payload's double-SHA256. Garbage between frames is skipped by
//! scanning forward to the next magic.

use ltcspv_consensus::constants::MAX_MESSAGE_SIZE;
use ltcspv_primitives::encoding::{DecodeError, DecodeErrorKind};
use ltcspv_primitives::sha256d;

use crate::message::Message;

pub const FRAME_HEADER_SIZE: usize = 24;

/// Frames a raw payload under the given command.
pub fn encode_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= 12 && command.is_ascii());
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&command_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    out.extend_from_slice(&checksum[..4]);
    out.extend_from_slice(payload);
    out
}

/// Frames a typed message.
pub fn frame_message(magic: [u8; 4], message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    encode_frame(magic, message.command(), &payload)
}

/// Incremental frame decoder over a byte stream.
///
/// Feed raw socket reads in, pull `(command, payload)` frames out. Bytes
/// before a magic match are discarded, so the reader resynchronizes after
/// stream corruption; a frame with a bad checksum or command is consumed
/// and reported as an error, leaving the stream usable.
pub struct FrameReader {
    magic: [u8; 4],
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<(String, Vec<u8>)>, DecodeError> {
        self.resync();
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length =
            u32::from_le_bytes([self.buf[16], self.buf[17], self.buf[18], self.buf[19]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            // Skip the magic so the next scan hunts for a fresh frame.
            self.buf.drain(..4);
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: 16,
            });
        }
        if self.buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        let command = match parse_command(&self.buf[4..16]) {
            Some(command) => command,
            None => {
                self.buf.drain(..4);
                return Err(DecodeError {
                    kind: DecodeErrorKind::InvalidData("invalid command bytes"),
                    offset: 4,
                });
            }
        };

        let expected = [self.buf[20], self.buf[21], self.buf[22], self.buf[23]];
        let payload: Vec<u8> = self
            .buf
            .drain(..FRAME_HEADER_SIZE + length)
            .skip(FRAME_HEADER_SIZE)
            .collect();
        let checksum = sha256d(&payload);
        if checksum[..4] != expected {
            return Err(DecodeError {
                kind: DecodeErrorKind::InvalidData("invalid payload checksum"),
                offset: 20,
            });
        }

        Ok(Some((command, payload)))
    }

    /// Discards buffered bytes until they start with the magic.
    fn resync(&mut self) {
        let mut start = 0;
        while start < self.buf.len() {
            let tail = &self.buf[start..];
            if tail.starts_with(&self.magic) {
                break;
            }
            // A partial magic at the tail must survive for the next feed.
            if tail.len() < self.magic.len() && self.magic.starts_with(tail) {
                break;
            }
            start += 1;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
    }
}

fn parse_command(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    // NUL padding must be contiguous at the tail.
    if raw[end..].iter().any(|byte| *byte != 0) {
        return None;
    }
    let command = &raw[..end];
    if command.is_empty() || !command.iter().all(|byte| byte.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(command).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfb, 0xc0, 0xb6, 0xdb];

    #[test]
    fn frame_round_trips() {
        let frame = encode_frame(MAGIC, "ping", &7u64.to_le_bytes());
        let mut reader = FrameReader::new(MAGIC);
        reader.feed(&frame);
        let (command, payload) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "ping");
        assert_eq!(payload, 7u64.to_le_bytes());
        assert!(reader.next_frame().expect("empty").is_none());
    }

    #[test]
    fn partial_feed_waits_for_more() {
        let frame = encode_frame(MAGIC, "verack", &[]);
        let mut reader = FrameReader::new(MAGIC);
        reader.feed(&frame[..10]);
        assert!(reader.next_frame().expect("incomplete").is_none());
        reader.feed(&frame[10..]);
        let (command, payload) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "verack");
        assert!(payload.is_empty());
    }

    #[test]
    fn garbage_before_magic_is_skipped() {
        let frame = encode_frame(MAGIC, "verack", &[]);
        let mut reader = FrameReader::new(MAGIC);
        reader.feed(&[0x00, 0xfb, 0x13, 0x37]);
        reader.feed(&frame);
        let (command, _) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "verack");
    }

    #[test]
    fn split_magic_across_feeds() {
        let frame = encode_frame(MAGIC, "verack", &[]);
        let mut reader = FrameReader::new(MAGIC);
        reader.feed(&[0xaa]);
        reader.feed(&frame[..2]);
        assert!(reader.next_frame().expect("incomplete").is_none());
        reader.feed(&frame[2..]);
        let (command, _) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "verack");
    }

    #[test]
    fn bad_checksum_consumes_frame() {
        let mut frame = encode_frame(MAGIC, "ping", &7u64.to_le_bytes());
        let tail = frame.len() - 1;
        frame[tail] ^= 0xff;
        let good = encode_frame(MAGIC, "verack", &[]);
        let mut reader = FrameReader::new(MAGIC);
        reader.feed(&frame);
        reader.feed(&good);
        let err = reader.next_frame().expect_err("checksum");
        assert_eq!(err.kind, DecodeErrorKind::InvalidData("invalid payload checksum"));
        let (command, _) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "verack");
    }

    #[test]
    fn oversize_length_resyncs() {
        let mut reader = FrameReader::new(MAGIC);
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&MAGIC);
        bogus.extend_from_slice(b"tx\0\0\0\0\0\0\0\0\0\0");
        bogus.extend_from_slice(&u32::MAX.to_le_bytes());
        bogus.extend_from_slice(&[0u8; 4]);
        reader.feed(&bogus);
        let err = reader.next_frame().expect_err("oversize");
        assert_eq!(err.kind, DecodeErrorKind::SizeTooLarge);
        reader.feed(&encode_frame(MAGIC, "verack", &[]));
        let (command, _) = reader.next_frame().expect("frame").expect("complete");
        assert_eq!(command, "verack");
    }
}
