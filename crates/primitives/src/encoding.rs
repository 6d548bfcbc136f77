//! Consensus byte-stream encoding and decoding.
//!
//! Decoding never consumes past a failure: every error carries the offset of
//! the field that failed, and no output is produced on malformed input.

use ltcspv_consensus::constants::MAX_VAR_BYTES;
use ltcspv_consensus::Hash256;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_be(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.write_u8(value as u8);
        } else if value <= 0xffff {
            self.write_u8(0xfd);
            self.write_u16_le(value as u16);
        } else if value <= 0xffff_ffff {
            self.write_u8(0xfe);
            self.write_u32_le(value as u32);
        } else {
            self.write_u8(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

/// A decode failure plus the byte offset of the field that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: usize,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DecodeErrorKind::UnexpectedEof => {
                write!(f, "unexpected end of input at offset {}", self.offset)
            }
            DecodeErrorKind::NonCanonicalVarInt => {
                write!(f, "non-canonical CompactSize at offset {}", self.offset)
            }
            DecodeErrorKind::SizeTooLarge => {
                write!(f, "size exceeds maximum at offset {}", self.offset)
            }
            DecodeErrorKind::InvalidData(message) => {
                write!(f, "{message} at offset {}", self.offset)
            }
            DecodeErrorKind::TrailingBytes => {
                write!(f, "trailing bytes after decode at offset {}", self.offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.input.len()
    }

    pub fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            kind,
            offset: self.cursor,
        }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(self.error(DecodeErrorKind::UnexpectedEof));
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.input[start..start + len])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_slice(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64_le()? as i64)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.read_slice(len)?.to_vec())
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.cursor;
        let prefix = self.read_u8()? as u64;
        let value = if prefix < 0xfd {
            prefix
        } else if prefix == 0xfd {
            let value = self.read_u16_le()? as u64;
            if value < 0xfd {
                return Err(DecodeError {
                    kind: DecodeErrorKind::NonCanonicalVarInt,
                    offset: start,
                });
            }
            value
        } else if prefix == 0xfe {
            let value = self.read_u32_le()? as u64;
            if value < 0x1_0000 {
                return Err(DecodeError {
                    kind: DecodeErrorKind::NonCanonicalVarInt,
                    offset: start,
                });
            }
            value
        } else {
            let value = self.read_u64_le()?;
            if value < 0x1_0000_0000 {
                return Err(DecodeError {
                    kind: DecodeErrorKind::NonCanonicalVarInt,
                    offset: start,
                });
            }
            value
        };
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.cursor;
        let len = self.read_varint()?;
        if len > MAX_VAR_BYTES {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: start,
            });
        }
        self.read_bytes(len as usize)
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let start = self.cursor;
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError {
            kind: DecodeErrorKind::InvalidData("invalid utf8 string"),
            offset: start,
        })
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        let bytes = self.read_slice(32)?;
        Ok(bytes.try_into().expect("read_slice length"))
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(decoder.error(DecodeErrorKind::TrailingBytes));
    }
    Ok(value)
}
