//! Typed peer messages and their payload codecs.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use ltcspv_consensus::constants::{MAX_ADDR_ENTRIES, MAX_HEADERS_RESULTS, MAX_INV_ENTRIES};
use ltcspv_consensus::Hash256;
use ltcspv_primitives::encoding::{
    Decodable, DecodeError, DecodeErrorKind, Decoder, Encodable, Encoder,
};
use ltcspv_primitives::{Block, BlockHeader, Transaction};

use crate::bloom::BloomFilter;

pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;
pub const INV_FILTERED_BLOCK: u32 = 3;

const MAX_LOCATOR_HASHES: u64 = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct InventoryItem {
    pub kind: u32,
    pub hash: Hash256,
}

impl InventoryItem {
    pub fn tx(hash: Hash256) -> Self {
        Self { kind: INV_TX, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: INV_BLOCK,
            hash,
        }
    }
}

impl Encodable for InventoryItem {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.kind);
        encoder.write_hash(&self.hash);
    }
}

impl Decodable for InventoryItem {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let kind = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        Ok(Self { kind, hash })
    }
}

/// The services/ip/port triple embedded in `version` payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
            IpAddr::V6(ip6) => ip6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Encodable for NetAddress {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }
}

impl Decodable for NetAddress {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let services = decoder.read_u64_le()?;
        let ip = decoder.read_fixed::<16>()?;
        let port = decoder.read_u16_be()?;
        Ok(Self { services, ip, port })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimestampedAddress {
    pub time: u32,
    pub address: NetAddress,
}

impl Encodable for TimestampedAddress {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.time);
        self.address.consensus_encode(encoder);
    }
}

impl Decodable for TimestampedAddress {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let time = decoder.read_u32_le()?;
        let address = NetAddress::consensus_decode(decoder)?;
        Ok(Self { time, address })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u64_le(self.services);
        encoder.write_i64_le(self.timestamp);
        self.receiver.consensus_encode(encoder);
        self.sender.consensus_encode(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_var_str(&self.user_agent);
        encoder.write_i32_le(self.start_height);
        encoder.write_u8(self.relay as u8);
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let services = decoder.read_u64_le()?;
        let timestamp = decoder.read_i64_le()?;
        let receiver = NetAddress::consensus_decode(decoder)?;
        let sender = NetAddress::consensus_decode(decoder)?;
        let nonce = decoder.read_u64_le()?;
        let user_agent = decoder.read_var_str()?;
        let start_height = decoder.read_i32_le()?;
        // Old peers omit the relay flag.
        let relay = if decoder.is_empty() {
            true
        } else {
            decoder.read_bool()?
        };
        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: i32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

impl Encodable for GetHeadersMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.locator.len() as u64);
        for hash in &self.locator {
            encoder.write_hash(hash);
        }
        encoder.write_hash(&self.stop);
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let count_offset = decoder.position();
        let count = decoder.read_varint()?;
        if count > MAX_LOCATOR_HASHES {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: count_offset,
            });
        }
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator.push(decoder.read_hash()?);
        }
        let stop = decoder.read_hash()?;
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<Hash256>,
}

impl Encodable for RejectMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.message);
        encoder.write_u8(self.code);
        encoder.write_var_str(&self.reason);
        if let Some(hash) = &self.data {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for RejectMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let message = decoder.read_var_str()?;
        let code = decoder.read_u8()?;
        let reason = decoder.read_var_str()?;
        let data = match decoder.remaining() {
            32 => Some(decoder.read_hash()?),
            _ => None,
        };
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimestampedAddress>),
    GetAddr,
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Box<Block>),
    Mempool,
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    Reject(RejectMessage),
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::Mempool => "mempool",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::Reject(_) => "reject",
            Message::Unknown { command, .. } => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => version.consensus_encode(&mut encoder),
            Message::Verack | Message::GetAddr | Message::Mempool | Message::FilterClear => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Addr(addresses) => {
                encoder.write_varint(addresses.len() as u64);
                for address in addresses {
                    address.consensus_encode(&mut encoder);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                encoder.write_varint(items.len() as u64);
                for item in items {
                    item.consensus_encode(&mut encoder);
                }
            }
            Message::GetHeaders(request) => request.consensus_encode(&mut encoder),
            Message::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode(&mut encoder);
                    // Trailing tx count, always zero in a headers message.
                    encoder.write_varint(0);
                }
            }
            Message::Tx(tx) => tx.consensus_encode(&mut encoder),
            Message::Block(block) => block.consensus_encode(&mut encoder),
            Message::FilterLoad(filter) => filter.consensus_encode(&mut encoder),
            Message::FilterAdd(data) => encoder.write_var_bytes(data),
            Message::Reject(reject) => reject.consensus_encode(&mut encoder),
            Message::Unknown { payload, .. } => encoder.write_bytes(payload),
        }
        encoder.into_inner()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::consensus_decode(&mut decoder)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(decoder.read_u64_le()?),
            "pong" => Message::Pong(decoder.read_u64_le()?),
            "addr" => Message::Addr(decode_list(&mut decoder, MAX_ADDR_ENTRIES)?),
            "getaddr" => Message::GetAddr,
            "inv" => Message::Inv(decode_list(&mut decoder, MAX_INV_ENTRIES)?),
            "getdata" => Message::GetData(decode_list(&mut decoder, MAX_INV_ENTRIES)?),
            "notfound" => Message::NotFound(decode_list(&mut decoder, MAX_INV_ENTRIES)?),
            "getheaders" => Message::GetHeaders(GetHeadersMessage::consensus_decode(&mut decoder)?),
            "headers" => Message::Headers(decode_headers(&mut decoder)?),
            "tx" => Message::Tx(Transaction::consensus_decode(&mut decoder)?),
            "block" => Message::Block(Box::new(Block::consensus_decode(&mut decoder)?)),
            "mempool" => Message::Mempool,
            "filterload" => Message::FilterLoad(BloomFilter::consensus_decode(&mut decoder)?),
            "filteradd" => Message::FilterAdd(decoder.read_var_bytes()?),
            "filterclear" => Message::FilterClear,
            "reject" => Message::Reject(RejectMessage::consensus_decode(&mut decoder)?),
            _ => {
                return Ok(Message::Unknown {
                    command: command.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        if !decoder.is_empty() {
            return Err(decoder.error(DecodeErrorKind::TrailingBytes));
        }
        Ok(message)
    }
}

fn decode_list<T: Decodable>(decoder: &mut Decoder, max: usize) -> Result<Vec<T>, DecodeError> {
    let count_offset = decoder.position();
    let count = decoder.read_varint()?;
    if count > max as u64 {
        return Err(DecodeError {
            kind: DecodeErrorKind::SizeTooLarge,
            offset: count_offset,
        });
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(T::consensus_decode(decoder)?);
    }
    Ok(out)
}

fn decode_headers(decoder: &mut Decoder) -> Result<Vec<BlockHeader>, DecodeError> {
    let count_offset = decoder.position();
    let count = decoder.read_varint()?;
    if count > MAX_HEADERS_RESULTS as u64 {
        return Err(DecodeError {
            kind: DecodeErrorKind::SizeTooLarge,
            offset: count_offset,
        });
    }
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        headers.push(BlockHeader::consensus_decode(decoder)?);
        let _tx_count = decoder.read_varint()?;
    }
    Ok(headers)
}
