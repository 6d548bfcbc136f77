//! Peer message types, framing, and BIP37 bloom filters.

pub mod bloom;
pub mod framing;
pub mod message;

pub use bloom::{BloomFilter, BloomUpdate};
pub use framing::{encode_frame, frame_message, FrameReader, FRAME_HEADER_SIZE};
pub use message::{
    GetHeadersMessage, InventoryItem, Message, NetAddress, RejectMessage, TimestampedAddress,
    VersionMessage, INV_BLOCK, INV_FILTERED_BLOCK, INV_TX,
};
