//! Protocol-wide constants shared across the wire and chain crates.

/// The protocol version this library speaks.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// The oldest protocol version we will talk to.
pub const MIN_PROTOCOL_VERSION: i32 = 70_002;
/// First protocol version with BIP37 bloom filtering.
pub const BLOOM_FILTER_VERSION: i32 = 70_000;

/// Service bit advertising full block storage.
pub const NODE_NETWORK: u64 = 1;
/// Service bit advertising BIP37 bloom filter support.
pub const NODE_BLOOM: u64 = 1 << 2;
/// Service bit advertising segregated witness support.
pub const NODE_WITNESS: u64 = 1 << 3;

/// Maximum number of headers in a single `headers` message (network rule).
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Maximum number of entries in a single `inv`/`getdata` message (network rule).
pub const MAX_INV_ENTRIES: usize = 50_000;
/// Maximum number of entries in a single `addr` message (network rule).
pub const MAX_ADDR_ENTRIES: usize = 1_000;
/// Hard cap on any variable-length field inside a message (scripts, witnesses).
pub const MAX_VAR_BYTES: u64 = 10 * 1024 * 1024;
/// Hard cap on a framed message payload.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Largest BIP37 filter, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Largest BIP37 hash-function count.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;
