//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{genesis_header, Block, BlockHeader, HEADER_SIZE};
pub use encoding::{decode, encode, Decodable, DecodeError, DecodeErrorKind, Decoder, Encodable, Encoder};
pub use hash::{sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
