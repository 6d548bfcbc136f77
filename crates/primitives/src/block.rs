//! The 80-byte block header.

use ltcspv_consensus::params::GenesisParams;
use ltcspv_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, DecodeErrorKind, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode_to_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    /// Double-SHA256 of the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode_to_vec())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count_offset = decoder.position();
        let count = decoder.read_varint()?;
        if count > MAX_BLOCK_TXS {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: count_offset,
            });
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

const MAX_BLOCK_TXS: u64 = 1_000_000;

/// Reconstructs a network's genesis header from its configured fields.
pub fn genesis_header(genesis: &GenesisParams) -> BlockHeader {
    BlockHeader {
        version: genesis.version,
        prev_block: [0u8; 32],
        merkle_root: genesis.merkle_root,
        time: genesis.time,
        bits: genesis.bits,
        nonce: genesis.nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::hash::hash_to_hex;
    use ltcspv_consensus::params::{chain_config, Network};

    #[test]
    fn header_is_eighty_bytes() {
        let header = genesis_header(&chain_config(Network::Mainnet).genesis);
        assert_eq!(encode(&header).len(), HEADER_SIZE);
    }

    #[test]
    fn header_round_trips() {
        let header = genesis_header(&chain_config(Network::Testnet).genesis);
        let bytes = encode(&header);
        let decoded: BlockHeader = decode(&bytes).expect("decode header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn mainnet_genesis_hash_matches_upstream() {
        let header = genesis_header(&chain_config(Network::Mainnet).genesis);
        assert_eq!(
            hash_to_hex(&header.hash()),
            "12a765e31ffd4059bada1e25190f6e98c99d9714d334efa41a195a7e7e04bfe2"
        );
    }

    #[test]
    fn testnet_genesis_hash_matches_upstream() {
        let header = genesis_header(&chain_config(Network::Testnet).genesis);
        assert_eq!(
            hash_to_hex(&header.hash()),
            "4966625a4b2851d9fdee139e56211a0d88575f59ed816ff5e6a63deb4e3e29a0"
        );
    }
}
