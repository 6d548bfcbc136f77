//! Stored blocks and the pluggable block store contract.

use std::collections::HashMap;
use std::sync::RwLock;

use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;
use ltcspv_pow::{block_proof, CompactError};
use ltcspv_primitives::encoding::{decode, encode, DecodeError};
use ltcspv_primitives::{genesis_header, BlockHeader, HEADER_SIZE};
use primitive_types::U256;

/// Size of the portable on-disk form: 12-byte work, 4-byte height, header.
pub const COMPACT_SERIALIZED_SIZE: usize = 12 + 4 + HEADER_SIZE;

const MAX_CHAIN_WORK: U256 = U256([u64::MAX, u64::MAX >> 32, 0, 0]);

/// A header annotated with its height and cumulative chain work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub chain_work: U256,
    pub height: u32,
}

impl StoredBlock {
    pub fn genesis(config: &ChainConfig) -> Self {
        let header = genesis_header(&config.genesis);
        let chain_work = block_proof(header.bits).expect("genesis bits");
        Self {
            header,
            chain_work,
            height: 0,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The block that `header` forms on top of this one.
    pub fn build_next(&self, header: BlockHeader) -> Result<StoredBlock, CompactError> {
        let work = block_proof(header.bits)?;
        Ok(StoredBlock {
            header,
            chain_work: self.chain_work + work,
            height: self.height + 1,
        })
    }

    /// Whether this block has more accumulated work than `other`.
    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }

    pub fn serialize_compact(&self) -> [u8; COMPACT_SERIALIZED_SIZE] {
        debug_assert!(self.chain_work <= MAX_CHAIN_WORK);
        let mut out = [0u8; COMPACT_SERIALIZED_SIZE];
        let work = self.chain_work.to_big_endian();
        out[..12].copy_from_slice(&work[20..]);
        out[12..16].copy_from_slice(&self.height.to_be_bytes());
        out[16..].copy_from_slice(&encode(&self.header));
        out
    }

    pub fn deserialize_compact(bytes: &[u8; COMPACT_SERIALIZED_SIZE]) -> Result<Self, DecodeError> {
        let mut work = [0u8; 32];
        work[20..].copy_from_slice(&bytes[..12]);
        let chain_work = U256::from_big_endian(&work);
        let height = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let header: BlockHeader = decode(&bytes[16..])?;
        Ok(Self {
            header,
            chain_work,
            height,
        })
    }
}

#[derive(Debug)]
pub enum StorageError {
    Io(String),
    /// A non-byte-equal rewrite of an existing key.
    Conflict,
    Corrupt(&'static str),
    Closed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(message) => write!(f, "{message}"),
            StorageError::Conflict => write!(f, "conflicting rewrite of stored block"),
            StorageError::Corrupt(message) => write!(f, "corrupt block store: {message}"),
            StorageError::Closed => write!(f, "block store is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Persistence contract for the chain engine.
///
/// Implementations must make `chain_head`/`set_chain_head` atomic with
/// respect to concurrent `get` calls.
pub trait BlockStore: Send + Sync {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError>;
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError>;
    fn chain_head(&self) -> Result<StoredBlock, StorageError>;
    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StorageError>;
    fn close(&self) -> Result<(), StorageError>;

    /// Full-pruned stores cannot be seeded from checkpoints.
    fn is_pruned(&self) -> bool {
        false
    }
}

struct MemoryStoreInner {
    blocks: HashMap<Hash256, StoredBlock>,
    head: StoredBlock,
    closed: bool,
}

/// Hash-map backed store used by tests and short-lived light clients.
pub struct MemoryBlockStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryBlockStore {
    pub fn new(config: &ChainConfig) -> Self {
        let genesis = StoredBlock::genesis(config);
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash(), genesis);
        Self {
            inner: RwLock::new(MemoryStoreInner {
                blocks,
                head: genesis,
                closed: false,
            }),
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("memory store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match inner.blocks.get(&block.hash()) {
            Some(existing) if existing != block => Err(StorageError::Conflict),
            Some(_) => Ok(()),
            None => {
                inner.blocks.insert(block.hash(), *block);
                Ok(())
            }
        }
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        let inner = self.inner.read().expect("memory store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.blocks.get(hash).copied())
    }

    fn chain_head(&self) -> Result<StoredBlock, StorageError> {
        let inner = self.inner.read().expect("memory store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.head)
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("memory store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        inner.head = *block;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("memory store lock");
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltcspv_consensus::params::{chain_config, Network};

    fn config() -> ChainConfig {
        chain_config(Network::Regtest)
    }

    fn next_header(prev: &StoredBlock, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev.hash(),
            merkle_root: [0x42; 32],
            time: prev.header.time + 150,
            bits: prev.header.bits,
            nonce,
        }
    }

    #[test]
    fn compact_form_round_trips() {
        let genesis = StoredBlock::genesis(&config());
        let block = genesis.build_next(next_header(&genesis, 7)).expect("next");
        let bytes = block.serialize_compact();
        assert_eq!(bytes.len(), COMPACT_SERIALIZED_SIZE);
        let decoded = StoredBlock::deserialize_compact(&bytes).expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn put_is_idempotent_but_rejects_conflicts() {
        let config = config();
        let store = MemoryBlockStore::new(&config);
        let genesis = StoredBlock::genesis(&config);
        let block = genesis.build_next(next_header(&genesis, 7)).expect("next");
        store.put(&block).expect("first put");
        store.put(&block).expect("idempotent rewrite");

        let mut conflicting = block;
        conflicting.height += 1;
        assert!(matches!(
            store.put(&conflicting),
            Err(StorageError::Conflict)
        ));
    }

    #[test]
    fn head_starts_at_genesis() {
        let config = config();
        let store = MemoryBlockStore::new(&config);
        let genesis = StoredBlock::genesis(&config);
        assert_eq!(store.chain_head().expect("head"), genesis);
        assert_eq!(
            store.get(&genesis.hash()).expect("get").expect("genesis"),
            genesis
        );
    }

    #[test]
    fn closed_store_errors() {
        let config = config();
        let store = MemoryBlockStore::new(&config);
        store.close().expect("close");
        assert!(matches!(store.chain_head(), Err(StorageError::Closed)));
    }

    #[test]
    fn chain_work_accumulates() {
        let config = config();
        let genesis = StoredBlock::genesis(&config);
        let block = genesis.build_next(next_header(&genesis, 1)).expect("next");
        assert!(block.more_work_than(&genesis));
        assert_eq!(block.height, 1);
    }
}
