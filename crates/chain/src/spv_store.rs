//! A fixed-record ring file holding the most recent headers.
//!
//! Layout: a 52-byte file header (`magic`, record capacity, write cursor,
//! chain-head hash) followed by `capacity` slots of 128 bytes each (32-byte
//! block hash plus the 96-byte compact record). Once the ring is full the
//! oldest slot is overwritten; an SPV client only ever needs the recent
//! window of headers plus the head.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::RwLock;

use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;

use crate::store::{BlockStore, StorageError, StoredBlock, COMPACT_SERIALIZED_SIZE};

const FILE_MAGIC: &[u8; 12] = b"LTCSPV BLK1\0";
const FILE_HEADER_SIZE: u64 = 12 + 4 + 4 + 32;
const SLOT_SIZE: u64 = 32 + COMPACT_SERIALIZED_SIZE as u64;

/// Default ring capacity, a comfortable multiple of the retarget interval.
pub const DEFAULT_CAPACITY: u32 = 10_000;

struct SpvStoreInner {
    file: File,
    capacity: u32,
    cursor: u32,
    slots: Vec<Option<Hash256>>,
    index: HashMap<Hash256, StoredBlock>,
    head: StoredBlock,
    closed: bool,
}

pub struct SpvFileStore {
    inner: RwLock<SpvStoreInner>,
}

impl SpvFileStore {
    pub fn open(config: &ChainConfig, path: &Path) -> Result<Self, StorageError> {
        Self::open_with_capacity(config, path, DEFAULT_CAPACITY)
    }

    pub fn open_with_capacity(
        config: &ChainConfig,
        path: &Path,
        capacity: u32,
    ) -> Result<Self, StorageError> {
        if capacity == 0 {
            return Err(StorageError::Corrupt("capacity must be non-zero"));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let inner = if len == 0 {
            Self::initialize(config, &mut file, capacity)?
        } else {
            Self::load(&mut file)?
        };
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    fn initialize(
        config: &ChainConfig,
        file: &mut File,
        capacity: u32,
    ) -> Result<SpvStoreInner, StorageError> {
        let genesis = StoredBlock::genesis(config);
        file.set_len(FILE_HEADER_SIZE + capacity as u64 * SLOT_SIZE)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(FILE_MAGIC)?;
        file.write_all(&capacity.to_be_bytes())?;
        file.write_all(&0u32.to_be_bytes())?;
        file.write_all(&genesis.hash())?;

        let mut inner = SpvStoreInner {
            file: file.try_clone()?,
            capacity,
            cursor: 0,
            slots: vec![None; capacity as usize],
            index: HashMap::new(),
            head: genesis,
            closed: false,
        };
        write_slot(&mut inner, &genesis)?;
        inner.file.sync_data()?;
        Ok(inner)
    }

    fn load(file: &mut File) -> Result<SpvStoreInner, StorageError> {
        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 12];
        file.read_exact(&mut magic)?;
        if &magic != FILE_MAGIC {
            return Err(StorageError::Corrupt("bad file magic"));
        }
        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let capacity = u32::from_be_bytes(word);
        if capacity == 0 {
            return Err(StorageError::Corrupt("zero capacity"));
        }
        file.read_exact(&mut word)?;
        let cursor = u32::from_be_bytes(word);
        if cursor >= capacity {
            return Err(StorageError::Corrupt("cursor out of range"));
        }
        let mut head_hash = [0u8; 32];
        file.read_exact(&mut head_hash)?;

        let mut slots = vec![None; capacity as usize];
        let mut index = HashMap::new();
        for slot in 0..capacity {
            file.seek(SeekFrom::Start(FILE_HEADER_SIZE + slot as u64 * SLOT_SIZE))?;
            let mut hash = [0u8; 32];
            file.read_exact(&mut hash)?;
            if hash == [0u8; 32] {
                continue;
            }
            let mut record = [0u8; COMPACT_SERIALIZED_SIZE];
            file.read_exact(&mut record)?;
            let block = StoredBlock::deserialize_compact(&record)
                .map_err(|_| StorageError::Corrupt("undecodable record"))?;
            if block.hash() != hash {
                return Err(StorageError::Corrupt("record hash mismatch"));
            }
            slots[slot as usize] = Some(hash);
            index.insert(hash, block);
        }

        let head = *index
            .get(&head_hash)
            .ok_or(StorageError::Corrupt("chain head not in ring"))?;

        Ok(SpvStoreInner {
            file: file.try_clone()?,
            capacity,
            cursor,
            slots,
            index,
            head,
            closed: false,
        })
    }
}

fn write_slot(inner: &mut SpvStoreInner, block: &StoredBlock) -> Result<(), StorageError> {
    let slot = inner.cursor as usize;
    if let Some(evicted) = inner.slots[slot].take() {
        inner.index.remove(&evicted);
    }
    let hash = block.hash();
    inner
        .file
        .seek(SeekFrom::Start(FILE_HEADER_SIZE + slot as u64 * SLOT_SIZE))?;
    inner.file.write_all(&hash)?;
    inner.file.write_all(&block.serialize_compact())?;

    inner.slots[slot] = Some(hash);
    inner.index.insert(hash, *block);
    inner.cursor = (inner.cursor + 1) % inner.capacity;
    inner.file.seek(SeekFrom::Start(16))?;
    inner.file.write_all(&inner.cursor.to_be_bytes())?;
    Ok(())
}

impl BlockStore for SpvFileStore {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("spv store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match inner.index.get(&block.hash()) {
            Some(existing) if existing != block => return Err(StorageError::Conflict),
            Some(_) => return Ok(()),
            None => {}
        }
        write_slot(&mut inner, block)
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        let inner = self.inner.read().expect("spv store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.index.get(hash).copied())
    }

    fn chain_head(&self) -> Result<StoredBlock, StorageError> {
        let inner = self.inner.read().expect("spv store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.head)
    }

    fn set_chain_head(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("spv store lock");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if !inner.index.contains_key(&block.hash()) {
            return Err(StorageError::Corrupt("chain head must be stored first"));
        }
        inner.head = *block;
        inner.file.seek(SeekFrom::Start(20))?;
        inner.file.write_all(&block.hash())?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("spv store lock");
        if inner.closed {
            return Ok(());
        }
        inner.file.sync_data()?;
        inner.closed = true;
        Ok(())
    }
}

impl Drop for SpvFileStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltcspv_consensus::params::{chain_config, Network};
    use ltcspv_primitives::BlockHeader;

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
    fn persists_across_reopen() {
        let config = chain_config(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.spv");

        let genesis = StoredBlock::genesis(&config);
        let block = genesis.build_next(next_header(&genesis, 7)).expect("next");
        {
            let store = SpvFileStore::open(&config, &path).expect("open");
            store.put(&block).expect("put");
            store.set_chain_head(&block).expect("set head");
            store.close().expect("close");
        }

        let store = SpvFileStore::open(&config, &path).expect("reopen");
        assert_eq!(store.chain_head().expect("head"), block);
        assert_eq!(
            store.get(&genesis.hash()).expect("get").expect("genesis"),
            genesis
        );
    }

    #[test]
    fn ring_evicts_oldest() {
        let config = chain_config(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.spv");

        let store = SpvFileStore::open_with_capacity(&config, &path, 4).expect("open");
        let genesis = StoredBlock::genesis(&config);
        let mut tip = genesis;
        for nonce in 0..4 {
            tip = tip.build_next(next_header(&tip, nonce)).expect("next");
            store.put(&tip).expect("put");
            store.set_chain_head(&tip).expect("set head");
        }

        // Genesis sat in slot 0 and has been overwritten by now.
        assert!(store.get(&genesis.hash()).expect("get").is_none());
        assert_eq!(store.chain_head().expect("head"), tip);
    }

    #[test]
    fn rejects_foreign_head() {
        let config = chain_config(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.spv");
        let store = SpvFileStore::open(&config, &path).expect("open");

        let genesis = StoredBlock::genesis(&config);
        let unstored = genesis.build_next(next_header(&genesis, 9)).expect("next");
        assert!(store.set_chain_head(&unstored).is_err());
    }

    #[test]
    fn conflicting_rewrite_fails() {
        let config = chain_config(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.spv");
        let store = SpvFileStore::open(&config, &path).expect("open");

        let genesis = StoredBlock::genesis(&config);
        let block = genesis.build_next(next_header(&genesis, 7)).expect("next");
        store.put(&block).expect("put");
        let mut conflicting = block;
        conflicting.chain_work += primitive_types::U256::from(1u64);
        assert!(matches!(
            store.put(&conflicting),
            Err(StorageError::Conflict)
        ));
    }
}
