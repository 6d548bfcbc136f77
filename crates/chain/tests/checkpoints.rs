use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ltcspv_chain::checkpoints::{seed_store, CheckpointError, CheckpointManager};
use ltcspv_chain::{BlockStore, ChainEngine, MemoryBlockStore, StorageError, StoredBlock};
use ltcspv_consensus::params::{chain_config, ChainConfig, Network};
use ltcspv_consensus::Hash256;
use ltcspv_pow::check_proof_of_work;
use ltcspv_primitives::BlockHeader;

const DAY: u32 = 86_400;

fn regtest() -> ChainConfig {
    chain_config(Network::Regtest)
}

fn mine(mut header: BlockHeader, config: &ChainConfig) -> BlockHeader {
    while check_proof_of_work(&header.hash(), header.bits, &config.pow_limit).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// A run of consecutive blocks spaced one day apart, so checkpoint times are
/// easy to reason about.
fn build_chain(config: &ChainConfig, length: usize) -> Vec<StoredBlock> {
    let engine = ChainEngine::new(config.clone(), Arc::new(MemoryBlockStore::new(config)));
    let mut tip = StoredBlock::genesis(config);
    let mut out = Vec::with_capacity(length);
    for salt in 0..length {
        let header = mine(
            BlockHeader {
                version: 1,
                prev_block: tip.hash(),
                merkle_root: [salt as u8; 32],
                time: tip.header.time + DAY,
                bits: tip.header.bits,
                nonce: 0,
            },
            config,
        );
        engine.add_header(header).expect("accept");
        tip = tip.build_next(header).expect("stored");
        out.push(tip);
    }
    out
}

fn encode_binary(signatures: &[[u8; 65]], records: &[StoredBlock]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"CHECKPOINTS 1");
    out.extend_from_slice(&(signatures.len() as u32).to_be_bytes());
    for signature in signatures {
        out.extend_from_slice(signature);
    }
    out.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        out.extend_from_slice(&record.serialize_compact());
    }
    out
}

fn encode_textual(signatures: &[[u8; 65]], records: &[StoredBlock]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("TXT CHECKPOINTS 1\n");
    out.push_str(&format!("{}\n", signatures.len()));
    for signature in signatures {
        out.push_str(&STANDARD_NO_PAD.encode(signature));
        out.push('\n');
    }
    out.push_str(&format!("{}\n", records.len()));
    for record in records {
        out.push_str(&STANDARD_NO_PAD.encode(record.serialize_compact()));
        out.push('\n');
    }
    out.into_bytes()
}

#[test]
fn binary_and_textual_hashes_agree() {
    let config = regtest();
    let chain = build_chain(&config, 6);
    let records = [chain[2], chain[3]];
    let signatures = [[0x5a; 65], [0xa5; 65]];

    let binary = CheckpointManager::from_bytes(&config, &encode_binary(&signatures, &records))
        .expect("binary parses");
    let textual = CheckpointManager::from_bytes(&config, &encode_textual(&signatures, &records))
        .expect("textual parses");

    assert_eq!(binary.num_checkpoints(), 2);
    assert_eq!(textual.num_checkpoints(), 2);
    assert_eq!(binary.num_signatures(), 2);
    assert_eq!(binary.data_hash(), textual.data_hash());
}

#[test]
fn checkpoint_before_picks_floor_entry() {
    let config = regtest();
    let chain = build_chain(&config, 6);
    let records = [chain[1], chain[4]];
    let bundle = encode_binary(&[], &records);
    let manager = CheckpointManager::from_bytes(&config, &bundle).expect("parses");

    // Before the first checkpoint: genesis.
    let genesis = StoredBlock::genesis(&config);
    assert_eq!(manager.checkpoint_before(config.genesis.time + 1), genesis);

    // Between the two: the earlier one.
    assert_eq!(
        manager.checkpoint_before(chain[3].header.time),
        chain[1]
    );

    // Exactly at a checkpoint's time: that checkpoint.
    assert_eq!(manager.checkpoint_before(chain[4].header.time), chain[4]);

    // Far in the future: the latest.
    assert_eq!(manager.checkpoint_before(u32::MAX), chain[4]);
}

#[test]
fn checkpoints_before_returns_predecessor_pair() {
    let config = regtest();
    let chain = build_chain(&config, 6);
    // Heights 4 and 5 are consecutive: the retarget seed pair.
    let records = [chain[1], chain[3], chain[4]];
    let bundle = encode_binary(&[], &records);
    let manager = CheckpointManager::from_bytes(&config, &bundle).expect("parses");

    let pair = manager.checkpoints_before(u32::MAX);
    assert_eq!(pair, vec![chain[3], chain[4]]);

    // The earliest checkpoint has no stored predecessor.
    let only = manager.checkpoints_before(chain[1].header.time);
    assert_eq!(only, vec![chain[1]]);
}

#[test]
fn seed_store_installs_pair_and_head() {
    let config = regtest();
    let chain = build_chain(&config, 6);
    let records = [chain[3], chain[4]];
    let bundle = encode_binary(&[], &records);

    let store = MemoryBlockStore::new(&config);
    // Ask for "now" well past the last checkpoint plus drift allowance.
    let time = chain[4].header.time as u64 + 8 * DAY as u64;
    let head = seed_store(&config, &bundle, &store, time).expect("seeded");

    assert_eq!(head, chain[4]);
    assert_eq!(store.chain_head().expect("head"), chain[4]);
    assert_eq!(
        store.get(&chain[3].hash()).expect("get").expect("stored"),
        chain[3]
    );
}

#[test]
fn seed_store_subtracts_drift_allowance() {
    let config = regtest();
    let chain = build_chain(&config, 6);
    let records = [chain[1], chain[2]];
    let bundle = encode_binary(&[], &records);

    let store = MemoryBlockStore::new(&config);
    // Well past checkpoint 2's time, but the week of drift pushes the
    // selection back to checkpoint 1.
    let time = chain[1].header.time as u64 + 7 * DAY as u64 + DAY as u64 / 2;
    assert!(time > chain[2].header.time as u64);
    let head = seed_store(&config, &bundle, &store, time).expect("seeded");
    assert_eq!(head, chain[1]);
}

struct PrunedStore;

impl BlockStore for PrunedStore {
    fn put(&self, _block: &StoredBlock) -> Result<(), StorageError> {
        Ok(())
    }
    fn get(&self, _hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        Ok(None)
    }
    fn chain_head(&self) -> Result<StoredBlock, StorageError> {
        Err(StorageError::Corrupt("empty"))
    }
    fn set_chain_head(&self, _block: &StoredBlock) -> Result<(), StorageError> {
        Ok(())
    }
    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
    fn is_pruned(&self) -> bool {
        true
    }
}

#[test]
fn pruned_store_refuses_seeding() {
    let config = regtest();
    let chain = build_chain(&config, 2);
    let bundle = encode_binary(&[], &[chain[1]]);
    let err = seed_store(&config, &bundle, &PrunedStore, u64::MAX).expect_err("refused");
    assert!(matches!(err, CheckpointError::UnsupportedOperation));
}

#[test]
fn malformed_bundles_rejected() {
    let config = regtest();
    assert!(matches!(
        CheckpointManager::from_bytes(&config, b"BOGUS"),
        Err(CheckpointError::Format(_))
    ));
    assert!(matches!(
        CheckpointManager::from_bytes(&config, b"CHECKPOINTS 1"),
        Err(CheckpointError::Codec(_))
    ));
    // Zero checkpoints is invalid in both formats.
    let empty = encode_binary(&[], &[]);
    assert!(matches!(
        CheckpointManager::from_bytes(&config, &empty),
        Err(CheckpointError::Format(_))
    ));
    let empty_text = encode_textual(&[], &[]);
    assert!(matches!(
        CheckpointManager::from_bytes(&config, &empty_text),
        Err(CheckpointError::Format(_))
    ));
}

#[test]
fn bundled_resource_name_resolves() {
    let config = regtest();
    let chain = build_chain(&config, 3);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("regtest.checkpoints.txt");
    std::fs::write(&path, encode_textual(&[], &[chain[1], chain[2]])).expect("write bundle");

    let manager = CheckpointManager::open_bundled(&config, dir.path()).expect("opens");
    assert_eq!(manager.num_checkpoints(), 2);
}
