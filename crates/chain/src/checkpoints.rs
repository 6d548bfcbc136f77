//! Signed checkpoint bundles used to seed fresh block stores.
//!
//! Two formats share one content hash. The binary form is
//! `"CHECKPOINTS 1"`, a big-endian signature count and 65-byte signatures,
//! then a big-endian record count followed by 96-byte compact records; the
//! hash covers everything after the signatures. The textual form is
//! line-oriented base64 of the same records, hashed as
//! `BE(record_count) || records` so both forms agree.

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;
use ltcspv_primitives::encoding::{DecodeError, DecodeErrorKind, Decoder};
use ltcspv_primitives::sha256;

use crate::store::{BlockStore, StorageError, StoredBlock, COMPACT_SERIALIZED_SIZE};

const BINARY_MAGIC: &[u8] = b"CHECKPOINTS 1";
const TEXTUAL_MAGIC: &str = "TXT CHECKPOINTS 1";
const MAX_SIGNATURES: u32 = 256;
const SIGNATURE_SIZE: usize = 65;

/// Clock-drift allowance subtracted before picking a seed checkpoint.
const DRIFT_ALLOWANCE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug)]
pub enum CheckpointError {
    Io(String),
    Format(&'static str),
    Codec(DecodeError),
    Storage(StorageError),
    /// Checkpoint seeding implies SPV; full-pruned stores refuse it.
    UnsupportedOperation,
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Io(message) => write!(f, "{message}"),
            CheckpointError::Format(message) => write!(f, "{message}"),
            CheckpointError::Codec(err) => write!(f, "{err}"),
            CheckpointError::Storage(err) => write!(f, "{err}"),
            CheckpointError::UnsupportedOperation => {
                write!(f, "cannot use checkpointing with a full store")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}

impl From<DecodeError> for CheckpointError {
    fn from(err: DecodeError) -> Self {
        CheckpointError::Codec(err)
    }
}

impl From<StorageError> for CheckpointError {
    fn from(err: StorageError) -> Self {
        CheckpointError::Storage(err)
    }
}

/// Vends the bundled checkpoints, keyed by header time.
pub struct CheckpointManager {
    genesis: StoredBlock,
    checkpoints: BTreeMap<u32, StoredBlock>,
    signatures: Vec<[u8; SIGNATURE_SIZE]>,
    data_hash: Hash256,
}

impl CheckpointManager {
    /// Parses either bundle format, sniffed from the first byte.
    pub fn from_bytes(config: &ChainConfig, bytes: &[u8]) -> Result<Self, CheckpointError> {
        let genesis = StoredBlock::genesis(config);
        match bytes.first() {
            Some(b'C') => Self::read_binary(genesis, bytes),
            Some(b'T') => Self::read_textual(genesis, bytes),
            _ => Err(CheckpointError::Format("unsupported checkpoint format")),
        }
    }

    /// Loads `<networkId>.checkpoints.txt` from a bundle directory.
    pub fn open_bundled(config: &ChainConfig, dir: &Path) -> Result<Self, CheckpointError> {
        let path = dir.join(format!("{}.checkpoints.txt", config.id()));
        let bytes = std::fs::read(path)?;
        Self::from_bytes(config, &bytes)
    }

    fn read_binary(genesis: StoredBlock, bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut decoder = Decoder::new(bytes);
        let magic = decoder.read_bytes(BINARY_MAGIC.len())?;
        if magic != BINARY_MAGIC {
            return Err(CheckpointError::Format("header bytes did not match"));
        }
        let num_signatures = decoder.read_u32_be()?;
        if num_signatures >= MAX_SIGNATURES {
            return Err(CheckpointError::Format("signature count out of range"));
        }
        let mut signatures = Vec::with_capacity(num_signatures as usize);
        for _ in 0..num_signatures {
            signatures.push(decoder.read_fixed::<SIGNATURE_SIZE>()?);
        }

        // The signatures sign everything that follows them.
        let data_hash = sha256(&bytes[bytes.len() - decoder.remaining()..]);

        let num_checkpoints = decoder.read_u32_be()?;
        if num_checkpoints == 0 {
            return Err(CheckpointError::Format("empty checkpoint bundle"));
        }
        let mut checkpoints = BTreeMap::new();
        for _ in 0..num_checkpoints {
            let record = decoder.read_fixed::<COMPACT_SERIALIZED_SIZE>()?;
            let block = StoredBlock::deserialize_compact(&record)?;
            checkpoints.insert(block.header.time, block);
        }
        if !decoder.is_empty() {
            return Err(CheckpointError::Codec(
                decoder.error(DecodeErrorKind::TrailingBytes),
            ));
        }

        Ok(Self {
            genesis,
            checkpoints,
            signatures,
            data_hash,
        })
    }

    fn read_textual(genesis: StoredBlock, bytes: &[u8]) -> Result<Self, CheckpointError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CheckpointError::Format("bundle is not ascii"))?;
        let mut lines = text.lines();

        if lines.next() != Some(TEXTUAL_MAGIC) {
            return Err(CheckpointError::Format("unexpected magic line"));
        }
        let num_signatures: u32 = next_line(&mut lines)?
            .parse()
            .map_err(|_| CheckpointError::Format("bad signature count"))?;
        if num_signatures >= MAX_SIGNATURES {
            return Err(CheckpointError::Format("signature count out of range"));
        }
        let mut signatures = Vec::with_capacity(num_signatures as usize);
        for _ in 0..num_signatures {
            let decoded = decode_base64(next_line(&mut lines)?)?;
            let signature: [u8; SIGNATURE_SIZE] = decoded
                .try_into()
                .map_err(|_| CheckpointError::Format("bad signature length"))?;
            signatures.push(signature);
        }

        let num_checkpoints: u32 = next_line(&mut lines)?
            .parse()
            .map_err(|_| CheckpointError::Format("bad checkpoint count"))?;
        if num_checkpoints == 0 {
            return Err(CheckpointError::Format("empty checkpoint bundle"));
        }

        // Hash the count big-endian plus raw records, matching the binary
        // format's digest byte for byte.
        let mut hashed = Vec::with_capacity(4 + num_checkpoints as usize * COMPACT_SERIALIZED_SIZE);
        hashed.extend_from_slice(&num_checkpoints.to_be_bytes());

        let mut checkpoints = BTreeMap::new();
        for _ in 0..num_checkpoints {
            let decoded = decode_base64(next_line(&mut lines)?)?;
            let record: [u8; COMPACT_SERIALIZED_SIZE] = decoded
                .try_into()
                .map_err(|_| CheckpointError::Format("bad record length"))?;
            hashed.extend_from_slice(&record);
            let block = StoredBlock::deserialize_compact(&record)?;
            checkpoints.insert(block.header.time, block);
        }

        Ok(Self {
            genesis,
            checkpoints,
            signatures,
            data_hash: sha256(&hashed),
        })
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn num_signatures(&self) -> usize {
        self.signatures.len()
    }

    /// A hash of the checkpoint content, identical for both formats.
    pub fn data_hash(&self) -> Hash256 {
        self.data_hash
    }

    /// The latest checkpoint with `header.time <= time`, or genesis.
    pub fn checkpoint_before(&self, time: u32) -> StoredBlock {
        self.checkpoints
            .range(..=time)
            .next_back()
            .map(|(_, block)| *block)
            .unwrap_or(self.genesis)
    }

    /// The latest checkpoint before `time` plus its height predecessor.
    ///
    /// Litecoin's retarget at height H reads the header at `H - interval`,
    /// so seeding a store needs the checkpoint pair, not just the latest.
    pub fn checkpoints_before(&self, time: u32) -> Vec<StoredBlock> {
        let Some(latest) = self
            .checkpoints
            .range(..=time)
            .next_back()
            .map(|(_, block)| *block)
        else {
            return vec![self.genesis];
        };

        let mut out = Vec::with_capacity(2);
        if let Some(predecessor) = self
            .checkpoints
            .values()
            .find(|block| block.height + 1 == latest.height)
        {
            out.push(*predecessor);
        }
        out.push(latest);
        out
    }
}

/// Initializes a fresh store from a bundle: picks the checkpoint pair before
/// `time` (less a week of clock drift) and sets the latest as head.
pub fn seed_store(
    config: &ChainConfig,
    bundle: &[u8],
    store: &dyn BlockStore,
    time: u64,
) -> Result<StoredBlock, CheckpointError> {
    if store.is_pruned() {
        return Err(CheckpointError::UnsupportedOperation);
    }

    let adjusted = time.saturating_sub(DRIFT_ALLOWANCE_SECS);
    let adjusted = u32::try_from(adjusted).unwrap_or(u32::MAX);
    let manager = CheckpointManager::from_bytes(config, bundle)?;
    let blocks = manager.checkpoints_before(adjusted);

    let last = *blocks.last().expect("at least genesis");
    for block in &blocks {
        store.put(block)?;
    }
    store.set_chain_head(&last)?;
    Ok(last)
}

fn next_line<'a>(lines: &mut std::str::Lines<'a>) -> Result<&'a str, CheckpointError> {
    lines
        .next()
        .map(str::trim)
        .ok_or(CheckpointError::Format("truncated bundle"))
}

fn decode_base64(line: &str) -> Result<Vec<u8>, CheckpointError> {
    STANDARD_NO_PAD
        .decode(line)
        .or_else(|_| STANDARD.decode(line))
        .map_err(|_| CheckpointError::Format("bad base64 line"))
}
