//! Header acceptance, difficulty enforcement, and reorg handling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;
use ltcspv_pow::{
    check_proof_of_work, compact_to_u256, retarget_bits, target_to_compact, CompactError, PowError,
};
use ltcspv_primitives::hash::hash_to_hex;
use ltcspv_primitives::BlockHeader;
use primitive_types::U256;

use crate::notify::{ChainEvent, ChainListener, NotificationExecutor};
use crate::store::{BlockStore, StorageError, StoredBlock};

/// Headers dated after this (2012-02-16) may use the testnet min-difficulty
/// relaxation.
const TESTNET_DIFF_RELAXATION_TIME: u32 = 1_329_264_000;

/// Orphan headers buffered while their ancestors are in flight.
const MAX_ORPHAN_HEADERS: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// Extended the best chain; the new head.
    BestChain(StoredBlock),
    /// Stored on a side chain; head unchanged.
    SideChain(StoredBlock),
    /// Parent unknown; buffered until an ancestor arrives.
    Orphan,
    /// Already stored; nothing written.
    Duplicate,
}

#[derive(Debug)]
pub enum VerificationError {
    Pow(PowError),
    /// A retarget header whose bits disagree with the computed target.
    BadDifficulty { expected: u32, received: u32 },
    /// Difficulty changed outside a transition point.
    UnexpectedDifficultyChange { received: u32, required: u32 },
    /// The walk back to the last transition point fell off the chain.
    MissingRetargetAncestor { missing: Hash256 },
    /// A best-chain block contradicts the bundled checkpoint table.
    CheckpointMismatch { height: u32 },
    BadTarget(CompactError),
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationError::Pow(err) => write!(f, "{err}"),
            VerificationError::BadDifficulty { expected, received } => write!(
                f,
                "network provided difficulty bits do not match what was calculated: \
                 {expected:#x} vs {received:#x}"
            ),
            VerificationError::UnexpectedDifficultyChange { received, required } => write!(
                f,
                "unexpected change in difficulty: {received:#x} vs {required:#x}"
            ),
            VerificationError::MissingRetargetAncestor { missing } => write!(
                f,
                "difficulty transition point but no way back to the last transition: {}",
                hash_to_hex(missing)
            ),
            VerificationError::CheckpointMismatch { height } => {
                write!(f, "block at height {height} contradicts checkpoint table")
            }
            VerificationError::BadTarget(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for VerificationError {}

#[derive(Debug)]
pub enum ChainError {
    Verification(VerificationError),
    Storage(StorageError),
    /// A storage fault stopped the engine; recreate it to resume.
    Halted,
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Verification(err) => write!(f, "{err}"),
            ChainError::Storage(err) => write!(f, "{err}"),
            ChainError::Halted => write!(f, "chain engine halted after storage failure"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<VerificationError> for ChainError {
    fn from(err: VerificationError) -> Self {
        ChainError::Verification(err)
    }
}

impl From<StorageError> for ChainError {
    fn from(err: StorageError) -> Self {
        ChainError::Storage(err)
    }
}

impl From<PowError> for ChainError {
    fn from(err: PowError) -> Self {
        ChainError::Verification(VerificationError::Pow(err))
    }
}

impl From<CompactError> for ChainError {
    fn from(err: CompactError) -> Self {
        ChainError::Verification(VerificationError::BadTarget(err))
    }
}

struct OrphanPool {
    by_parent: HashMap<Hash256, Vec<BlockHeader>>,
    arrival: VecDeque<Hash256>,
    len: usize,
}

impl OrphanPool {
    fn new() -> Self {
        Self {
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
            len: 0,
        }
    }

    fn insert(&mut self, header: BlockHeader) {
        let hash = header.hash();
        let children = self.by_parent.entry(header.prev_block).or_default();
        if children.iter().any(|existing| existing.hash() == hash) {
            return;
        }
        children.push(header);
        self.arrival.push_back(hash);
        self.len += 1;
        while self.len > MAX_ORPHAN_HEADERS {
            self.evict_oldest();
        }
    }

    fn take_children(&mut self, parent: &Hash256) -> Vec<BlockHeader> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        self.len -= children.len();
        let hashes: Vec<Hash256> = children.iter().map(BlockHeader::hash).collect();
        self.arrival.retain(|hash| !hashes.contains(hash));
        children
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.arrival.pop_front() else {
            return;
        };
        for children in self.by_parent.values_mut() {
            if let Some(pos) = children.iter().position(|header| header.hash() == oldest) {
                children.remove(pos);
                self.len -= 1;
                break;
            }
        }
        self.by_parent.retain(|_, children| !children.is_empty());
    }
}

struct EngineState {
    orphans: OrphanPool,
    halted: bool,
}

/// Serialises header acceptance over a pluggable block store and fans out
/// best-chain events to registered listeners.
pub struct ChainEngine {
    config: ChainConfig,
    store: Arc<dyn BlockStore>,
    state: Mutex<EngineState>,
    notifier: NotificationExecutor,
}

impl ChainEngine {
    pub fn new(config: ChainConfig, store: Arc<dyn BlockStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(EngineState {
                orphans: OrphanPool::new(),
                halted: false,
            }),
            notifier: NotificationExecutor::spawn(),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn add_listener(&self, listener: &Arc<dyn ChainListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn chain_head(&self) -> Result<StoredBlock, ChainError> {
        Ok(self.store.chain_head()?)
    }

    pub fn chain_work_at(&self, hash: &Hash256) -> Result<Option<U256>, ChainError> {
        Ok(self.store.get(hash)?.map(|block| block.chain_work))
    }

    /// Validates and stores one header, draining any orphans it unblocks.
    ///
    /// All headers pass through a single lock, so concurrent callers observe
    /// a consistent head and notifications arrive in acceptance order.
    pub fn add_header(&self, header: BlockHeader) -> Result<Acceptance, ChainError> {
        let mut state = self.state.lock().expect("engine lock");
        if state.halted {
            return Err(ChainError::Halted);
        }

        let result = self.accept_header(&mut state, header);
        match &result {
            Err(ChainError::Storage(_)) => {
                state.halted = true;
            }
            Ok(Acceptance::BestChain(block) | Acceptance::SideChain(block)) => {
                let hash = block.hash();
                if let Err(err) = self.drain_orphans(&mut state, hash) {
                    log_warn!("orphan drain stopped: {err}");
                    if matches!(err, ChainError::Storage(_)) {
                        state.halted = true;
                    }
                }
            }
            _ => {}
        }
        result
    }

    fn accept_header(
        &self,
        state: &mut EngineState,
        header: BlockHeader,
    ) -> Result<Acceptance, ChainError> {
        let hash = header.hash();
        if self.store.get(&hash)?.is_some() {
            return Ok(Acceptance::Duplicate);
        }

        let Some(parent) = self.store.get(&header.prev_block)? else {
            log_debug!("orphan header {}", hash_to_hex(&hash));
            state.orphans.insert(header);
            return Ok(Acceptance::Orphan);
        };

        check_proof_of_work(&hash, header.bits, &self.config.pow_limit)?;
        self.check_difficulty_transition(&parent, &header)?;

        let new_block = parent.build_next(header)?;
        if let Some(checkpoint) = self.config.checkpoint_at(new_block.height) {
            if checkpoint.hash != hash {
                return Err(VerificationError::CheckpointMismatch {
                    height: new_block.height,
                }
                .into());
            }
        }

        self.store.put(&new_block)?;

        let head = self.store.chain_head()?;
        if new_block.more_work_than(&head) {
            if new_block.header.prev_block == head.hash() {
                self.store.set_chain_head(&new_block)?;
                log_debug!(
                    "chain head now {} at height {}",
                    hash_to_hex(&hash),
                    new_block.height
                );
            } else {
                self.reorganize(&head, &new_block)?;
            }
            self.notifier.publish(ChainEvent::NewBest(new_block));
            Ok(Acceptance::BestChain(new_block))
        } else {
            log_debug!(
                "side chain block {} at height {}",
                hash_to_hex(&hash),
                new_block.height
            );
            self.notifier.publish(ChainEvent::SideChain(new_block));
            Ok(Acceptance::SideChain(new_block))
        }
    }

    fn drain_orphans(&self, state: &mut EngineState, connected: Hash256) -> Result<(), ChainError> {
        let mut queue = VecDeque::from([connected]);
        while let Some(parent) = queue.pop_front() {
            for orphan in state.orphans.take_children(&parent) {
                match self.accept_header(state, orphan) {
                    Ok(Acceptance::BestChain(block) | Acceptance::SideChain(block)) => {
                        queue.push_back(block.hash());
                    }
                    Ok(_) => {}
                    Err(err @ ChainError::Storage(_)) => return Err(err),
                    Err(err) => {
                        log_warn!("buffered orphan rejected: {err}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Moves the head to `new_tip`, walking both branches back to the fork
    /// point. The head pointer moves in one store transition; observers get
    /// the branch lists to re-evaluate their transactions.
    fn reorganize(&self, old_head: &StoredBlock, new_tip: &StoredBlock) -> Result<(), ChainError> {
        let mut old_branch = Vec::new();
        let mut new_branch = Vec::new();
        let mut old_cursor = *old_head;
        let mut new_cursor = *new_tip;

        while new_cursor.height > old_cursor.height {
            new_branch.push(new_cursor);
            new_cursor = self.expect_parent(&new_cursor)?;
        }
        while old_cursor.height > new_cursor.height {
            old_branch.push(old_cursor);
            old_cursor = self.expect_parent(&old_cursor)?;
        }
        while old_cursor.hash() != new_cursor.hash() {
            old_branch.push(old_cursor);
            new_branch.push(new_cursor);
            old_cursor = self.expect_parent(&old_cursor)?;
            new_cursor = self.expect_parent(&new_cursor)?;
        }
        let fork = old_cursor;

        log_info!(
            "reorganize: {} block(s) unwound, {} connected, fork at height {}",
            old_branch.len(),
            new_branch.len(),
            fork.height
        );

        self.store.set_chain_head(new_tip)?;
        self.notifier.publish(ChainEvent::Reorganize {
            fork,
            old_blocks: old_branch,
            new_blocks: new_branch,
        });
        Ok(())
    }

    fn expect_parent(&self, block: &StoredBlock) -> Result<StoredBlock, ChainError> {
        self.store
            .get(&block.header.prev_block)?
            .ok_or(ChainError::Storage(StorageError::Corrupt(
                "missing parent of stored block",
            )))
    }

    fn check_difficulty_transition(
        &self,
        prev: &StoredBlock,
        next: &BlockHeader,
    ) -> Result<(), ChainError> {
        if self.config.is_difficulty_transition_point(prev.height) {
            return self.check_retarget(prev, next);
        }

        if self.config.allow_min_difficulty && next.time > TESTNET_DIFF_RELAXATION_TIME {
            return self.check_testnet_relaxation(prev, next);
        }

        if next.bits != prev.header.bits {
            return Err(VerificationError::UnexpectedDifficultyChange {
                received: next.bits,
                required: prev.header.bits,
            }
            .into());
        }
        Ok(())
    }

    fn check_retarget(&self, prev: &StoredBlock, next: &BlockHeader) -> Result<(), ChainError> {
        let interval = self.config.retarget_interval as u32;

        // Litecoin measures over a full interval, not interval-1 as Bitcoin
        // does. The very first transition is the historic exception.
        let mut blocks_to_go_back = interval;
        if cfg!(feature = "first-retarget-compat") && prev.height + 1 == interval {
            blocks_to_go_back = interval - 1;
        }

        let mut cursor = *prev;
        for _ in 0..blocks_to_go_back {
            cursor = self.store.get(&cursor.header.prev_block)?.ok_or(
                VerificationError::MissingRetargetAncestor {
                    missing: cursor.header.prev_block,
                },
            )?;
        }

        let timespan = prev.header.time as i64 - cursor.header.time as i64;
        let expected = retarget_bits(
            prev.header.bits,
            timespan,
            self.config.pow_target_timespan,
            &self.config.pow_limit,
            next.bits,
        )?;
        if expected != next.bits {
            return Err(VerificationError::BadDifficulty {
                expected,
                received: next.bits,
            }
            .into());
        }
        Ok(())
    }

    /// Testnet allows a min-difficulty block after a 2*spacing gap. Inside
    /// the gap window the bits must match the last real difficulty, found by
    /// scanning past min-difficulty blocks.
    fn check_testnet_relaxation(
        &self,
        prev: &StoredBlock,
        next: &BlockHeader,
    ) -> Result<(), ChainError> {
        let time_delta = next.time as i64 - prev.header.time as i64;
        if !(0..=self.config.pow_target_spacing * 2).contains(&time_delta) {
            // Gap block: any target up to the limit is acceptable, and the
            // proof-of-work check has already bounded it.
            return Ok(());
        }

        let pow_limit_bits = target_to_compact(&self.config.pow_limit);
        let interval = self.config.retarget_interval as u32;
        let mut cursor = *prev;
        while cursor.height != 0
            && cursor.height % interval != 0
            && cursor.header.bits == pow_limit_bits
        {
            cursor = self.expect_parent(&cursor)?;
        }

        let cursor_target = compact_to_u256(cursor.header.bits)?;
        let next_target = compact_to_u256(next.bits)?;
        if cursor_target != next_target {
            return Err(VerificationError::UnexpectedDifficultyChange {
                received: next.bits,
                required: cursor.header.bits,
            }
            .into());
        }
        Ok(())
    }

    /// A block locator for `getheaders`: dense near the tip, then thinning
    /// exponentially back to genesis.
    pub fn block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        let mut locator = Vec::with_capacity(32);
        let mut cursor = self.store.chain_head()?;
        let mut step = 1u32;
        loop {
            locator.push(cursor.hash());
            if cursor.height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let mut hops = step.min(cursor.height);
            while hops > 0 {
                cursor = self.expect_parent(&cursor)?;
                hops -= 1;
            }
        }
        Ok(locator)
    }
}
