//! Proof-of-work target arithmetic and the Litecoin retarget rule.

pub mod difficulty;

pub use difficulty::{
    block_proof, check_proof_of_work, compact_to_target, compact_to_u256, hash_meets_target,
    retarget_bits, round_to_received_precision, target_to_compact, u256_to_compact, CompactError,
    PowError,
};
