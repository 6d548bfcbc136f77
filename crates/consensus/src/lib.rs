//! Network parameters, monetary rules, and protocol constants.

pub mod constants;
pub mod money;
pub mod params;

pub use money::{block_inflation, is_reward_halving_point, money_range, Amount, COIN};
pub use params::{
    chain_config, hash256_from_hex, AddressParams, ChainConfig, GenesisParams, HeightCheckpoint,
    Network,
};

/// A 256-bit hash stored little-endian, matching the wire byte order.
pub type Hash256 = [u8; 32];
