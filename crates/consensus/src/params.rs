//! Per-network chain configuration, table-driven.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::Mainnet,
        Network::Testnet,
        Network::Signet,
        Network::Regtest,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "main" => Some(Network::Mainnet),
            "test" => Some(Network::Testnet),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// The fields needed to reconstruct a network's genesis header.
#[derive(Clone, Copy, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// Base58 version bytes, BIP32 headers, and the SegWit HRP for one network.
#[derive(Clone, Copy, Debug)]
pub struct AddressParams {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    /// Deprecated P2SH version still seen in old Litecoin addresses.
    pub p2sh_version_legacy: Option<u8>,
    pub wif_version: u8,
    pub bip32_p2pkh: (u32, u32),
    pub bip32_p2wpkh: (u32, u32),
    pub bip32_p2sh_p2wpkh: Option<(u32, u32)>,
    pub segwit_hrp: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeightCheckpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub network: Network,
    pub genesis: GenesisParams,
    /// Proof-of-work limit as a little-endian 256-bit target.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Blocks between difficulty retargets; `i32::MAX` disables retargeting.
    pub retarget_interval: i32,
    pub subsidy_halving_interval: i32,
    /// Testnet rule: min-difficulty blocks allowed after a 2*spacing gap.
    pub allow_min_difficulty: bool,
    pub checkpoints: Vec<HeightCheckpoint>,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub http_seeds: &'static [&'static str],
    pub address: AddressParams,
}

impl ChainConfig {
    pub fn id(&self) -> &'static str {
        self.network.id()
    }

    /// The height→hash entry at `height`, if the table pins one.
    pub fn checkpoint_at(&self, height: u32) -> Option<&HeightCheckpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    /// Whether the block after `previous_height` must retarget.
    pub fn is_difficulty_transition_point(&self, previous_height: u32) -> bool {
        self.retarget_interval != i32::MAX
            && (previous_height + 1) % self.retarget_interval as u32 == 0
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex hash has invalid length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into little-endian bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn chain_config(network: Network) -> ChainConfig {
    match network {
        Network::Mainnet => mainnet_config(),
        Network::Testnet => testnet_config(),
        Network::Signet => signet_config(),
        Network::Regtest => regtest_config(),
    }
}

const TARGET_SPACING: i64 = 150;
const TARGET_TIMESPAN: i64 = 3 * 24 * 60 * 60 + 12 * 60 * 60;
const RETARGET_INTERVAL: i32 = (TARGET_TIMESPAN / TARGET_SPACING) as i32;
const REWARD_HALVING_INTERVAL: i32 = 840_000;

const GENESIS_MERKLE_ROOT: &str =
    "97ddfbbae6be97fd6cdf3e7ca13232a3afff2353e29badfab7f73011edd4ced9";

const MAINNET_DNS_SEEDS: [&str; 5] = [
    "seed-a.litecoin.loshan.co.uk",
    "dnsseed.thrasher.io",
    "dnsseed.litecointools.com",
    "dnsseed.litecoinpool.org",
    "dnsseed.koin-project.com",
];

const TESTNET_DNS_SEEDS: [&str; 3] = [
    "testnet-seed.litecointools.com",
    "seed-b.litecoin.loshan.co.uk",
    "dnsseed-testnet.thrasher.io",
];

const NO_SEEDS: [&str; 0] = [];

fn pow_limit_main() -> Hash256 {
    hash256_from_hex("00000fffff000000000000000000000000000000000000000000000000000000")
        .expect("pow limit")
}

fn pow_limit_regtest() -> Hash256 {
    hash256_from_hex("7fffff0000000000000000000000000000000000000000000000000000000000")
        .expect("regtest pow limit")
}

fn genesis_merkle_root() -> Hash256 {
    hash256_from_hex(GENESIS_MERKLE_ROOT).expect("genesis merkle root")
}

fn mainnet_address_params() -> AddressParams {
    AddressParams {
        p2pkh_version: 48,
        p2sh_version: 50,
        p2sh_version_legacy: Some(5),
        wif_version: 128,
        bip32_p2pkh: (0x0488_b21e, 0x0488_ade4),
        bip32_p2wpkh: (0x04b2_4746, 0x04b2_430c),
        bip32_p2sh_p2wpkh: Some((0x049d_7cb2, 0x049d_7878)),
        segwit_hrp: "ltc",
    }
}

fn testnet_address_params(hrp: &'static str) -> AddressParams {
    AddressParams {
        p2pkh_version: 111,
        p2sh_version: 58,
        p2sh_version_legacy: Some(196),
        wif_version: 239,
        bip32_p2pkh: (0x0435_87cf, 0x0435_8394),
        bip32_p2wpkh: (0x045f_1cf6, 0x045f_18bc),
        bip32_p2sh_p2wpkh: None,
        segwit_hrp: hrp,
    }
}

fn mainnet_config() -> ChainConfig {
    ChainConfig {
        network: Network::Mainnet,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_317_972_665,
            bits: 0x1e0f_fff0,
            nonce: 2_084_524_493,
        },
        pow_limit: pow_limit_main(),
        pow_target_spacing: TARGET_SPACING,
        pow_target_timespan: TARGET_TIMESPAN,
        retarget_interval: RETARGET_INTERVAL,
        subsidy_halving_interval: REWARD_HALVING_INTERVAL,
        allow_min_difficulty: false,
        checkpoints: mainnet_checkpoints(),
        message_start: [0xfb, 0xc0, 0xb6, 0xdb],
        default_port: 9_333,
        dns_seeds: &MAINNET_DNS_SEEDS,
        http_seeds: &NO_SEEDS,
        address: mainnet_address_params(),
    }
}

fn testnet_config() -> ChainConfig {
    ChainConfig {
        network: Network::Testnet,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_486_949_366,
            bits: 0x1e0f_fff0,
            nonce: 293_345,
        },
        pow_limit: pow_limit_main(),
        pow_target_spacing: TARGET_SPACING,
        pow_target_timespan: TARGET_TIMESPAN,
        retarget_interval: RETARGET_INTERVAL,
        subsidy_halving_interval: REWARD_HALVING_INTERVAL,
        allow_min_difficulty: true,
        checkpoints: Vec::new(),
        message_start: [0xfd, 0xd2, 0xc8, 0xf1],
        default_port: 19_335,
        dns_seeds: &TESTNET_DNS_SEEDS,
        http_seeds: &NO_SEEDS,
        address: testnet_address_params("tltc"),
    }
}

fn signet_config() -> ChainConfig {
    // Litecoin has no deployed public signet; this entry exists so the
    // network id and address metadata round-trip. Consensus rules follow
    // testnet and the message start uses the bitcoin-family default.
    ChainConfig {
        network: Network::Signet,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_486_949_366,
            bits: 0x1e0f_fff0,
            nonce: 293_345,
        },
        pow_limit: pow_limit_main(),
        pow_target_spacing: TARGET_SPACING,
        pow_target_timespan: TARGET_TIMESPAN,
        retarget_interval: RETARGET_INTERVAL,
        subsidy_halving_interval: REWARD_HALVING_INTERVAL,
        allow_min_difficulty: false,
        checkpoints: Vec::new(),
        message_start: [0x0a, 0x03, 0xcf, 0x40],
        default_port: 38_333,
        dns_seeds: &NO_SEEDS,
        http_seeds: &NO_SEEDS,
        address: testnet_address_params("tltc"),
    }
}

fn regtest_config() -> ChainConfig {
    ChainConfig {
        network: Network::Regtest,
        genesis: GenesisParams {
            version: 1,
            merkle_root: genesis_merkle_root(),
            time: 1_296_688_602,
            bits: 0x207f_ffff,
            nonce: 2,
        },
        pow_limit: pow_limit_regtest(),
        pow_target_spacing: TARGET_SPACING,
        pow_target_timespan: TARGET_TIMESPAN,
        // Difficulty never changes on regtest.
        retarget_interval: i32::MAX,
        subsidy_halving_interval: 150,
        allow_min_difficulty: true,
        checkpoints: Vec::new(),
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        dns_seeds: &NO_SEEDS,
        http_seeds: &NO_SEEDS,
        address: testnet_address_params("rltc"),
    }
}

fn parse_checkpoints(entries: &[(u32, &str)]) -> Vec<HeightCheckpoint> {
    entries
        .iter()
        .map(|(height, hash)| HeightCheckpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

fn mainnet_checkpoints() -> Vec<HeightCheckpoint> {
    parse_checkpoints(&[
        (
            1500,
            "841a2965955dd288cfa707a755d05a54e45f8bd476835ec9af4402a2b59a2967",
        ),
        (
            4032,
            "9ce90e427198fc0ef05e5905ce3503725b80e26afd35a987965fd7e3d9cf0846",
        ),
        (
            8064,
            "eb984353fc5190f210651f150c40b8a4bab9eeeff0b729fcb3987da694430d70",
        ),
        (
            16128,
            "602edf1859b7f9a6af809f1d9b0e6cb66fdc1d4d9dcd7a4bec03e12a1ccd153d",
        ),
        (
            23420,
            "d80fdf9ca81afd0bd2b2a90ac3a9fe547da58f2530ec874e978fce0b5101b507",
        ),
        (
            50000,
            "69dc37eb029b68f075a5012dcc0419c127672adb4f3a32882b2b3e71d07a20a6",
        ),
        (
            80000,
            "4fcb7c02f676a300503f49c764a89955a8f920b46a8cbecb4867182ecdb2e90a",
        ),
        (
            120000,
            "bd9d26924f05f6daa7f0155f32828ec89e8e29cee9e7121b026a7a3552ac6131",
        ),
        (
            161500,
            "dbe89880474f4bb4f75c227c77ba1cdc024991123b28b8418dbbf7798471ff43",
        ),
        (
            179620,
            "2ad9c65c990ac00426d18e446e0fd7be2ffa69e9a7dcb28358a50b2b78b9f709",
        ),
        (
            240000,
            "7140d1c4b4c2157ca217ee7636f24c9c73db39c4590c4e6eab2e3ea1555088aa",
        ),
        (
            383640,
            "2b6809f094a9215bafc65eb3f110a35127a34be94b7d0590a096c3f126c6f364",
        ),
        (
            409004,
            "487518d663d9f1fa08611d9395ad74d982b667fbdc0e77e9cf39b4f1355908a3",
        ),
        (
            456000,
            "bf34f71cc6366cd487930d06be22f897e34ca6a40501ac7d401be32456372004",
        ),
        (
            541794,
            "1cbccbe6920e7c258bbce1f26211084efb19764aa3224bec3f4320d77d6a2fd2",
        ),
        (
            585010,
            "ea9ea06840de20a18a66acb07c9102ee6374ad2cbafc71794e576354fea5df2d",
        ),
        (
            638902,
            "15238656e8ec63d28de29a8c75fcf3a5819afc953dcd9cc45cecc53baec74f38",
        ),
    ])
}
