//! BIP37 bloom filters for filtered transaction delivery.

use ltcspv_consensus::constants::{MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS};
use ltcspv_primitives::encoding::{
    Decodable, DecodeError, DecodeErrorKind, Decoder, Encodable, Encoder,
};

const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;
const LN2: f64 = 0.693_147_180_559_945_3;
const SEED_STEP: u32 = 0xfba4_c795;

/// How a matching peer should mutate the filter on a hit (BIP37 nFlags).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BloomUpdate {
    None,
    All,
    P2PubkeyOnly,
}

impl BloomUpdate {
    pub fn as_u8(self) -> u8 {
        match self {
            BloomUpdate::None => 0,
            BloomUpdate::All => 1,
            BloomUpdate::P2PubkeyOnly => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BloomUpdate::None),
            1 => Some(BloomUpdate::All),
            2 => Some(BloomUpdate::P2PubkeyOnly),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomUpdate,
}

impl BloomFilter {
    /// Sizes a filter for `elements` entries at the given false-positive
    /// rate, capped at the BIP37 limits.
    pub fn new(elements: usize, false_positive_rate: f64, tweak: u32, flags: BloomUpdate) -> Self {
        let elements = elements.max(1) as f64;
        let rate = false_positive_rate.clamp(1e-9, 1.0);
        let size = (-1.0 / LN2_SQUARED * elements * rate.ln() / 8.0) as usize;
        let size = size.clamp(1, MAX_BLOOM_FILTER_SIZE);
        let hash_funcs = ((size as f64 * 8.0 / elements) * LN2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_BLOOM_HASH_FUNCS);
        Self {
            data: vec![0u8; size],
            hash_funcs,
            tweak,
            flags,
        }
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn flags(&self) -> BloomUpdate {
        self.flags
    }

    pub fn insert(&mut self, element: &[u8]) {
        for n in 0..self.hash_funcs {
            let bit = self.bit_index(n, element);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let bit = self.bit_index(n, element);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    fn bit_index(&self, n: u32, element: &[u8]) -> usize {
        let seed = n.wrapping_mul(SEED_STEP).wrapping_add(self.tweak);
        murmur3_32(element, seed) as usize % (self.data.len() * 8)
    }
}

impl Encodable for BloomFilter {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
        encoder.write_u32_le(self.hash_funcs);
        encoder.write_u32_le(self.tweak);
        encoder.write_u8(self.flags.as_u8());
    }
}

impl Decodable for BloomFilter {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let start = decoder.position();
        let data = decoder.read_var_bytes()?;
        if data.is_empty() || data.len() > MAX_BLOOM_FILTER_SIZE {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: start,
            });
        }
        let hash_funcs = decoder.read_u32_le()?;
        if hash_funcs == 0 || hash_funcs > MAX_BLOOM_HASH_FUNCS {
            return Err(decoder.error(DecodeErrorKind::InvalidData("bad bloom hash count")));
        }
        let tweak = decoder.read_u32_le()?;
        let flags_offset = decoder.position();
        let flags = BloomUpdate::from_u8(decoder.read_u8()?).ok_or(DecodeError {
            kind: DecodeErrorKind::InvalidData("bad bloom update flag"),
            offset: flags_offset,
        })?;
        Ok(Self {
            data,
            hash_funcs,
            tweak,
            flags,
        })
    }
}

/// MurmurHash3 32-bit, as BIP37 requires.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 = (h1 ^ k1).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 |= (*byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}
