//! Transaction types and serialization, including segregated witness.

use ltcspv_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, DecodeErrorKind, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;
const MAX_INPUTS_OUTPUTS: u64 = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// The txid: double-SHA256 of the serialization without witness data.
    pub fn txid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode_with_mode(&mut encoder, false);
        sha256d(&encoder.into_inner())
    }

    /// The wtxid: double-SHA256 of the full serialization.
    pub fn wtxid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode_with_mode(&mut encoder, self.has_witness());
        sha256d(&encoder.into_inner())
    }

    /// The outpoints this transaction spends, in input order.
    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.inputs.iter().map(|input| &input.prevout)
    }

    fn encode_with_mode(&self, encoder: &mut Encoder, with_witness: bool) {
        encoder.write_i32_le(self.version);
        if with_witness {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        if with_witness {
            for input in &self.inputs {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_with_mode(encoder, self.has_witness());
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        let count_offset = decoder.position();
        let mut input_count = decoder.read_varint()?;
        let mut segwit = false;
        if input_count == 0 {
            // A zero input count is the segwit marker; the real count follows
            // the flag byte.
            let flag = decoder.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(DecodeError {
                    kind: DecodeErrorKind::InvalidData("invalid segwit flag"),
                    offset: count_offset,
                });
            }
            segwit = true;
            input_count = decoder.read_varint()?;
        }
        if input_count > MAX_INPUTS_OUTPUTS {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: count_offset,
            });
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }

        let output_offset = decoder.position();
        let output_count = decoder.read_varint()?;
        if output_count > MAX_INPUTS_OUTPUTS {
            return Err(DecodeError {
                kind: DecodeErrorKind::SizeTooLarge,
                offset: output_offset,
            });
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }

        if segwit {
            for input in &mut inputs {
                let item_count = decoder.read_varint()?;
                let mut witness = Vec::with_capacity(item_count.min(64) as usize);
                for _ in 0..item_count {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
