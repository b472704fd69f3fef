//! Raw transaction layout.

use exploder_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
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
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    /// Hash of the canonical re-encoding. Block-file parsing uses
    /// [`Transaction::decode_with_txid`] instead, which hashes the bytes as found.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn decode_with_txid(decoder: &mut Decoder) -> Result<(Self, Hash256), DecodeError> {
        let start = decoder.position();
        let tx = Self::consensus_decode(decoder)?;
        let raw = decoder.slice(start, decoder.position())?;
        Ok((tx, sha256d(raw)))
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = read_list(decoder)?;
        let vout = read_list(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

fn read_list<T: Decodable>(decoder: &mut Decoder) -> Result<Vec<T>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    // Every element takes at least one byte, so a count above the remaining
    // length can only come from a truncated or corrupt buffer.
    if count > decoder.remaining() {
        return Err(DecodeError::TruncatedInput);
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::consensus_decode(decoder)?);
    }
    Ok(items)
}
