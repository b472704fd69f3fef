//! The 80-byte block header.

use exploder_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Decodes a header and hashes the exact 80 bytes that were read.
    pub fn decode_with_hash(decoder: &mut Decoder) -> Result<(Self, Hash256), DecodeError> {
        let start = decoder.position();
        let header = Self::consensus_decode(decoder)?;
        let raw = decoder.slice(start, decoder.position())?;
        Ok((header, sha256d(raw)))
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block == [0u8; 32]
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash32()?,
            merkle_root: decoder.read_hash32()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}
