//! Persisted record layouts and key builders.

use exploder_consensus::{Amount, Hash256};
use exploder_parser::model::{Block, ChainId, DatPosition, Transaction, Vin, Vout};
use exploder_primitives::encoding::{DecodeError, Decoder, Encoder};
use exploder_script::ScriptKind;
use primitive_types::U256;
use smallvec::SmallVec;

pub(crate) const RECORD_VERSION: u8 = 1;

pub const META_TIP: &[u8] = b"tip";
pub const META_NEXT_SIDE_CHAIN: &[u8] = b"next_side_chain";
pub const META_BLOCK_COUNT: &[u8] = b"block_count";
pub const META_TX_COUNT: &[u8] = b"tx_count";
pub const META_SYNC_LOCK: &[u8] = b"sync_lock";
pub const META_NETWORK_STATS: &[u8] = b"network_stats";

pub type AddressKey = SmallVec<[u8; 72]>;

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub fn side_chain_prefix(chain: ChainId) -> [u8; 4] {
    chain.0.to_be_bytes()
}

pub fn side_chain_key(chain: ChainId, height: u32, hash: &Hash256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[0..4].copy_from_slice(&chain.0.to_be_bytes());
    key[4..8].copy_from_slice(&height.to_be_bytes());
    key[8..40].copy_from_slice(hash);
    key
}

pub fn parse_side_chain_key(key: &[u8]) -> Option<(ChainId, u32, Hash256)> {
    if key.len() != 40 {
        return None;
    }
    let chain = u32::from_be_bytes(key[0..4].try_into().ok()?);
    let height = u32::from_be_bytes(key[4..8].try_into().ok()?);
    let hash: Hash256 = key[8..40].try_into().ok()?;
    Some((ChainId(chain), height, hash))
}

pub fn tx_block_key(txid: &Hash256, block: &Hash256) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[0..32].copy_from_slice(txid);
    key[32..64].copy_from_slice(block);
    key
}

/// `txid || index (BE)`; also the prefix of the spender entries of that output.
pub fn output_key(txid: &Hash256, index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[0..32].copy_from_slice(txid);
    key[32..36].copy_from_slice(&index.to_be_bytes());
    key
}

pub fn parse_output_key(key: &[u8]) -> Option<(Hash256, u32)> {
    if key.len() < 36 {
        return None;
    }
    let txid: Hash256 = key[0..32].try_into().ok()?;
    let index = u32::from_be_bytes(key[32..36].try_into().ok()?);
    Some((txid, index))
}

pub fn spender_key(txid: &Hash256, index: u32, spender: &Hash256) -> [u8; 68] {
    let mut key = [0u8; 68];
    key[0..36].copy_from_slice(&output_key(txid, index));
    key[36..68].copy_from_slice(spender);
    key
}

pub fn parse_spender_key(key: &[u8]) -> Option<(Hash256, u32, Hash256)> {
    if key.len() != 68 {
        return None;
    }
    let (txid, index) = parse_output_key(key)?;
    let spender: Hash256 = key[36..68].try_into().ok()?;
    Some((txid, index, spender))
}

/// Length-prefixed address, so that one address is never a prefix of another.
pub fn address_prefix(address: &str) -> AddressKey {
    let bytes = address.as_bytes();
    let mut key = AddressKey::new();
    key.push(bytes.len().min(u8::MAX as usize) as u8);
    key.extend_from_slice(&bytes[..bytes.len().min(u8::MAX as usize)]);
    key
}

pub fn address_output_key(address: &str, txid: &Hash256, index: u32) -> AddressKey {
    let mut key = address_prefix(address);
    key.extend_from_slice(&output_key(txid, index));
    key
}

/// Output reference at the end of an address entry key.
pub fn parse_address_output_key(key: &[u8]) -> Option<(Hash256, u32)> {
    let prefix_len = 1 + *key.first()? as usize;
    parse_output_key(key.get(prefix_len..)?)
}

pub fn encode_spent(spent: bool) -> [u8; 1] {
    [u8::from(spent)]
}

pub fn decode_spent(bytes: &[u8]) -> bool {
    bytes.first().copied().unwrap_or(0) != 0
}

/// Block as stored, with the fields the chain graph assigns.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub version: i32,
    pub previousblockhash: Option<Hash256>,
    pub nextblockhash: Option<Hash256>,
    pub merkleroot: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub difficulty: f64,
    pub size: u32,
    pub height: u32,
    pub chainwork: U256,
    pub work: U256,
    pub chain: ChainId,
    pub total: Amount,
    pub tx: Vec<Hash256>,
    pub dat: Option<DatPosition>,
}

impl BlockRecord {
    pub fn from_block(block: &Block, height: u32, chainwork: U256, chain: ChainId) -> Self {
        let header = &block.header;
        Self {
            hash: header.hash(),
            version: header.version(),
            previousblockhash: header.previousblockhash(),
            nextblockhash: None,
            merkleroot: header.merkleroot(),
            time: header.time(),
            bits: header.bits(),
            nonce: header.nonce(),
            difficulty: header.difficulty(),
            size: block.size,
            height,
            chainwork,
            work: block.work,
            chain,
            total: block.total,
            tx: block.txids(),
            dat: block.dat,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(RECORD_VERSION);
        encoder.write_hash(&self.hash);
        encoder.write_i32_le(self.version);
        write_opt_hash(&mut encoder, self.previousblockhash.as_ref());
        write_opt_hash(&mut encoder, self.nextblockhash.as_ref());
        encoder.write_hash(&self.merkleroot);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u64_le(self.difficulty.to_bits());
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.height);
        encoder.write_bytes(&self.chainwork.to_big_endian());
        encoder.write_bytes(&self.work.to_big_endian());
        encoder.write_u32_le(self.chain.0);
        encoder.write_i64_le(self.total);
        encoder.write_varint(self.tx.len() as u64);
        for txid in &self.tx {
            encoder.write_hash(txid);
        }
        match &self.dat {
            Some(dat) => {
                encoder.write_bool(true);
                encoder.write_u32_le(dat.index);
                encoder.write_u64_le(dat.start);
                encoder.write_u64_le(dat.end);
            }
            None => encoder.write_bool(false),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        read_record_version(&mut decoder)?;
        let hash = decoder.read_hash32()?;
        let version = decoder.read_i32_le()?;
        let previousblockhash = read_opt_hash(&mut decoder)?;
        let nextblockhash = read_opt_hash(&mut decoder)?;
        let merkleroot = decoder.read_hash32()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let difficulty = f64::from_bits(decoder.read_u64_le()?);
        let size = decoder.read_u32_le()?;
        let height = decoder.read_u32_le()?;
        let chainwork = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        let work = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        let chain = ChainId(decoder.read_u32_le()?);
        let total = decoder.read_i64_le()?;
        let count = read_count(&mut decoder, 32)?;
        let mut tx = Vec::with_capacity(count);
        for _ in 0..count {
            tx.push(decoder.read_hash32()?);
        }
        let dat = if decoder.read_bool()? {
            Some(DatPosition {
                index: decoder.read_u32_le()?,
                start: decoder.read_u64_le()?,
                end: decoder.read_u64_le()?,
            })
        } else {
            None
        };
        finish(&decoder)?;
        Ok(Self {
            hash,
            version,
            previousblockhash,
            nextblockhash,
            merkleroot,
            time,
            bits,
            nonce,
            difficulty,
            size,
            height,
            chainwork,
            work,
            chain,
            total,
            tx,
            dat,
        })
    }
}

/// Transaction record; output spent flags live in the output column and are
/// not part of the encoding.
pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u8(RECORD_VERSION);
    encoder.write_hash(&tx.txid);
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.locktime);
    encoder.write_i64_le(tx.total);
    write_opt_hash(&mut encoder, tx.blockhash.as_ref());
    match tx.blocktime {
        Some(time) => {
            encoder.write_bool(true);
            encoder.write_u32_le(time);
        }
        None => encoder.write_bool(false),
    }
    encoder.write_varint(tx.vin.len() as u64);
    for vin in &tx.vin {
        match vin {
            Vin::Coinbase { script, sequence } => {
                encoder.write_u8(0);
                encoder.write_var_bytes(script);
                encoder.write_u32_le(*sequence);
            }
            Vin::Spend {
                prev_txid,
                vout_index,
                script_sig,
                sequence,
            } => {
                encoder.write_u8(1);
                encoder.write_hash(prev_txid);
                encoder.write_u32_le(*vout_index);
                encoder.write_var_bytes(script_sig);
                encoder.write_u32_le(*sequence);
            }
        }
    }
    encoder.write_varint(tx.vout.len() as u64);
    for vout in &tx.vout {
        encoder.write_u32_le(vout.index);
        encoder.write_i64_le(vout.value);
        encoder.write_var_bytes(&vout.script);
        encoder.write_var_str(&vout.asm);
        encoder.write_u8(script_kind_tag(vout.kind));
        encoder.write_u32_le(vout.req_sigs);
        encoder.write_varint(vout.addresses.len() as u64);
        for address in &vout.addresses {
            encoder.write_var_str(address);
        }
    }
    encoder.into_inner()
}

pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    read_record_version(&mut decoder)?;
    let txid = decoder.read_hash32()?;
    let version = decoder.read_i32_le()?;
    let locktime = decoder.read_u32_le()?;
    let total = decoder.read_i64_le()?;
    let blockhash = read_opt_hash(&mut decoder)?;
    let blocktime = if decoder.read_bool()? {
        Some(decoder.read_u32_le()?)
    } else {
        None
    };

    let vin_count = read_count(&mut decoder, 6)?;
    let mut vin = Vec::with_capacity(vin_count);
    for _ in 0..vin_count {
        let entry = match decoder.read_u8()? {
            0 => Vin::Coinbase {
                script: decoder.read_var_bytes()?,
                sequence: decoder.read_u32_le()?,
            },
            1 => Vin::Spend {
                prev_txid: decoder.read_hash32()?,
                vout_index: decoder.read_u32_le()?,
                script_sig: decoder.read_var_bytes()?,
                sequence: decoder.read_u32_le()?,
            },
            _ => return Err(DecodeError::InvalidData("unknown input tag")),
        };
        vin.push(entry);
    }

    let vout_count = read_count(&mut decoder, 19)?;
    let mut vout = Vec::with_capacity(vout_count);
    for _ in 0..vout_count {
        let index = decoder.read_u32_le()?;
        let value = decoder.read_i64_le()?;
        let script = decoder.read_var_bytes()?;
        let asm = decoder.read_var_str()?;
        let kind = script_kind_from_tag(decoder.read_u8()?)?;
        let req_sigs = decoder.read_u32_le()?;
        let address_count = read_count(&mut decoder, 1)?;
        let mut addresses = Vec::with_capacity(address_count);
        for _ in 0..address_count {
            addresses.push(decoder.read_var_str()?);
        }
        vout.push(Vout {
            index,
            value,
            script,
            asm,
            kind,
            req_sigs,
            addresses,
            spent: false,
        });
    }
    finish(&decoder)?;
    Ok(Transaction {
        txid,
        version,
        locktime,
        vin,
        vout,
        total,
        blockhash,
        blocktime,
    })
}

fn script_kind_tag(kind: ScriptKind) -> u8 {
    match kind {
        ScriptKind::PubKeyHash => 0,
        ScriptKind::PubKey => 1,
        ScriptKind::ScriptHash => 2,
        ScriptKind::NullData => 3,
    }
}

fn script_kind_from_tag(tag: u8) -> Result<ScriptKind, DecodeError> {
    match tag {
        0 => Ok(ScriptKind::PubKeyHash),
        1 => Ok(ScriptKind::PubKey),
        2 => Ok(ScriptKind::ScriptHash),
        3 => Ok(ScriptKind::NullData),
        _ => Err(DecodeError::InvalidData("unknown script kind")),
    }
}

pub(crate) fn write_opt_hash(encoder: &mut Encoder, hash: Option<&Hash256>) {
    match hash {
        Some(hash) => {
            encoder.write_bool(true);
            encoder.write_hash(hash);
        }
        None => encoder.write_bool(false),
    }
}

pub(crate) fn read_opt_hash(decoder: &mut Decoder) -> Result<Option<Hash256>, DecodeError> {
    if decoder.read_bool()? {
        Ok(Some(decoder.read_hash32()?))
    } else {
        Ok(None)
    }
}

pub(crate) fn read_record_version(decoder: &mut Decoder) -> Result<(), DecodeError> {
    match decoder.read_u8()? {
        RECORD_VERSION => Ok(()),
        _ => Err(DecodeError::InvalidData("unsupported record version")),
    }
}

/// Element count that cannot exceed what `min_item_len`-byte items could fill.
pub(crate) fn read_count(decoder: &mut Decoder, min_item_len: usize) -> Result<usize, DecodeError> {
    let count = decoder.read_varint_canonical()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count.saturating_mul(min_item_len) > decoder.remaining() {
        return Err(DecodeError::SizeTooLarge);
    }
    Ok(count)
}

pub(crate) fn finish(decoder: &Decoder) -> Result<(), DecodeError> {
    if decoder.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::TrailingBytes)
    }
}
