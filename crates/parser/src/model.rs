//! In-memory block and transaction model shared by both ingestion paths.

use exploder_consensus::{Amount, ChainParams, Hash256};
use exploder_pow::difficulty::{difficulty_from_bits, target_from_bits, work_from_target};
use exploder_primitives::block::BlockHeader as RawHeader;
use exploder_primitives::transaction::Transaction as RawTransaction;
use exploder_script::{parse_script, ScriptKind};
use primitive_types::U256;

use crate::error::ParseError;

/// Branch label. Exactly one branch, [`ChainId::MAIN`], is canonical.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChainId(pub u32);

impl ChainId {
    pub const MAIN: ChainId = ChainId(0);

    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_main() {
            f.write_str("main")
        } else {
            write!(f, "side-{}", self.0)
        }
    }
}

/// Where a block was read from: file index in the sorted block-file list,
/// offset of its magic and offset just past its last transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DatPosition {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

/// Parsed header with derived target and difficulty. The hash is fixed at
/// construction and only readable.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockHeader {
    hash: Hash256,
    version: i32,
    previousblockhash: Option<Hash256>,
    merkleroot: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
    target: U256,
    difficulty: f64,
}

impl BlockHeader {
    pub fn from_raw(raw: &RawHeader, params: &ChainParams) -> Result<Self, ParseError> {
        Self::with_hash(raw.hash(), raw, params)
    }

    /// Uses `hash` as given; callers either hashed the exact header bytes or
    /// trust a node-reported value.
    pub(crate) fn with_hash(
        hash: Hash256,
        raw: &RawHeader,
        params: &ChainParams,
    ) -> Result<Self, ParseError> {
        let target = target_from_bits(raw.bits)?;
        let difficulty = difficulty_from_bits(raw.bits, params.max_target_bits)?;
        Ok(Self {
            hash,
            version: raw.version,
            previousblockhash: (!raw.is_genesis()).then_some(raw.prev_block),
            merkleroot: raw.merkle_root,
            time: raw.time,
            bits: raw.bits,
            nonce: raw.nonce,
            target,
            difficulty,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn previousblockhash(&self) -> Option<Hash256> {
        self.previousblockhash
    }

    /// Natural byte order, see [`crate::stream`].
    pub fn merkleroot(&self) -> Hash256 {
        self.merkleroot
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn work(&self) -> U256 {
        work_from_target(self.target)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub size: u32,
    pub transactions: Vec<Transaction>,
    pub total: Amount,
    pub work: U256,
    pub dat: Option<DatPosition>,
}

impl Block {
    /// Links every transaction to the block and sums the totals.
    pub fn from_header(
        header: BlockHeader,
        mut transactions: Vec<Transaction>,
        size: u32,
        dat: Option<DatPosition>,
    ) -> Result<Self, ParseError> {
        let mut total: Amount = 0;
        for tx in &mut transactions {
            tx.blockhash = Some(header.hash());
            tx.blocktime = Some(header.time());
            total = total
                .checked_add(tx.total)
                .ok_or_else(|| ParseError::InvalidField("block total overflows".to_string()))?;
        }
        let work = header.work();
        Ok(Self {
            header,
            size,
            transactions,
            total,
            work,
            dat,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vin {
    Coinbase {
        script: Vec<u8>,
        sequence: u32,
    },
    Spend {
        prev_txid: Hash256,
        vout_index: u32,
        script_sig: Vec<u8>,
        sequence: u32,
    },
}

impl Vin {
    /// The referenced output, absent for coinbase inputs.
    pub fn prevout(&self) -> Option<(Hash256, u32)> {
        match self {
            Vin::Coinbase { .. } => None,
            Vin::Spend {
                prev_txid,
                vout_index,
                ..
            } => Some((*prev_txid, *vout_index)),
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Vin::Coinbase { sequence, .. } | Vin::Spend { sequence, .. } => *sequence,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vout {
    pub index: u32,
    pub value: Amount,
    pub script: Vec<u8>,
    pub asm: String,
    pub kind: ScriptKind,
    pub req_sigs: u32,
    pub addresses: Vec<String>,
    pub spent: bool,
}

impl Vout {
    pub fn new(
        index: u32,
        value: Amount,
        script: Vec<u8>,
        params: &ChainParams,
    ) -> Result<Self, ParseError> {
        let info = parse_script(&script, params)?;
        Ok(Self {
            index,
            value,
            script,
            asm: info.asm,
            kind: info.kind,
            req_sigs: info.req_sigs,
            addresses: info.addresses,
            spent: false,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub txid: Hash256,
    pub version: i32,
    pub locktime: u32,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,
    pub total: Amount,
    pub blockhash: Option<Hash256>,
    pub blocktime: Option<u32>,
}

impl Transaction {
    /// Builds the model from a decoded transaction. The first input of a
    /// coinbase transaction is kept as a coinbase input regardless of its
    /// previous-output bytes.
    pub fn from_raw(
        raw: &RawTransaction,
        txid: Hash256,
        is_coinbase: bool,
        params: &ChainParams,
    ) -> Result<Self, ParseError> {
        let vin = raw
            .vin
            .iter()
            .enumerate()
            .map(|(idx, input)| {
                if is_coinbase && idx == 0 {
                    Vin::Coinbase {
                        script: input.script_sig.clone(),
                        sequence: input.sequence,
                    }
                } else {
                    Vin::Spend {
                        prev_txid: input.prevout.hash,
                        vout_index: input.prevout.index,
                        script_sig: input.script_sig.clone(),
                        sequence: input.sequence,
                    }
                }
            })
            .collect();
        let vout = raw
            .vout
            .iter()
            .enumerate()
            .map(|(idx, output)| {
                Vout::new(idx as u32, output.value, output.script_pubkey.clone(), params)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::assemble(txid, raw.version, raw.lock_time, vin, vout)
    }

    pub(crate) fn assemble(
        txid: Hash256,
        version: i32,
        locktime: u32,
        vin: Vec<Vin>,
        vout: Vec<Vout>,
    ) -> Result<Self, ParseError> {
        let total = vout
            .iter()
            .try_fold(0 as Amount, |acc, out| acc.checked_add(out.value))
            .ok_or_else(|| ParseError::InvalidField("transaction total overflows".to_string()))?;
        Ok(Self {
            txid,
            version,
            locktime,
            vin,
            vout,
            total,
            blockhash: None,
            blocktime: None,
        })
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.vin.first(), Some(Vin::Coinbase { .. }))
    }

    /// Outputs consumed by this transaction.
    pub fn spent_outpoints(&self) -> impl Iterator<Item = (Hash256, u32)> + '_ {
        self.vin.iter().filter_map(Vin::prevout)
    }
}
