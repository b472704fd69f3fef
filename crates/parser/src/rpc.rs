//! JSON-RPC response shapes (`getblock`, `getrawtransaction` verbose) and the
//! factories that turn them into the model.

use exploder_consensus::{amount_from_coins, ChainParams, Hash256};
use exploder_pow::difficulty::bits_from_hex;
use exploder_primitives::block::BlockHeader as RawHeader;
use exploder_primitives::hex::{hash256_from_hex, hex_to_bytes};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::model::{Block, BlockHeader, Transaction, Vin, Vout};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcBlock {
    pub hash: String,
    #[serde(default)]
    pub confirmations: i64,
    pub size: u32,
    #[serde(default)]
    pub height: Option<u32>,
    pub version: i32,
    pub merkleroot: String,
    #[serde(default)]
    pub tx: Vec<String>,
    pub time: u32,
    pub nonce: u32,
    pub bits: String,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub chainwork: Option<String>,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    #[serde(default)]
    pub nextblockhash: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcScriptSig {
    #[serde(default)]
    pub asm: String,
    pub hex: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcVin {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default, rename = "scriptSig")]
    pub script_sig: Option<RpcScriptSig>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcScriptPubKey {
    #[serde(default)]
    pub asm: String,
    pub hex: String,
    #[serde(default, rename = "reqSigs")]
    pub req_sigs: Option<u32>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcVout {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RpcScriptPubKey,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RpcTransaction {
    pub txid: String,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub locktime: u32,
    pub vin: Vec<RpcVin>,
    pub vout: Vec<RpcVout>,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub blocktime: Option<u32>,
}

impl RpcBlock {
    pub fn block_hash(&self) -> Result<Hash256, ParseError> {
        hash256_from_hex(&self.hash).map_err(|err| ParseError::field("hash", err))
    }

    pub fn previous_hash(&self) -> Result<Option<Hash256>, ParseError> {
        self.previousblockhash
            .as_deref()
            .map(|raw| hash256_from_hex(raw).map_err(|err| ParseError::field("previousblockhash", err)))
            .transpose()
    }

    pub fn next_hash(&self) -> Result<Option<Hash256>, ParseError> {
        self.nextblockhash
            .as_deref()
            .map(|raw| hash256_from_hex(raw).map_err(|err| ParseError::field("nextblockhash", err)))
            .transpose()
    }

    pub fn txids(&self) -> Result<Vec<Hash256>, ParseError> {
        self.tx
            .iter()
            .map(|raw| hash256_from_hex(raw).map_err(|err| ParseError::field("tx", err)))
            .collect()
    }
}

impl Block {
    /// Trusts the node-reported hash. `transactions` must be in block order.
    pub fn from_rpc(
        rpc: &RpcBlock,
        transactions: Vec<Transaction>,
        params: &ChainParams,
    ) -> Result<Self, ParseError> {
        let bits = bits_from_hex(&rpc.bits)
            .ok_or_else(|| ParseError::InvalidField(format!("bits: {}", rpc.bits)))?;
        // Nodes print the merkle root reversed; the model keeps wire order.
        let merkle_root = hash256_from_hex(&rpc.merkleroot)
            .map_err(|err| ParseError::field("merkleroot", err))?;
        let raw = RawHeader {
            version: rpc.version,
            prev_block: rpc.previous_hash()?.unwrap_or([0u8; 32]),
            merkle_root,
            time: rpc.time,
            bits,
            nonce: rpc.nonce,
        };
        let header = BlockHeader::with_hash(rpc.block_hash()?, &raw, params)?;
        Block::from_header(header, transactions, rpc.size, None)
    }
}

impl Transaction {
    /// Trusts the node-reported txid; output scripts are re-classified from hex.
    pub fn from_rpc(rpc: &RpcTransaction, params: &ChainParams) -> Result<Self, ParseError> {
        let txid = hash256_from_hex(&rpc.txid).map_err(|err| ParseError::field("txid", err))?;
        let vin = rpc
            .vin
            .iter()
            .map(vin_from_rpc)
            .collect::<Result<Vec<_>, _>>()?;
        let vout = rpc
            .vout
            .iter()
            .map(|out| {
                let value = amount_from_coins(out.value)?;
                let script = hex_to_bytes(&out.script_pub_key.hex)?;
                Vout::new(out.n, value, script, params)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut tx = Transaction::assemble(txid, rpc.version, rpc.locktime, vin, vout)?;
        tx.blockhash = rpc
            .blockhash
            .as_deref()
            .map(|raw| hash256_from_hex(raw).map_err(|err| ParseError::field("blockhash", err)))
            .transpose()?;
        tx.blocktime = rpc.blocktime;
        Ok(tx)
    }
}

fn vin_from_rpc(vin: &RpcVin) -> Result<Vin, ParseError> {
    if let Some(coinbase) = vin.coinbase.as_deref() {
        return Ok(Vin::Coinbase {
            script: hex_to_bytes(coinbase)?,
            sequence: vin.sequence,
        });
    }
    let (Some(txid), Some(index)) = (vin.txid.as_deref(), vin.vout) else {
        return Err(ParseError::InvalidField(
            "vin: neither coinbase nor previous output".to_string(),
        ));
    };
    let script_sig = match vin.script_sig.as_ref() {
        Some(sig) => hex_to_bytes(&sig.hex)?,
        None => Vec::new(),
    };
    Ok(Vin::Spend {
        prev_txid: hash256_from_hex(txid).map_err(|err| ParseError::field("vin.txid", err))?,
        vout_index: index,
        script_sig,
        sequence: vin.sequence,
    })
}
