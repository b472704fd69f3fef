//! JSON shapes printed by the `query` subcommand.

use exploder_chainstate::{
    AddressOutput, BlockRecord, ChainStats, HashrateSample, SyncHistoryEntry, TransactionView,
};
use exploder_consensus::{format_amount, Amount};
use exploder_parser::model::{Vin, Vout};
use exploder_pow::difficulty::{bits_to_hex, u256_to_hex};
use exploder_primitives::hex::{bytes_to_hex, hash256_to_hex};
use serde::Serialize;

use crate::sync::SyncReport;

#[derive(Serialize)]
pub struct DatView {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

#[derive(Serialize)]
pub struct BlockView {
    pub hash: String,
    pub height: u32,
    pub chain: String,
    pub confirmations: u32,
    pub version: i32,
    pub previousblockhash: Option<String>,
    pub nextblockhash: Option<String>,
    pub merkleroot: String,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
    pub difficulty: f64,
    pub size: u32,
    pub chainwork: String,
    pub work: String,
    pub total: String,
    pub tx: Vec<String>,
    pub dat: Option<DatView>,
}

impl BlockView {
    pub fn new(block: &BlockRecord, confirmations: u32) -> Self {
        Self {
            hash: hash256_to_hex(&block.hash),
            height: block.height,
            chain: block.chain.to_string(),
            confirmations,
            version: block.version,
            previousblockhash: block.previousblockhash.as_ref().map(hash256_to_hex),
            nextblockhash: block.nextblockhash.as_ref().map(hash256_to_hex),
            merkleroot: bytes_to_hex(&block.merkleroot),
            time: block.time,
            bits: bits_to_hex(block.bits),
            nonce: block.nonce,
            difficulty: block.difficulty,
            size: block.size,
            chainwork: u256_to_hex(block.chainwork),
            work: u256_to_hex(block.work),
            total: format_amount(block.total),
            tx: block.tx.iter().map(hash256_to_hex).collect(),
            dat: block.dat.map(|dat| DatView {
                index: dat.index,
                start: dat.start,
                end: dat.end,
            }),
        }
    }
}

#[derive(Serialize)]
pub struct VinView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_sig: Option<String>,
    pub sequence: u32,
}

impl From<&Vin> for VinView {
    fn from(vin: &Vin) -> Self {
        match vin {
            Vin::Coinbase { script, sequence } => Self {
                coinbase: Some(bytes_to_hex(script)),
                txid: None,
                vout: None,
                script_sig: None,
                sequence: *sequence,
            },
            Vin::Spend {
                prev_txid,
                vout_index,
                script_sig,
                sequence,
            } => Self {
                coinbase: None,
                txid: Some(hash256_to_hex(prev_txid)),
                vout: Some(*vout_index),
                script_sig: Some(bytes_to_hex(script_sig)),
                sequence: *sequence,
            },
        }
    }
}

#[derive(Serialize)]
pub struct VoutView {
    pub n: u32,
    pub value: String,
    pub script: String,
    pub asm: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub req_sigs: u32,
    pub addresses: Vec<String>,
    pub spent: bool,
}

impl From<&Vout> for VoutView {
    fn from(vout: &Vout) -> Self {
        Self {
            n: vout.index,
            value: format_amount(vout.value),
            script: bytes_to_hex(&vout.script),
            asm: vout.asm.clone(),
            kind: vout.kind.as_str(),
            req_sigs: vout.req_sigs,
            addresses: vout.addresses.clone(),
            spent: vout.spent,
        }
    }
}

#[derive(Serialize)]
pub struct TransactionJson {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub blockhash: Option<String>,
    pub blocktime: Option<u32>,
    pub main_chain: bool,
    pub total: String,
    pub vin: Vec<VinView>,
    pub vout: Vec<VoutView>,
}

impl From<&TransactionView> for TransactionJson {
    fn from(view: &TransactionView) -> Self {
        let tx = &view.tx;
        Self {
            txid: hash256_to_hex(&tx.txid),
            version: tx.version,
            locktime: tx.locktime,
            blockhash: tx.blockhash.as_ref().map(hash256_to_hex),
            blocktime: tx.blocktime,
            main_chain: view.main_chain,
            total: format_amount(tx.total),
            vin: tx.vin.iter().map(VinView::from).collect(),
            vout: tx.vout.iter().map(VoutView::from).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct OutputView {
    pub txid: String,
    pub n: u32,
    pub value: String,
    pub spent: bool,
}

impl From<&AddressOutput> for OutputView {
    fn from(output: &AddressOutput) -> Self {
        Self {
            txid: hash256_to_hex(&output.txid),
            n: output.index,
            value: format_amount(output.value),
            spent: output.spent,
        }
    }
}

#[derive(Serialize)]
pub struct AddressView {
    pub address: String,
    pub balance: String,
    pub volume: String,
    pub tx_count: usize,
    pub transactions: Vec<TransactionJson>,
}

impl AddressView {
    pub fn new(
        address: &str,
        balance: Amount,
        volume: Amount,
        tx_count: usize,
        transactions: &[TransactionView],
    ) -> Self {
        Self {
            address: address.to_string(),
            balance: format_amount(balance),
            volume: format_amount(volume),
            tx_count,
            transactions: transactions.iter().map(TransactionJson::from).collect(),
        }
    }
}

/// Aggregates over a comma-separated address set.
#[derive(Serialize)]
pub struct AddressSetView {
    pub addresses: Vec<String>,
    pub balance: String,
    pub volume: String,
    pub tx_count: usize,
}

impl AddressSetView {
    pub fn new(addresses: &[String], balance: Amount, volume: Amount, tx_count: usize) -> Self {
        Self {
            addresses: addresses.to_vec(),
            balance: format_amount(balance),
            volume: format_amount(volume),
            tx_count,
        }
    }
}

#[derive(Serialize)]
pub struct StatsView {
    pub height: Option<u32>,
    pub supply: String,
    pub block_count: u64,
    pub tx_count: u64,
    pub hashrate: f64,
    pub chain_size: u64,
}

impl From<&ChainStats> for StatsView {
    fn from(stats: &ChainStats) -> Self {
        Self {
            height: stats.height,
            supply: format_amount(stats.supply),
            block_count: stats.block_count,
            tx_count: stats.tx_count,
            hashrate: stats.hashrate,
            chain_size: stats.chain_size,
        }
    }
}

#[derive(Serialize)]
pub struct SyncHistoryView {
    pub start_time: u64,
    pub end_time: u64,
    pub start_height: Option<u32>,
    pub end_height: Option<u32>,
}

impl From<&SyncHistoryEntry> for SyncHistoryView {
    fn from(entry: &SyncHistoryEntry) -> Self {
        Self {
            start_time: entry.start_time,
            end_time: entry.end_time,
            start_height: entry.start_height,
            end_height: entry.end_height,
        }
    }
}

#[derive(Serialize)]
pub struct HashrateView {
    pub timestamp: u64,
    pub hashrate: f64,
}

impl From<&HashrateSample> for HashrateView {
    fn from(sample: &HashrateSample) -> Self {
        Self {
            timestamp: sample.timestamp,
            hashrate: sample.hashrate,
        }
    }
}

#[derive(Serialize)]
pub struct SyncReportView {
    pub network_height: u32,
    pub start_height: Option<u32>,
    pub end_height: Option<u32>,
    pub streamed: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub rewound: usize,
    pub reconvergences: usize,
    pub stopped: bool,
}

impl From<&SyncReport> for SyncReportView {
    fn from(report: &SyncReport) -> Self {
        Self {
            network_height: report.network_height,
            start_height: report.start_height,
            end_height: report.end_height,
            streamed: report.streamed,
            fetched: report.fetched,
            skipped: report.skipped,
            rewound: report.rewound,
            reconvergences: report.reconvergences,
            stopped: report.stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exploder_parser::model::{ChainId, DatPosition};
    use primitive_types::U256;
    use serde_json::json;

    fn record() -> BlockRecord {
        BlockRecord {
            hash: [0x01; 32],
            version: 2,
            previousblockhash: Some([0x02; 32]),
            nextblockhash: None,
            merkleroot: [0xab; 32],
            time: 1_600_000_000,
            bits: 0x1d00_ffff,
            nonce: 7,
            difficulty: 1.0,
            size: 285,
            height: 12,
            chainwork: U256::from(0x1_0000u64),
            work: U256::from(2u8),
            chain: ChainId(3),
            total: 150_000_000,
            tx: vec![[0x03; 32]],
            dat: Some(DatPosition {
                index: 1,
                start: 0,
                end: 293,
            }),
        }
    }

    #[test]
    fn block_view_renders_display_forms() {
        let value = serde_json::to_value(BlockView::new(&record(), 4)).expect("json");
        assert_eq!(value["hash"], json!("01".repeat(32)));
        assert_eq!(value["chain"], json!("side-3"));
        assert_eq!(value["bits"], json!("1d00ffff"));
        assert_eq!(value["total"], json!("1.50000000"));
        assert_eq!(value["confirmations"], json!(4));
        assert_eq!(value["nextblockhash"], serde_json::Value::Null);
        assert_eq!(value["dat"]["end"], json!(293));
        assert!(value["chainwork"]
            .as_str()
            .expect("chainwork")
            .ends_with("10000"));
    }

    #[test]
    fn coinbase_input_omits_spend_fields() {
        let vin = Vin::Coinbase {
            script: vec![0x51],
            sequence: u32::MAX,
        };
        let value = serde_json::to_value(VinView::from(&vin)).expect("json");
        assert_eq!(value, json!({ "coinbase": "51", "sequence": u32::MAX }));
    }
}
