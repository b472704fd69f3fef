#![allow(dead_code)]

use std::sync::Arc;

use exploder_chainstate::{ChainGraph, InsertOutcome};
use exploder_consensus::{chain_params, ChainParams, Hash256, Network};
use exploder_parser::model::{Block, BlockHeader, Transaction};
use exploder_primitives::address::{encode_address, p2pkh_script};
use exploder_primitives::block::BlockHeader as RawHeader;
use exploder_primitives::outpoint::OutPoint;
use exploder_primitives::transaction::{Transaction as RawTransaction, TxIn, TxOut};
use exploder_storage::memory::MemoryStore;

/// Work 2 per block.
pub const EASY_BITS: u32 = 0x207f_ffff;
/// Work 256 per block.
pub const HARD_BITS: u32 = 0x2000_ffff;

pub type Graph = ChainGraph<Arc<MemoryStore>>;

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn address(tag: u8) -> String {
    encode_address(regtest().pubkey_hash_version, &[tag; 20])
}

pub fn open_graph(store: &Arc<MemoryStore>, track_unspent: bool) -> Graph {
    ChainGraph::open(Arc::clone(store), regtest(), track_unspent).expect("open graph")
}

pub fn coinbase(nonce: u32, tag: u8, value: i64) -> RawTransaction {
    RawTransaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: nonce.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: p2pkh_script(&[tag; 20]),
        }],
        lock_time: 0,
    }
}

pub fn spend(prev: Hash256, index: u32, tag: u8, value: i64) -> RawTransaction {
    RawTransaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(prev, index),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: p2pkh_script(&[tag; 20]),
        }],
        lock_time: 0,
    }
}

/// Block whose coinbase pays 50 coins to `[nonce as u8; 20]`, followed by `extra`.
pub fn make_block(prev: Option<Hash256>, nonce: u32, bits: u32, extra: &[RawTransaction]) -> Block {
    let params = regtest();
    let raw = RawHeader {
        version: 1,
        prev_block: prev.unwrap_or([0u8; 32]),
        merkle_root: [0u8; 32],
        time: 1_600_000_000 + nonce * 60,
        bits,
        nonce,
    };
    let header = BlockHeader::from_raw(&raw, &params).expect("header");
    let mut raw_txs = vec![coinbase(nonce, nonce as u8, 50 * exploder_consensus::COIN)];
    raw_txs.extend_from_slice(extra);
    let transactions: Vec<Transaction> = raw_txs
        .iter()
        .enumerate()
        .map(|(idx, tx)| Transaction::from_raw(tx, tx.txid(), idx == 0, &params).expect("tx"))
        .collect();
    Block::from_header(header, transactions, 80, None).expect("block")
}

pub fn insert(graph: &mut Graph, block: &Block) -> InsertOutcome {
    graph.insert_block(block).expect("insert block")
}

/// Inserts a linear chain of `len` easy blocks and returns their hashes.
pub fn build_chain(graph: &mut Graph, len: u32) -> Vec<Hash256> {
    let mut hashes: Vec<Hash256> = Vec::new();
    for nonce in 0..len {
        let block = make_block(hashes.last().copied(), nonce, EASY_BITS, &[]);
        insert(graph, &block);
        hashes.push(block.hash());
    }
    hashes
}
