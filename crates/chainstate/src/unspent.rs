//! Spent flags for indexed outputs.
//!
//! An output is spent when a transaction on MAIN references it. Flags are set
//! as MAIN blocks arrive and recomputed for the transactions of every block
//! that changes branch. In bulk mode (`track_unspent = false`) outputs are
//! written spent and nothing is recomputed until [`rederive_unspent`] runs.

use std::collections::HashMap;

use exploder_consensus::Hash256;
use exploder_log::log_info;
use exploder_storage::{Column, KeyValueStore};

use crate::cache::WriteCache;
use crate::error::{corrupt, ChainError};
use crate::graph::ChainGraph;
use crate::records::{
    decode_spent, decode_transaction, encode_spent, encode_transaction, output_key,
    parse_spender_key, BlockRecord,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RederiveReport {
    pub outputs: usize,
    pub spent: usize,
}

/// Whether any block containing `txid` is on MAIN.
pub fn is_main_tx<S: KeyValueStore>(
    cache: &WriteCache<S>,
    txid: &Hash256,
) -> Result<bool, ChainError> {
    Ok(main_block_of(cache, txid)?.is_some())
}

/// First MAIN block containing `txid`.
pub(crate) fn main_block_of<S: KeyValueStore>(
    cache: &WriteCache<S>,
    txid: &Hash256,
) -> Result<Option<BlockRecord>, ChainError> {
    for (key, _) in cache.scan_prefix(Column::TxBlock, txid)? {
        let Some(hash) = key.get(32..64) else {
            continue;
        };
        let Some(bytes) = cache.get(Column::Block, hash)? else {
            continue;
        };
        let block = BlockRecord::decode(&bytes).map_err(corrupt("block record"))?;
        if block.chain.is_main() {
            return Ok(Some(block));
        }
    }
    Ok(None)
}

/// Marks a known output spent; unknown outputs are left alone.
pub(crate) fn mark_spent<S: KeyValueStore>(
    cache: &mut WriteCache<S>,
    txid: &Hash256,
    index: u32,
) -> Result<(), ChainError> {
    let key = output_key(txid, index);
    if cache.contains(Column::Output, &key)? {
        cache.put(Column::Output, &key, encode_spent(true).to_vec());
    }
    Ok(())
}

/// Recomputes the flag of every output referenced by the inputs of `txids`.
pub(crate) fn reconcile_spent<S: KeyValueStore>(
    cache: &mut WriteCache<S>,
    txids: &[Hash256],
) -> Result<(), ChainError> {
    let mut main_memo: HashMap<Hash256, bool> = HashMap::new();
    for txid in txids {
        let Some(bytes) = cache.get(Column::Tx, txid)? else {
            continue;
        };
        let tx = decode_transaction(&bytes).map_err(corrupt("transaction record"))?;
        for (prev_txid, index) in tx.spent_outpoints() {
            let key = output_key(&prev_txid, index);
            if !cache.contains(Column::Output, &key)? {
                continue;
            }
            let spent = spent_on_main(cache, &key, &mut main_memo)?;
            cache.put(Column::Output, &key, encode_spent(spent).to_vec());
        }
    }
    Ok(())
}

fn spent_on_main<S: KeyValueStore>(
    cache: &WriteCache<S>,
    output: &[u8],
    memo: &mut HashMap<Hash256, bool>,
) -> Result<bool, ChainError> {
    for (key, _) in cache.scan_prefix(Column::Spender, output)? {
        let Some((_, _, spender)) = parse_spender_key(&key) else {
            continue;
        };
        let on_main = match memo.get(&spender) {
            Some(known) => *known,
            None => {
                let known = is_main_tx(cache, &spender)?;
                memo.insert(spender, known);
                known
            }
        };
        if on_main {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Points transaction records at a MAIN block when their recorded block is
/// not on MAIN and a MAIN block containing them exists.
pub(crate) fn repoint_transactions<S: KeyValueStore>(
    cache: &mut WriteCache<S>,
    txids: &[Hash256],
) -> Result<(), ChainError> {
    for txid in txids {
        let Some(bytes) = cache.get(Column::Tx, txid)? else {
            continue;
        };
        let mut tx = decode_transaction(&bytes).map_err(corrupt("transaction record"))?;
        if let Some(current) = tx.blockhash {
            if let Some(bytes) = cache.get(Column::Block, &current)? {
                let block = BlockRecord::decode(&bytes).map_err(corrupt("block record"))?;
                if block.chain.is_main() {
                    continue;
                }
            }
        }
        if let Some(block) = main_block_of(cache, txid)? {
            tx.blockhash = Some(block.hash);
            tx.blocktime = Some(block.time);
            cache.put(Column::Tx, txid, encode_transaction(&tx));
        }
    }
    Ok(())
}

/// Rebuilds every spent flag from the spender entries: all outputs are reset
/// to unspent, then every output with a MAIN spender is marked spent.
///
/// Both columns are streamed one leading key byte at a time, so memory stays
/// bounded by a single bucket. Writes are committed every `batch_size`
/// updates and never while a bucket is being visited.
pub fn rederive_unspent<S: KeyValueStore>(
    graph: &mut ChainGraph<S>,
    batch_size: usize,
) -> Result<RederiveReport, ChainError> {
    let batch_size = batch_size.max(1);
    graph.flush()?;

    let mut report = RederiveReport::default();
    for bucket in 0..=u8::MAX {
        let mut to_reset: Vec<Vec<u8>> = Vec::new();
        let mut outputs = 0usize;
        graph
            .store()
            .for_each_prefix(Column::Output, &[bucket], &mut |key, value| {
                outputs += 1;
                if decode_spent(value) {
                    to_reset.push(key.to_vec());
                }
                Ok(())
            })?;
        report.outputs += outputs;
        for key in &to_reset {
            graph.cache_mut().put(Column::Output, key, encode_spent(false).to_vec());
            flush_when_full(graph, batch_size)?;
        }
    }
    graph.flush()?;
    log_info!("reset {} outputs to unspent", report.outputs);

    let mut memo: HashMap<Hash256, bool> = HashMap::new();
    for bucket in 0..=u8::MAX {
        let mut spenders: Vec<(Hash256, u32, Hash256)> = Vec::new();
        graph
            .store()
            .for_each_prefix(Column::Spender, &[bucket], &mut |key, _| {
                if let Some(entry) = parse_spender_key(key) {
                    spenders.push(entry);
                }
                Ok(())
            })?;

        let mut last_marked: Option<(Hash256, u32)> = None;
        for (txid, index, spender) in spenders {
            if last_marked == Some((txid, index)) {
                continue;
            }
            let on_main = match memo.get(&spender) {
                Some(known) => *known,
                None => {
                    let known = is_main_tx(graph.cache(), &spender)?;
                    memo.insert(spender, known);
                    known
                }
            };
            if !on_main {
                continue;
            }
            let output = output_key(&txid, index);
            if graph.cache().contains(Column::Output, &output)? {
                graph.cache_mut().put(Column::Output, &output, encode_spent(true).to_vec());
                report.spent += 1;
                last_marked = Some((txid, index));
                flush_when_full(graph, batch_size)?;
            }
        }
    }
    graph.flush()?;
    log_info!(
        "rederived spent flags: {} of {} outputs spent",
        report.spent,
        report.outputs
    );
    Ok(report)
}

fn flush_when_full<S: KeyValueStore>(
    graph: &mut ChainGraph<S>,
    batch_size: usize,
) -> Result<(), ChainError> {
    if graph.cache().pending_len() >= batch_size {
        graph.flush()?;
    }
    Ok(())
}
