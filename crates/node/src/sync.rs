//! Ingestion orchestrator.
//!
//! A cycle reads block files while the index is far behind the node, then
//! follows the node's `nextblockhash` links over RPC. Both paths feed the same
//! chain graph, which flushes on a fixed cadence; anything not flushed when a
//! cycle fails is discarded.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver};
use exploder_chainstate::stats::{record_hashrate, record_network_stats, record_sync};
use exploder_chainstate::{
    acquire_sync_lock, release_sync_lock, BlockRecord, ChainError, ChainGraph, ChainQuery,
    HashrateSample, LockError, NetworkStats, SyncHistoryEntry,
};
use exploder_consensus::supply_at_height;
use exploder_parser::blockfiles::block_files_size;
use exploder_parser::model::{Block, Transaction};
use exploder_parser::rpc::RpcBlock;
use exploder_parser::{list_block_files, parse_block_from_stream, ParseError};
use exploder_primitives::encoding::Decoder;
use exploder_primitives::hex::hash256_to_hex;
use exploder_storage::KeyValueStore;

use crate::rpc_client::{ChainRpc, RpcError, RPC_INVALID_ADDRESS_OR_KEY};

pub const DEFAULT_RPC_SYNC_PERCENT: f64 = 97.0;
pub const DEFAULT_FLUSH_EVERY: usize = 1_000;
pub const DEFAULT_MAX_REWIND_DEPTH: u32 = 1_000;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;

const PROGRESS_LOG_INTERVAL: usize = 1_000;
const MIN_BLOCK_BYTES: usize = 80;
const PREFETCH_FILES: usize = 2;

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Directory of `blk*.dat` files; stream mode is off without it.
    pub blocks_dir: Option<PathBuf>,
    pub rpc_sync_percent: f64,
    /// Keep streaming below this height regardless of progress. 0 disables.
    pub stream_min_height: u32,
    pub flush_every: usize,
    pub max_rewind_depth: u32,
    pub lock_owner: String,
    pub lock_timeout_secs: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            blocks_dir: None,
            rpc_sync_percent: DEFAULT_RPC_SYNC_PERCENT,
            stream_min_height: 0,
            flush_every: DEFAULT_FLUSH_EVERY,
            max_rewind_depth: DEFAULT_MAX_REWIND_DEPTH,
            lock_owner: format!("exploder-{}", std::process::id()),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    pub network_height: u32,
    pub start_height: Option<u32>,
    pub end_height: Option<u32>,
    /// Blocks inserted from block files.
    pub streamed: usize,
    /// Blocks inserted from RPC.
    pub fetched: usize,
    /// Blocks already indexed.
    pub skipped: usize,
    pub rewound: usize,
    pub reconvergences: usize,
    pub stopped: bool,
}

impl SyncReport {
    pub fn inserted(&self) -> usize {
        self.streamed + self.fetched
    }
}

#[derive(Debug)]
pub enum SyncError {
    Rpc(RpcError),
    Chain(ChainError),
    Parse(ParseError),
    Io(io::Error),
    /// A block file other than the newest ends inside a block.
    TruncatedFile(PathBuf),
    /// No block shared with the node within the configured depth.
    RewindDepthExceeded { depth: u32 },
    Lock(LockError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Rpc(err) => write!(f, "{err}"),
            SyncError::Chain(err) => write!(f, "{err}"),
            SyncError::Parse(err) => write!(f, "{err}"),
            SyncError::Io(err) => write!(f, "{err}"),
            SyncError::TruncatedFile(path) => {
                write!(f, "block file {} is truncated", path.display())
            }
            SyncError::RewindDepthExceeded { depth } => write!(
                f,
                "no block in common with the node within {depth} blocks of the local tip"
            ),
            SyncError::Lock(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<RpcError> for SyncError {
    fn from(err: RpcError) -> Self {
        SyncError::Rpc(err)
    }
}

impl From<ChainError> for SyncError {
    fn from(err: ChainError) -> Self {
        SyncError::Chain(err)
    }
}

impl From<ParseError> for SyncError {
    fn from(err: ParseError) -> Self {
        SyncError::Parse(err)
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Io(err)
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        SyncError::Lock(err)
    }
}

type FileMessage = io::Result<(usize, Vec<u8>)>;

pub struct Syncer<S, R> {
    graph: ChainGraph<S>,
    rpc: R,
    options: SyncOptions,
    stop: Arc<AtomicBool>,
    since_flush: usize,
}

impl<S: KeyValueStore + Clone, R: ChainRpc> Syncer<S, R> {
    pub fn new(graph: ChainGraph<S>, rpc: R, options: SyncOptions) -> Self {
        Self {
            graph,
            rpc,
            options,
            stop: Arc::new(AtomicBool::new(false)),
            since_flush: 0,
        }
    }

    /// Setting the flag ends the running cycle after the current block.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn graph(&self) -> &ChainGraph<S> {
        &self.graph
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn rpc_mut(&mut self) -> &mut R {
        &mut self.rpc
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Runs one cycle inserting at most `limit` blocks (0 for no limit).
    pub fn sync_cycle(&mut self, limit: usize) -> Result<SyncReport, SyncError> {
        let start_time = unix_now();
        acquire_sync_lock(
            self.graph.store(),
            &self.options.lock_owner,
            self.options.lock_timeout_secs,
            start_time,
        )?;
        self.since_flush = 0;
        let mut report = SyncReport {
            start_height: self.graph.height(),
            ..SyncReport::default()
        };

        let mut result = self.run_cycle(limit, &mut report);
        if result.is_ok() {
            result = self.finish_cycle(start_time, &mut report);
        }
        if let Err(err) = &result {
            log_error!("sync cycle failed: {err}");
            if let Err(discard_err) = self.graph.discard() {
                log_warn!("failed to discard unflushed state: {discard_err}");
            }
        }
        if let Err(err) = release_sync_lock(self.graph.store(), &self.options.lock_owner) {
            log_warn!("failed to release sync lock: {err}");
        }
        result.map(|()| report)
    }

    fn run_cycle(&mut self, limit: usize, report: &mut SyncReport) -> Result<(), SyncError> {
        let network_height = self.rpc.get_block_count()?;
        report.network_height = network_height;
        match self.rpc.get_peer_info() {
            Ok(peers) if peers.is_empty() => {
                log_warn!("node reports no peers; its tip may be stale")
            }
            Ok(peers) => log_debug!("node has {} peers", peers.len()),
            Err(err) => log_debug!("getpeerinfo failed: {err}"),
        }

        if self.stream_eligible(network_height) {
            log_info!(
                "syncing from block files at {:.2}% of network height {network_height}",
                self.progress(network_height)
            );
            self.sync_stream(network_height, limit, report)?;
        }
        if self.stopped() {
            report.stopped = true;
            return Ok(());
        }
        if limit == 0 || report.inserted() < limit {
            self.sync_rpc(limit, report)?;
        }
        Ok(())
    }

    fn finish_cycle(&mut self, start_time: u64, report: &mut SyncReport) -> Result<(), SyncError> {
        self.flush()?;
        report.end_height = self.graph.height();
        let end_time = unix_now();
        let store = self.graph.store();
        record_sync(
            store,
            &SyncHistoryEntry {
                start_time,
                end_time,
                start_height: report.start_height,
                end_height: report.end_height,
            },
        )?;

        let queries = ChainQuery::new(store.clone(), self.graph.params().clone());
        let supply = report
            .end_height
            .map(|height| supply_at_height(height, self.graph.params()))
            .unwrap_or(0);
        let chain_size = match self.options.blocks_dir.as_deref() {
            Some(dir) => block_files_size(dir)?,
            None => queries
                .network_stats()?
                .map(|stats| stats.chain_size)
                .unwrap_or(0),
        };
        record_network_stats(
            store,
            &NetworkStats {
                supply,
                chain_size,
                updated_at: end_time,
            },
        )?;
        record_hashrate(
            store,
            HashrateSample {
                timestamp: end_time,
                hashrate: queries.hashrate_24h()?,
            },
        )?;

        log_info!(
            "sync cycle done: height {} -> {}, {} streamed, {} fetched, {} skipped, {} rewound in {}s",
            format_height(report.start_height),
            format_height(report.end_height),
            report.streamed,
            report.fetched,
            report.skipped,
            report.rewound,
            end_time.saturating_sub(start_time)
        );
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn progress(&self, network_height: u32) -> f64 {
        if network_height == 0 {
            return 100.0;
        }
        let local = self.graph.height().unwrap_or(0);
        f64::from(local) * 100.0 / f64::from(network_height)
    }

    fn behind(&self, network_height: u32) -> bool {
        self.progress(network_height) < self.options.rpc_sync_percent
            || self.graph.height().unwrap_or(0) < self.options.stream_min_height
    }

    /// Block files are usable only while the tip itself came from them.
    fn stream_eligible(&self, network_height: u32) -> bool {
        self.options.blocks_dir.is_some()
            && self.behind(network_height)
            && self.graph.tip().map_or(true, |tip| tip.dat.is_some())
    }

    fn sync_stream(
        &mut self,
        network_height: u32,
        limit: usize,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let Some(dir) = self.options.blocks_dir.clone() else {
            return Ok(());
        };
        let files = list_block_files(&dir)?;
        let (first_index, first_offset) = match self.graph.tip().and_then(|tip| tip.dat) {
            Some(dat) => (dat.index as usize, dat.end as usize),
            None => (0, 0),
        };
        if first_index >= files.len() {
            log_debug!("no block files past index {first_index} in {}", dir.display());
            return Ok(());
        }

        let queue: Vec<(usize, PathBuf)> = files
            .iter()
            .cloned()
            .enumerate()
            .skip(first_index)
            .collect();
        let (sender, receiver) = bounded::<FileMessage>(PREFETCH_FILES);
        let reader = thread::Builder::new()
            .name("blockfile-prefetch".to_string())
            .spawn(move || {
                for (index, path) in queue {
                    let message = fs::read(&path).map(|bytes| (index, bytes));
                    let failed = message.is_err();
                    if sender.send(message).is_err() || failed {
                        break;
                    }
                }
            })?;

        let outcome = self.consume_files(
            &receiver,
            &files,
            first_index,
            first_offset,
            network_height,
            limit,
            report,
        );
        drop(receiver);
        if reader.join().is_err() {
            log_warn!("block file prefetch thread panicked");
        }
        outcome?;
        self.flush()
    }

    #[allow(clippy::too_many_arguments)]
    fn consume_files(
        &mut self,
        receiver: &Receiver<FileMessage>,
        files: &[PathBuf],
        first_index: usize,
        first_offset: usize,
        network_height: u32,
        limit: usize,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let last_index = files.len().saturating_sub(1);
        for message in receiver.iter() {
            let (index, bytes) = message?;
            let file_index = u32::try_from(index).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "block file index overflows")
            })?;
            let mut decoder = Decoder::new(&bytes);
            if index == first_index && first_offset > 0 {
                if first_offset > bytes.len() {
                    log_warn!(
                        "block file {} is shorter than the indexed offset {first_offset}",
                        files[index].display()
                    );
                    continue;
                }
                decoder.skip(first_offset).map_err(ParseError::from)?;
            }
            log_debug!("reading block file {}", files[index].display());

            loop {
                if self.stopped() {
                    report.stopped = true;
                    return Ok(());
                }
                if limit != 0 && report.inserted() >= limit {
                    return Ok(());
                }
                if !self.behind(network_height) {
                    log_info!(
                        "block files reached {:.2}% of network height {network_height}, switching to rpc",
                        self.progress(network_height)
                    );
                    return Ok(());
                }
                if decoder.remaining() < MIN_BLOCK_BYTES {
                    break;
                }
                let block =
                    match parse_block_from_stream(&mut decoder, file_index, self.graph.params()) {
                        Ok(block) => block,
                        Err(ParseError::EndOfData) => break,
                        Err(ParseError::TruncatedBlock) if index == last_index => {
                            log_info!(
                                "block file {} ends inside a block; waiting for more data",
                                files[index].display()
                            );
                            return Ok(());
                        }
                        Err(ParseError::TruncatedBlock) => {
                            return Err(SyncError::TruncatedFile(files[index].clone()));
                        }
                        Err(err) => return Err(err.into()),
                    };
                self.insert(&block, report, true)?;
            }
        }
        Ok(())
    }

    fn sync_rpc(&mut self, limit: usize, report: &mut SyncReport) -> Result<(), SyncError> {
        let mut next = match self.graph.tip().cloned() {
            None => {
                let genesis = self.rpc.get_block_hash(0)?;
                log_info!("syncing from rpc starting at genesis {}", hash256_to_hex(&genesis));
                Some(genesis)
            }
            Some(tip) => {
                let common = self.find_common_block(&tip)?;
                let common_hash = common.block_hash()?;
                if common_hash != tip.hash {
                    let rewound = self.graph.rewind_to(&common_hash)?;
                    report.rewound += rewound;
                    log_warn!(
                        "local tip {} left the node's chain; rewound {rewound} blocks to {}",
                        hash256_to_hex(&tip.hash),
                        hash256_to_hex(&common_hash)
                    );
                    self.flush()?;
                }
                common.next_hash()?
            }
        };

        while let Some(hash) = next {
            if self.stopped() {
                report.stopped = true;
                break;
            }
            if limit != 0 && report.inserted() >= limit {
                break;
            }
            let rpc_block = self.rpc.get_block(&hash)?.ok_or_else(|| RpcError::Rpc {
                code: RPC_INVALID_ADDRESS_OR_KEY,
                message: format!("block {} not found", hash256_to_hex(&hash)),
            })?;
            let block = self.fetch_block(&rpc_block)?;
            self.insert(&block, report, false)?;
            next = rpc_block.next_hash()?;
        }
        self.flush()
    }

    /// Walks back from `tip` along local parents until the node reports a
    /// block on its active chain.
    fn find_common_block(&self, tip: &BlockRecord) -> Result<RpcBlock, SyncError> {
        let mut hash = tip.hash;
        let mut depth = 0u32;
        loop {
            if let Some(block) = self.rpc.get_block(&hash)? {
                if block.confirmations >= 0 {
                    return Ok(block);
                }
            }
            if depth >= self.options.max_rewind_depth {
                return Err(SyncError::RewindDepthExceeded { depth });
            }
            let record = self
                .graph
                .block(&hash)?
                .ok_or(ChainError::MissingBlock(hash))?;
            hash = record
                .previousblockhash
                .ok_or(SyncError::RewindDepthExceeded { depth })?;
            depth += 1;
        }
    }

    fn fetch_block(&self, rpc_block: &RpcBlock) -> Result<Block, SyncError> {
        let params = self.graph.params();
        let txids = rpc_block.txids()?;
        let mut transactions = Vec::with_capacity(txids.len());
        for txid in &txids {
            match self.rpc.get_raw_transaction(txid)? {
                Some(raw) => transactions.push(Transaction::from_rpc(&raw, params)?),
                // Nodes do not index the genesis coinbase.
                None if rpc_block.previousblockhash.is_none() => {
                    log_debug!("genesis transaction {} is not indexed by the node", hash256_to_hex(txid))
                }
                None => {
                    return Err(RpcError::Rpc {
                        code: RPC_INVALID_ADDRESS_OR_KEY,
                        message: format!(
                            "transaction {} of block {} not found",
                            hash256_to_hex(txid),
                            rpc_block.hash
                        ),
                    }
                    .into())
                }
            }
        }
        Ok(Block::from_rpc(rpc_block, transactions, params)?)
    }

    fn insert(&mut self, block: &Block, report: &mut SyncReport, streamed: bool) -> Result<(), SyncError> {
        match self.graph.insert_block(block) {
            Ok(outcome) => {
                if outcome.reconverged {
                    report.reconvergences += 1;
                }
                if streamed {
                    report.streamed += 1;
                } else {
                    report.fetched += 1;
                }
            }
            Err(ChainError::DuplicateBlock(hash)) => {
                report.skipped += 1;
                log_trace!("skipping indexed block {}", hash256_to_hex(&hash));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let inserted = report.inserted();
        if inserted % PROGRESS_LOG_INTERVAL == 0 {
            log_info!(
                "indexed {inserted} blocks this cycle, height {} ({:.2}%)",
                format_height(self.graph.height()),
                self.progress(report.network_height)
            );
        }
        self.since_flush += 1;
        if self.since_flush >= self.options.flush_every.max(1) {
            self.flush()?;
        }
        Ok(())
    }

    /// Refreshes the sync lock, then commits pending writes. A lost lock
    /// fails before anything is written.
    fn flush(&mut self) -> Result<(), SyncError> {
        acquire_sync_lock(
            self.graph.store(),
            &self.options.lock_owner,
            self.options.lock_timeout_secs,
            unix_now(),
        )?;
        self.graph.flush()?;
        self.since_flush = 0;
        Ok(())
    }
}

fn format_height(height: Option<u32>) -> String {
    height.map_or_else(|| "none".to_string(), |height| height.to_string())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    use exploder_chainstate::lock::current_sync_lock;
    use exploder_consensus::{chain_params, ChainParams, Hash256, Network, COIN};
    use exploder_parser::model::ChainId;
    use exploder_parser::rpc::{RpcScriptPubKey, RpcTransaction, RpcVin, RpcVout};
    use exploder_primitives::address::p2pkh_script;
    use exploder_primitives::block::BlockHeader as RawHeader;
    use exploder_primitives::hex::bytes_to_hex;
    use exploder_primitives::outpoint::OutPoint;
    use exploder_primitives::transaction::{Transaction as RawTransaction, TxIn, TxOut};
    use exploder_storage::memory::MemoryStore;

    use crate::rpc_client::PeerInfo;

    const EASY_BITS: u32 = 0x207f_ffff;
    const MAGIC: [u8; 4] = [0xfb, 0xc0, 0xb6, 0xdb];

    #[derive(Clone)]
    struct TestBlock {
        header: RawHeader,
        txs: Vec<RawTransaction>,
    }

    impl TestBlock {
        fn hash(&self) -> Hash256 {
            self.header.hash()
        }

        fn record(&self) -> Vec<u8> {
            let mut body = self.header.consensus_encode();
            body.push(self.txs.len() as u8);
            for tx in &self.txs {
                body.extend_from_slice(&tx.consensus_encode());
            }
            let mut out = MAGIC.to_vec();
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
            out
        }
    }

    fn regtest() -> ChainParams {
        chain_params(Network::Regtest)
    }

    fn coinbase(nonce: u32) -> RawTransaction {
        RawTransaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: nonce.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50 * COIN,
                script_pubkey: p2pkh_script(&[nonce as u8; 20]),
            }],
            lock_time: 0,
        }
    }

    fn spend(prev: Hash256, tag: u8, value: i64) -> RawTransaction {
        RawTransaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new(prev, 0),
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

    fn block(prev: Option<Hash256>, nonce: u32, extra: Vec<RawTransaction>) -> TestBlock {
        let mut txs = vec![coinbase(nonce)];
        txs.extend(extra);
        TestBlock {
            header: RawHeader {
                version: 1,
                prev_block: prev.unwrap_or([0u8; 32]),
                merkle_root: [0x11; 32],
                time: 1_600_000_000 + nonce * 60,
                bits: EASY_BITS,
                nonce,
            },
            txs,
        }
    }

    /// Linear chain on top of `prev`, one block per nonce.
    fn chain(prev: Option<Hash256>, nonces: std::ops::Range<u32>) -> Vec<TestBlock> {
        let mut out: Vec<TestBlock> = Vec::new();
        let mut parent = prev;
        for nonce in nonces {
            let next = block(parent, nonce, Vec::new());
            parent = Some(next.hash());
            out.push(next);
        }
        out
    }

    fn write_file(path: &Path, blocks: &[TestBlock]) {
        let bytes: Vec<u8> = blocks.iter().flat_map(TestBlock::record).collect();
        fs::write(path, bytes).expect("write block file");
    }

    #[derive(Default)]
    struct MockNode {
        blocks: HashMap<Hash256, TestBlock>,
        main: Vec<Hash256>,
        network_height: Option<u32>,
    }

    impl MockNode {
        fn with_main(blocks: &[TestBlock]) -> Self {
            let mut node = MockNode::default();
            node.set_main(blocks);
            node
        }

        /// Replaces the active chain; blocks dropped from it stay known as stale.
        fn set_main(&mut self, blocks: &[TestBlock]) {
            for block in blocks {
                self.blocks.insert(block.hash(), block.clone());
            }
            self.main = blocks.iter().map(TestBlock::hash).collect();
        }

        fn rpc_block(&self, block: &TestBlock) -> RpcBlock {
            let hash = block.hash();
            let position = self.main.iter().position(|known| *known == hash);
            let header = &block.header;
            RpcBlock {
                hash: hash256_to_hex(&hash),
                confirmations: position
                    .map(|pos| (self.main.len() - pos) as i64)
                    .unwrap_or(-1),
                size: block.record().len() as u32 - 8,
                height: position.map(|pos| pos as u32),
                version: header.version,
                merkleroot: hash256_to_hex(&header.merkle_root),
                tx: block.txs.iter().map(|tx| hash256_to_hex(&tx.txid())).collect(),
                time: header.time,
                nonce: header.nonce,
                bits: format!("{:08x}", header.bits),
                difficulty: 0.0,
                chainwork: None,
                previousblockhash: (header.prev_block != [0u8; 32])
                    .then(|| hash256_to_hex(&header.prev_block)),
                nextblockhash: position
                    .and_then(|pos| self.main.get(pos + 1))
                    .map(hash256_to_hex),
            }
        }
    }

    fn rpc_transaction(tx: &RawTransaction) -> RpcTransaction {
        RpcTransaction {
            txid: hash256_to_hex(&tx.txid()),
            hex: None,
            version: tx.version,
            locktime: tx.lock_time,
            vin: tx
                .vin
                .iter()
                .map(|input| {
                    if input.prevout.is_null() {
                        RpcVin {
                            coinbase: Some(bytes_to_hex(&input.script_sig)),
                            sequence: input.sequence,
                            ..RpcVin::default()
                        }
                    } else {
                        RpcVin {
                            txid: Some(hash256_to_hex(&input.prevout.hash)),
                            vout: Some(input.prevout.index),
                            sequence: input.sequence,
                            ..RpcVin::default()
                        }
                    }
                })
                .collect(),
            vout: tx
                .vout
                .iter()
                .enumerate()
                .map(|(n, out)| RpcVout {
                    value: out.value as f64 / COIN as f64,
                    n: n as u32,
                    script_pub_key: RpcScriptPubKey {
                        hex: bytes_to_hex(&out.script_pubkey),
                        ..RpcScriptPubKey::default()
                    },
                })
                .collect(),
            blockhash: None,
            blocktime: None,
        }
    }

    impl ChainRpc for MockNode {
        fn get_block_count(&self) -> Result<u32, RpcError> {
            Ok(self
                .network_height
                .unwrap_or_else(|| self.main.len().saturating_sub(1) as u32))
        }

        fn get_block_hash(&self, height: u32) -> Result<Hash256, RpcError> {
            self.main
                .get(height as usize)
                .copied()
                .ok_or_else(|| RpcError::Rpc {
                    code: -8,
                    message: "Block height out of range".to_string(),
                })
        }

        fn get_block(&self, hash: &Hash256) -> Result<Option<RpcBlock>, RpcError> {
            Ok(self.blocks.get(hash).map(|block| self.rpc_block(block)))
        }

        fn get_raw_transaction(&self, txid: &Hash256) -> Result<Option<RpcTransaction>, RpcError> {
            Ok(self
                .blocks
                .values()
                .flat_map(|block| block.txs.iter())
                .find(|tx| tx.txid() == *txid)
                .map(rpc_transaction))
        }

        fn get_peer_info(&self) -> Result<Vec<PeerInfo>, RpcError> {
            Ok(vec![PeerInfo {
                addr: "127.0.0.1:40001".to_string(),
                ..PeerInfo::default()
            }])
        }
    }

    type TestSyncer = Syncer<Arc<MemoryStore>, MockNode>;

    fn syncer(store: &Arc<MemoryStore>, node: MockNode, blocks_dir: Option<&Path>) -> TestSyncer {
        let graph = ChainGraph::open(Arc::clone(store), regtest(), true).expect("open graph");
        let options = SyncOptions {
            blocks_dir: blocks_dir.map(Path::to_path_buf),
            flush_every: 2,
            max_rewind_depth: 10,
            lock_owner: "test-syncer".to_string(),
            ..SyncOptions::default()
        };
        Syncer::new(graph, node, options)
    }

    fn tip_hash(syncer: &TestSyncer) -> Option<Hash256> {
        syncer.graph().tip().map(|tip| tip.hash)
    }

    #[test]
    fn stream_resumes_after_the_last_indexed_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks = chain(None, 0..6);
        write_file(&dir.path().join("blk00000.dat"), &blocks[..4]);
        write_file(&dir.path().join("blk00001.dat"), &blocks[4..]);
        let mut node = MockNode::with_main(&blocks);
        node.network_height = Some(1_000);

        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, node, Some(dir.path()));
        let first = syncer.sync_cycle(3).expect("first cycle");
        assert_eq!(first.streamed, 3);
        assert_eq!(first.fetched, 0);
        assert_eq!(first.end_height, Some(2));
        let dat = syncer.graph().tip().and_then(|tip| tip.dat).expect("dat position");
        assert_eq!(dat.index, 0);

        let second = syncer.sync_cycle(0).expect("second cycle");
        assert_eq!(second.start_height, Some(2));
        assert_eq!(second.streamed, 3);
        assert_eq!(second.skipped, 0);
        assert_eq!(second.fetched, 0);
        assert_eq!(tip_hash(&syncer), Some(blocks[5].hash()));
        let dat = syncer.graph().tip().and_then(|tip| tip.dat).expect("dat position");
        assert_eq!(dat.index, 1);
        assert_eq!(dat.start, blocks[4].record().len() as u64);
        assert!(current_sync_lock(&store).expect("lock").is_none());
    }

    #[test]
    fn truncated_tail_waits_for_more_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blk00000.dat");
        let blocks = chain(None, 0..3);
        let mut bytes: Vec<u8> = blocks[..2].iter().flat_map(TestBlock::record).collect();
        let partial = blocks[2].record();
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        fs::write(&path, &bytes).expect("write");

        let mut node = MockNode::with_main(&blocks[..2]);
        node.network_height = Some(1_000);
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, node, Some(dir.path()));
        let report = syncer.sync_cycle(0).expect("cycle");
        assert_eq!(report.streamed, 2);
        assert_eq!(tip_hash(&syncer), Some(blocks[1].hash()));

        write_file(&path, &blocks);
        syncer.rpc_mut().set_main(&blocks);
        let report = syncer.sync_cycle(0).expect("cycle");
        assert_eq!(report.streamed, 1);
        assert_eq!(report.fetched, 0);
        let tip = syncer.graph().tip().expect("tip");
        assert_eq!(tip.hash, blocks[2].hash());
        assert!(tip.dat.is_some());
    }

    #[test]
    fn truncated_block_in_an_earlier_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks = chain(None, 0..3);
        let mut bytes = blocks[0].record();
        let partial = blocks[1].record();
        bytes.extend_from_slice(&partial[..partial.len() - 10]);
        fs::write(dir.path().join("blk00000.dat"), &bytes).expect("write");
        write_file(&dir.path().join("blk00001.dat"), &blocks[1..]);

        let mut node = MockNode::with_main(&blocks);
        node.network_height = Some(1_000);
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, node, Some(dir.path()));
        assert!(matches!(
            syncer.sync_cycle(0),
            Err(SyncError::TruncatedFile(path)) if path.ends_with("blk00000.dat")
        ));
        // The unflushed block is gone and the lock is free again.
        assert_eq!(syncer.graph().tip(), None);
        assert!(current_sync_lock(&store).expect("lock").is_none());
    }

    #[test]
    fn stream_hands_over_to_rpc_near_the_network_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks = chain(None, 0..4);
        write_file(&dir.path().join("blk00000.dat"), &blocks);

        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, MockNode::with_main(&blocks), Some(dir.path()));
        syncer.options.rpc_sync_percent = 50.0;
        let report = syncer.sync_cycle(0).expect("cycle");
        assert_eq!(report.network_height, 3);
        assert_eq!(report.streamed, 3);
        assert_eq!(report.fetched, 1);
        assert_eq!(tip_hash(&syncer), Some(blocks[3].hash()));
        assert!(syncer.graph().tip().and_then(|tip| tip.dat).is_none());

        // A minimum height keeps the whole range on block files.
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer_with_min_height(&store, &blocks, dir.path());
        let report = syncer.sync_cycle(0).expect("cycle");
        assert_eq!(report.streamed, 4);
        assert_eq!(report.fetched, 0);
    }

    fn syncer_with_min_height(store: &Arc<MemoryStore>, blocks: &[TestBlock], dir: &Path) -> TestSyncer {
        let mut syncer = syncer(store, MockNode::with_main(blocks), Some(dir));
        syncer.options.rpc_sync_percent = 50.0;
        syncer.options.stream_min_height = 10;
        syncer
    }

    #[test]
    fn rpc_sync_follows_next_links_from_genesis() {
        let genesis = block(None, 0, Vec::new());
        let b1 = block(Some(genesis.hash()), 1, Vec::new());
        let payment = spend(genesis.txs[0].txid(), 9, 20 * COIN);
        let b2 = block(Some(b1.hash()), 2, vec![payment.clone()]);
        let blocks = vec![genesis.clone(), b1, b2.clone()];

        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, MockNode::with_main(&blocks), None);
        let report = syncer.sync_cycle(0).expect("cycle");
        assert_eq!(report.fetched, 3);
        assert_eq!(report.start_height, None);
        assert_eq!(report.end_height, Some(2));

        let queries = ChainQuery::new(Arc::clone(&store), regtest());
        let view = queries
            .transaction(&payment.txid())
            .expect("read")
            .expect("payment");
        assert!(view.main_chain);
        assert_eq!(view.tx.blockhash, Some(b2.hash()));
        let funding = queries
            .transaction(&genesis.txs[0].txid())
            .expect("read")
            .expect("coinbase");
        assert!(funding.tx.vout[0].spent);

        let history = queries.latest_sync_history(1).expect("history");
        assert_eq!(history[0].end_height, Some(2));
        let stats = queries.network_stats().expect("stats").expect("recorded");
        assert_eq!(stats.supply, 150 * COIN);
        assert_eq!(queries.latest_hashrates(1).expect("hashrates").len(), 1);

        let idle = syncer.sync_cycle(0).expect("idle cycle");
        assert_eq!(idle.inserted(), 0);
        assert_eq!(idle.rewound, 0);
    }

    #[test]
    fn rewinds_when_the_tip_left_the_nodes_chain() {
        let original = chain(None, 0..4);
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, MockNode::with_main(&original), None);
        syncer.sync_cycle(0).expect("initial sync");
        assert_eq!(syncer.graph().height(), Some(3));

        let replacement = chain(Some(original[1].hash()), 20..23);
        let mut active = original[..2].to_vec();
        active.extend(replacement.iter().cloned());
        syncer.rpc_mut().set_main(&active);

        let report = syncer.sync_cycle(0).expect("reorg cycle");
        assert_eq!(report.rewound, 2);
        assert_eq!(report.fetched, 3);
        assert_eq!(syncer.graph().height(), Some(4));
        assert_eq!(tip_hash(&syncer), Some(replacement[2].hash()));
        let stale = syncer
            .graph()
            .block(&original[3].hash())
            .expect("read")
            .expect("stale block");
        assert_ne!(stale.chain, ChainId::MAIN);
        let common = syncer
            .graph()
            .block(&original[1].hash())
            .expect("read")
            .expect("common block");
        assert_eq!(common.nextblockhash, Some(replacement[0].hash()));
    }

    #[test]
    fn rewind_depth_is_bounded() {
        let original = chain(None, 0..5);
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, MockNode::with_main(&original), None);
        syncer.sync_cycle(0).expect("initial sync");

        let replacement = chain(Some(original[0].hash()), 30..36);
        let mut active = vec![original[0].clone()];
        active.extend(replacement);
        syncer.rpc_mut().set_main(&active);
        syncer.options.max_rewind_depth = 2;

        assert!(matches!(
            syncer.sync_cycle(0),
            Err(SyncError::RewindDepthExceeded { depth: 2 })
        ));
        assert_eq!(tip_hash(&syncer), Some(original[4].hash()));
    }

    #[test]
    fn held_lock_blocks_the_cycle() {
        let blocks = chain(None, 0..2);
        let store = Arc::new(MemoryStore::new());
        acquire_sync_lock(&store, "other-worker", 600, unix_now()).expect("lock");
        let mut syncer = syncer(&store, MockNode::with_main(&blocks), None);
        assert!(matches!(
            syncer.sync_cycle(0),
            Err(SyncError::Lock(LockError::Busy { owner, .. })) if owner == "other-worker"
        ));
        assert_eq!(syncer.graph().tip(), None);
    }

    #[test]
    fn stop_flag_ends_the_cycle_early() {
        let blocks = chain(None, 0..3);
        let store = Arc::new(MemoryStore::new());
        let mut syncer = syncer(&store, MockNode::with_main(&blocks), None);
        syncer.stop_flag().store(true, Ordering::Relaxed);
        let report = syncer.sync_cycle(0).expect("cycle");
        assert!(report.stopped);
        assert_eq!(report.inserted(), 0);
    }
}
