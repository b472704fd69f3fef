//! Chain graph: branch labels, heights, cumulative work and the canonical tip.
//!
//! Every block lands on a branch. [`ChainId::MAIN`] is the canonical branch and
//! is indexed by height; every other branch is indexed by `(chain, height)` in
//! the side-chain column. When a side branch accumulates strictly more work
//! than the tip it is promoted and the displaced MAIN segment is demoted to a
//! fresh side id.

use exploder_consensus::{ChainParams, Hash256};
use exploder_log::{log_debug, log_info, log_warn};
use exploder_parser::model::{Block, ChainId};
use exploder_primitives::hex::hash256_to_hex;
use exploder_storage::{Column, KeyValueStore};

use crate::cache::WriteCache;
use crate::error::{corrupt, ChainError};
use crate::records::{
    address_output_key, encode_spent, encode_transaction, height_key, output_key,
    parse_side_chain_key, side_chain_key, spender_key, tx_block_key, BlockRecord,
    META_BLOCK_COUNT, META_NEXT_SIDE_CHAIN, META_TIP, META_TX_COUNT,
};
use crate::unspent;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertKind {
    /// First block of an empty store.
    Genesis,
    /// Child of the tip.
    Extension,
    /// Child of a MAIN block that is not the tip.
    NewFork,
    /// Child of a side-branch block.
    SideGrowth,
}

#[derive(Clone, Debug)]
pub struct InsertOutcome {
    /// The record as stored after the insert, including any promotion.
    pub block: BlockRecord,
    pub fork_point: Option<Hash256>,
    pub reconverged: bool,
    pub kind: InsertKind,
}

pub struct ChainGraph<S> {
    cache: WriteCache<S>,
    params: ChainParams,
    tip: Option<BlockRecord>,
    next_side_id: u32,
    track_unspent: bool,
}

impl<S: KeyValueStore> ChainGraph<S> {
    /// Loads the tip and the side-branch counter. With `track_unspent` off the
    /// graph runs in bulk mode, see [`crate::unspent`].
    pub fn open(store: S, params: ChainParams, track_unspent: bool) -> Result<Self, ChainError> {
        let mut graph = Self {
            cache: WriteCache::new(store),
            params,
            tip: None,
            next_side_id: 1,
            track_unspent,
        };
        graph.reload()?;
        Ok(graph)
    }

    fn reload(&mut self) -> Result<(), ChainError> {
        self.tip = match self.cache.get(Column::Meta, META_TIP)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::CorruptRecord("tip pointer".to_string()))?;
                Some(self.require_block(&hash)?)
            }
            None => None,
        };

        let stored = match self.cache.get(Column::Meta, META_NEXT_SIDE_CHAIN)? {
            Some(bytes) => u32::from_le_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::CorruptRecord("side chain counter".to_string()))?,
            ),
            None => 1,
        };
        let highest_used = self
            .cache
            .scan_prefix(Column::SideChain, &[])?
            .last()
            .and_then(|(key, _)| parse_side_chain_key(key))
            .map(|(chain, _, _)| chain.0.saturating_add(1))
            .unwrap_or(1);
        self.next_side_id = stored.max(highest_used).max(1);
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &S {
        self.cache.store()
    }

    pub fn cache(&self) -> &WriteCache<S> {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut WriteCache<S> {
        &mut self.cache
    }

    pub fn tracks_unspent(&self) -> bool {
        self.track_unspent
    }

    pub fn tip(&self) -> Option<&BlockRecord> {
        self.tip.as_ref()
    }

    /// Height of the tip, `None` for an empty store.
    pub fn height(&self) -> Option<u32> {
        self.tip.as_ref().map(|tip| tip.height)
    }

    pub fn next_side_id(&self) -> ChainId {
        ChainId(self.next_side_id)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        match self.cache.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(
                BlockRecord::decode(&bytes).map_err(corrupt("block record"))?,
            )),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.cache.contains(Column::Block, hash)?)
    }

    /// MAIN block at `height`.
    pub fn block_at_height(&self, height: u32) -> Result<Option<BlockRecord>, ChainError> {
        match self.main_hash_at(height)? {
            Some(hash) => self.block(&hash),
            None => Ok(None),
        }
    }

    pub(crate) fn require_block(&self, hash: &Hash256) -> Result<BlockRecord, ChainError> {
        self.block(hash)?.ok_or(ChainError::MissingBlock(*hash))
    }

    fn main_hash_at(&self, height: u32) -> Result<Option<Hash256>, ChainError> {
        match self.cache.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => Ok(Some(bytes.as_slice().try_into().map_err(|_| {
                ChainError::CorruptRecord(format!("height index entry {height}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Commits every pending write in one batch.
    pub fn flush(&mut self) -> Result<usize, ChainError> {
        let written = self.cache.flush()?;
        if written > 0 {
            log_debug!("flushed {written} pending writes");
        }
        Ok(written)
    }

    /// Drops unflushed writes and reloads the tip from the store.
    pub fn discard(&mut self) -> Result<(), ChainError> {
        self.cache.discard();
        self.reload()
    }

    pub fn insert_block(&mut self, block: &Block) -> Result<InsertOutcome, ChainError> {
        let hash = block.hash();
        if self.contains(&hash)? {
            return Err(ChainError::DuplicateBlock(hash));
        }

        let Some(tip) = self.tip.clone() else {
            let record = BlockRecord::from_block(block, 0, block.work, ChainId::MAIN);
            self.write_block(&record);
            self.cache.put(Column::HeightIndex, &height_key(0), hash.to_vec());
            self.set_tip(record.clone());
            self.persist_transactions(&record, block)?;
            log_info!("indexed first block {}", hash256_to_hex(&hash));
            return Ok(InsertOutcome {
                block: record,
                fork_point: None,
                reconverged: false,
                kind: InsertKind::Genesis,
            });
        };

        if block.header.previousblockhash() == Some(tip.hash) {
            let record = BlockRecord::from_block(
                block,
                tip.height + 1,
                tip.chainwork.saturating_add(block.work),
                ChainId::MAIN,
            );
            let mut previous = tip;
            previous.nextblockhash = Some(hash);
            self.write_block(&previous);
            self.write_block(&record);
            self.cache
                .put(Column::HeightIndex, &height_key(record.height), hash.to_vec());
            self.set_tip(record.clone());
            self.persist_transactions(&record, block)?;
            return Ok(InsertOutcome {
                block: record,
                fork_point: None,
                reconverged: false,
                kind: InsertKind::Extension,
            });
        }

        let prev = block.header.previousblockhash().unwrap_or([0u8; 32]);
        let mut parent = self.block(&prev)?.ok_or(ChainError::OrphanBlock(prev))?;
        let (chain, kind) = if parent.chain.is_main() {
            (self.allocate_side_id(), InsertKind::NewFork)
        } else {
            parent.nextblockhash = Some(hash);
            self.write_block(&parent);
            (parent.chain, InsertKind::SideGrowth)
        };
        let record = BlockRecord::from_block(
            block,
            parent.height + 1,
            parent.chainwork.saturating_add(block.work),
            chain,
        );
        self.write_block(&record);
        self.cache.put(
            Column::SideChain,
            &side_chain_key(chain, record.height, &hash),
            Vec::new(),
        );
        self.persist_transactions(&record, block)?;
        if kind == InsertKind::NewFork {
            log_info!(
                "fork on block {} at height {} ({})",
                hash256_to_hex(&prev),
                parent.height,
                chain
            );
        }

        if record.chainwork > tip.chainwork {
            let top = record.clone();
            let fork_point = self.switch_branch(|graph| graph.reconverge(top))?;
            let block = self.require_block(&hash)?;
            return Ok(InsertOutcome {
                block,
                fork_point: Some(fork_point),
                reconverged: true,
                kind,
            });
        }

        Ok(InsertOutcome {
            block: record,
            fork_point: Some(prev),
            reconverged: false,
            kind,
        })
    }

    /// Demotes every MAIN block above `common` and makes `common` the tip.
    /// Returns how many blocks left MAIN.
    pub fn rewind_to(&mut self, common: &Hash256) -> Result<usize, ChainError> {
        let common = *common;
        self.switch_branch(|graph| {
            let mut target = graph.require_block(&common)?;
            if !target.chain.is_main() {
                return Err(ChainError::ReconvergeFailed(format!(
                    "rewind target {} is not on the main chain",
                    hash256_to_hex(&common)
                )));
            }
            let demoted = graph.demote_above(target.height)?;
            if demoted.is_empty() {
                return Ok(0);
            }
            target.nextblockhash = None;
            graph.write_block(&target);
            graph.set_tip(target.clone());
            graph.reconcile(&demoted, &[])?;
            log_warn!(
                "rewound {} blocks to {} at height {}",
                demoted.len(),
                hash256_to_hex(&common),
                target.height
            );
            Ok(demoted.len())
        })
    }

    /// Runs a branch switch; on failure every unflushed write is dropped.
    fn switch_branch<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        match op(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.discard()?;
                Err(match err {
                    ChainError::ReconvergeFailed(message) => ChainError::ReconvergeFailed(message),
                    other => ChainError::ReconvergeFailed(other.to_string()),
                })
            }
        }
    }

    /// Promotes the branch ending at `new_top` to MAIN and returns the fork point.
    fn reconverge(&mut self, new_top: BlockRecord) -> Result<Hash256, ChainError> {
        let mut path = vec![new_top];
        let fork = loop {
            let cursor = path[path.len() - 1].previousblockhash.ok_or_else(|| {
                ChainError::ReconvergeFailed("branch has no main ancestor".to_string())
            })?;
            let block = self.require_block(&cursor)?;
            if block.chain.is_main() {
                break block;
            }
            path.push(block);
        };
        path.reverse();

        let demoted = self.demote_above(fork.height)?;

        let successors: Vec<Option<Hash256>> = path
            .iter()
            .skip(1)
            .map(|block| Some(block.hash))
            .chain(std::iter::once(None))
            .collect();
        for (block, next) in path.iter_mut().zip(successors) {
            self.cache.delete(
                Column::SideChain,
                &side_chain_key(block.chain, block.height, &block.hash),
            );
            block.chain = ChainId::MAIN;
            block.nextblockhash = next;
            self.cache.put(
                Column::HeightIndex,
                &height_key(block.height),
                block.hash.to_vec(),
            );
            self.write_block(block);
        }

        let mut fork_block = self.require_block(&fork.hash)?;
        fork_block.nextblockhash = path.first().map(|block| block.hash);
        self.write_block(&fork_block);

        let top = path[path.len() - 1].clone();
        self.set_tip(top.clone());
        self.reconcile(&demoted, &path)?;
        log_info!(
            "reconverged at fork {} (height {}): {} blocks promoted, {} demoted, tip {} at height {}",
            hash256_to_hex(&fork.hash),
            fork.height,
            path.len(),
            demoted.len(),
            hash256_to_hex(&top.hash),
            top.height
        );
        Ok(fork.hash)
    }

    /// Moves the MAIN blocks above `height` to one fresh side id.
    fn demote_above(&mut self, height: u32) -> Result<Vec<BlockRecord>, ChainError> {
        let tip_height = match self.tip.as_ref() {
            Some(tip) if tip.height > height => tip.height,
            _ => return Ok(Vec::new()),
        };
        let chain = self.allocate_side_id();
        let mut demoted = Vec::with_capacity((tip_height - height) as usize);
        for current in height + 1..=tip_height {
            let Some(hash) = self.main_hash_at(current)? else {
                break;
            };
            let mut block = self.require_block(&hash)?;
            block.chain = chain;
            self.cache.delete(Column::HeightIndex, &height_key(current));
            self.cache
                .put(Column::SideChain, &side_chain_key(chain, current, &hash), Vec::new());
            self.write_block(&block);
            demoted.push(block);
        }
        Ok(demoted)
    }

    fn reconcile(
        &mut self,
        demoted: &[BlockRecord],
        promoted: &[BlockRecord],
    ) -> Result<(), ChainError> {
        let txids: Vec<Hash256> = demoted
            .iter()
            .chain(promoted)
            .flat_map(|block| block.tx.iter().copied())
            .collect();
        unspent::repoint_transactions(&mut self.cache, &txids)?;
        if self.track_unspent {
            unspent::reconcile_spent(&mut self.cache, &txids)?;
        }
        Ok(())
    }

    fn allocate_side_id(&mut self) -> ChainId {
        let id = self.next_side_id;
        self.next_side_id = id.saturating_add(1);
        self.cache.put(
            Column::Meta,
            META_NEXT_SIDE_CHAIN,
            self.next_side_id.to_le_bytes().to_vec(),
        );
        ChainId(id)
    }

    fn write_block(&mut self, record: &BlockRecord) {
        self.cache.put(Column::Block, &record.hash, record.encode());
    }

    fn set_tip(&mut self, record: BlockRecord) {
        self.cache.put(Column::Meta, META_TIP, record.hash.to_vec());
        self.tip = Some(record);
    }

    fn persist_transactions(&mut self, record: &BlockRecord, block: &Block) -> Result<(), ChainError> {
        let on_main = record.chain.is_main();
        let mut new_txs = 0u64;
        for tx in &block.transactions {
            self.cache
                .put(Column::TxBlock, &tx_block_key(&tx.txid, &record.hash), Vec::new());
            if !self.cache.contains(Column::Tx, &tx.txid)? {
                self.cache.put(Column::Tx, &tx.txid, encode_transaction(tx));
                new_txs += 1;
            } else if on_main {
                unspent::repoint_transactions(&mut self.cache, &[tx.txid])?;
            }

            for vout in &tx.vout {
                let key = output_key(&tx.txid, vout.index);
                if !self.cache.contains(Column::Output, &key)? {
                    self.cache
                        .put(Column::Output, &key, encode_spent(!self.track_unspent).to_vec());
                }
                for address in &vout.addresses {
                    self.cache.put(
                        Column::AddressOutput,
                        &address_output_key(address, &tx.txid, vout.index),
                        vout.value.to_le_bytes().to_vec(),
                    );
                }
            }

            for (prev_txid, index) in tx.spent_outpoints() {
                self.cache.put(
                    Column::Spender,
                    &spender_key(&prev_txid, index, &tx.txid),
                    Vec::new(),
                );
                if on_main && self.track_unspent {
                    unspent::mark_spent(&mut self.cache, &prev_txid, index)?;
                }
            }
        }

        self.bump_counter(META_BLOCK_COUNT, 1)?;
        if new_txs > 0 {
            self.bump_counter(META_TX_COUNT, new_txs)?;
        }
        Ok(())
    }

    fn bump_counter(&mut self, key: &[u8], delta: u64) -> Result<(), ChainError> {
        let current = read_counter(&self.cache, key)?;
        self.cache
            .put(Column::Meta, key, current.saturating_add(delta).to_le_bytes().to_vec());
        Ok(())
    }
}

fn read_counter<S: KeyValueStore>(cache: &WriteCache<S>, key: &[u8]) -> Result<u64, ChainError> {
    decode_counter(cache.get(Column::Meta, key)?, key)
}

pub(crate) fn decode_counter(bytes: Option<Vec<u8>>, key: &[u8]) -> Result<u64, ChainError> {
    match bytes {
        Some(bytes) => Ok(u64::from_le_bytes(bytes.as_slice().try_into().map_err(
            |_| ChainError::CorruptRecord(format!("counter {}", String::from_utf8_lossy(key))),
        )?)),
        None => Ok(0),
    }
}
