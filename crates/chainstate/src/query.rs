//! Read-only lookups over committed state.
//!
//! Queries go straight to the store and see what the last flush committed.
//! Address aggregates only count outputs of transactions on MAIN.

use exploder_consensus::{Amount, ChainParams, Hash256};
use exploder_parser::model::{ChainId, Transaction};
use exploder_primitives::address::validate_address;
use exploder_storage::{Column, KeyValueStore};
use rayon::prelude::*;

use crate::cache::WriteCache;
use crate::error::{corrupt, ChainError};
use crate::records::{
    address_prefix, decode_spent, decode_transaction, height_key, output_key,
    parse_address_output_key, side_chain_prefix, parse_side_chain_key, BlockRecord, META_TIP,
};
use crate::unspent::is_main_tx;

/// Transaction with its output spent flags filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionView {
    pub tx: Transaction,
    /// True when any block containing the transaction is on MAIN.
    pub main_chain: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressOutput {
    pub address: String,
    pub txid: Hash256,
    pub index: u32,
    pub value: Amount,
    pub spent: bool,
}

pub struct ChainQuery<S> {
    cache: WriteCache<S>,
    params: ChainParams,
}

impl<S: KeyValueStore> ChainQuery<S> {
    pub fn new(store: S, params: ChainParams) -> Self {
        Self {
            cache: WriteCache::new(store),
            params,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &S {
        self.cache.store()
    }

    pub fn tip(&self) -> Result<Option<BlockRecord>, ChainError> {
        match self.store().get(Column::Meta, META_TIP)? {
            Some(hash) => self.block_by_hash(
                &hash
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::CorruptRecord("tip pointer".to_string()))?,
            ),
            None => Ok(None),
        }
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        match self.store().get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(
                BlockRecord::decode(&bytes).map_err(corrupt("block record"))?,
            )),
            None => Ok(None),
        }
    }

    /// MAIN block at `height`.
    pub fn block_by_height(&self, height: u32) -> Result<Option<BlockRecord>, ChainError> {
        match self.store().get(Column::HeightIndex, &height_key(height))? {
            Some(hash) => self.block_by_hash(&hash.as_slice().try_into().map_err(|_| {
                ChainError::CorruptRecord(format!("height index entry {height}"))
            })?),
            None => Ok(None),
        }
    }

    /// Confirmations counted on the block's own branch: against the tip for
    /// MAIN, against the highest block of the branch otherwise.
    pub fn block_confirmations(&self, block: &BlockRecord) -> Result<u32, ChainError> {
        let top = if block.chain.is_main() {
            match self.tip()? {
                Some(tip) => tip.height,
                None => return Ok(0),
            }
        } else {
            self.store()
                .scan_prefix(Column::SideChain, &side_chain_prefix(block.chain))?
                .last()
                .and_then(|(key, _)| parse_side_chain_key(key))
                .map(|(_, height, _)| height)
                .unwrap_or(block.height)
        };
        Ok(top.saturating_sub(block.height))
    }

    pub fn transaction(&self, txid: &Hash256) -> Result<Option<TransactionView>, ChainError> {
        let Some(bytes) = self.store().get(Column::Tx, txid)? else {
            return Ok(None);
        };
        let mut tx = decode_transaction(&bytes).map_err(corrupt("transaction record"))?;
        for vout in &mut tx.vout {
            vout.spent = self
                .store()
                .get(Column::Output, &output_key(txid, vout.index))?
                .map(|flag| decode_spent(&flag))
                .unwrap_or(false);
        }
        let main_chain = is_main_tx(&self.cache, txid)?;
        Ok(Some(TransactionView { tx, main_chain }))
    }

    /// Transactions of a block in block order.
    pub fn block_transactions(&self, hash: &Hash256) -> Result<Vec<TransactionView>, ChainError> {
        let block = self
            .block_by_hash(hash)?
            .ok_or(ChainError::MissingBlock(*hash))?;
        let mut out = Vec::with_capacity(block.tx.len());
        for txid in &block.tx {
            if let Some(view) = self.transaction(txid)? {
                out.push(view);
            }
        }
        Ok(out)
    }

    /// Every output ever paid to `address` on MAIN, in key order.
    pub fn address_outputs(&self, address: &str) -> Result<Vec<AddressOutput>, ChainError> {
        validate_address(address, &self.params)?;
        let mut out = Vec::new();
        for (key, value) in self
            .store()
            .scan_prefix(Column::AddressOutput, &address_prefix(address))?
        {
            let (txid, index) = parse_address_output_key(&key)
                .ok_or_else(|| ChainError::CorruptRecord("address output key".to_string()))?;
            if !is_main_tx(&self.cache, &txid)? {
                continue;
            }
            let value = Amount::from_le_bytes(
                value
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::CorruptRecord("address output value".to_string()))?,
            );
            let spent = self
                .store()
                .get(Column::Output, &output_key(&txid, index))?
                .map(|flag| decode_spent(&flag))
                .unwrap_or(false);
            out.push(AddressOutput {
                address: address.to_string(),
                txid,
                index,
                value,
                spent,
            });
        }
        Ok(out)
    }

    /// Distinct transactions paying `address`, newest block first.
    pub fn address_transactions(
        &self,
        address: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionView>, ChainError> {
        let mut txids: Vec<Hash256> = self
            .address_outputs(address)?
            .into_iter()
            .map(|output| output.txid)
            .collect();
        txids.sort_unstable();
        txids.dedup();

        let mut views = Vec::with_capacity(txids.len());
        for txid in &txids {
            if let Some(view) = self.transaction(txid)? {
                views.push(view);
            }
        }
        views.sort_by(|a, b| b.tx.blocktime.cmp(&a.tx.blocktime).then(a.tx.txid.cmp(&b.tx.txid)));
        Ok(views.into_iter().skip(offset).take(limit).collect())
    }

    pub fn address_tx_count(&self, address: &str) -> Result<usize, ChainError> {
        let mut txids: Vec<Hash256> = self
            .address_outputs(address)?
            .into_iter()
            .map(|output| output.txid)
            .collect();
        txids.sort_unstable();
        txids.dedup();
        Ok(txids.len())
    }

    pub fn address_unspent(&self, address: &str) -> Result<Vec<AddressOutput>, ChainError> {
        Ok(self
            .address_outputs(address)?
            .into_iter()
            .filter(|output| !output.spent)
            .collect())
    }

    /// Sum of unspent outputs.
    pub fn address_balance(&self, address: &str) -> Result<Amount, ChainError> {
        Ok(self
            .address_unspent(address)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Sum of everything ever received.
    pub fn address_volume(&self, address: &str) -> Result<Amount, ChainError> {
        Ok(self
            .address_outputs(address)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Most recent MAIN blocks, highest first.
    pub fn latest_blocks(&self, limit: usize, offset: usize) -> Result<Vec<BlockRecord>, ChainError> {
        let Some(tip) = self.tip()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(limit);
        let start = tip.height as i64 - offset as i64;
        let mut height = start;
        while height >= 0 && out.len() < limit {
            if let Some(block) = self.block_by_height(height as u32)? {
                out.push(block);
            }
            height -= 1;
        }
        Ok(out)
    }

    /// Transactions of the most recent MAIN blocks, newest first.
    pub fn latest_transactions(&self, limit: usize) -> Result<Vec<TransactionView>, ChainError> {
        let Some(tip) = self.tip()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(limit);
        let mut height = tip.height as i64;
        while height >= 0 && out.len() < limit {
            if let Some(block) = self.block_by_height(height as u32)? {
                for txid in block.tx.iter().rev() {
                    if out.len() == limit {
                        break;
                    }
                    if let Some(view) = self.transaction(txid)? {
                        out.push(view);
                    }
                }
            }
            height -= 1;
        }
        Ok(out)
    }

    /// Every side-branch id present in the index, ascending. MAIN is not listed.
    pub fn distinct_chain_ids(&self) -> Result<Vec<ChainId>, ChainError> {
        let mut ids: Vec<ChainId> = self
            .store()
            .scan_prefix(Column::SideChain, &[])?
            .iter()
            .filter_map(|(key, _)| parse_side_chain_key(key))
            .map(|(chain, _, _)| chain)
            .collect();
        ids.dedup();
        Ok(ids)
    }
}

impl<S: KeyValueStore> ChainQuery<S> {
    /// Balance of a set of addresses, fetched in parallel.
    pub fn addresses_balance(&self, addresses: &[String]) -> Result<Amount, ChainError> {
        addresses
            .par_iter()
            .map(|address| self.address_balance(address))
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }

    pub fn addresses_volume(&self, addresses: &[String]) -> Result<Amount, ChainError> {
        addresses
            .par_iter()
            .map(|address| self.address_volume(address))
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }

    pub fn addresses_unspent(&self, addresses: &[String]) -> Result<Vec<AddressOutput>, ChainError> {
        let per_address = addresses
            .par_iter()
            .map(|address| self.address_unspent(address))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(per_address.into_iter().flatten().collect())
    }

    pub fn addresses_tx_count(&self, addresses: &[String]) -> Result<usize, ChainError> {
        let per_address = addresses
            .par_iter()
            .map(|address| {
                self.address_outputs(address)
                    .map(|outputs| outputs.into_iter().map(|output| output.txid).collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut txids: Vec<Hash256> = per_address.into_iter().flatten().collect();
        txids.sort_unstable();
        txids.dedup();
        Ok(txids.len())
    }
}
