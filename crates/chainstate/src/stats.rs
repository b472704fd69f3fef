//! Chain-wide statistics and the history the orchestrator records per cycle.

use std::collections::VecDeque;

use exploder_consensus::{supply_at_height, Amount};
use exploder_pow::difficulty::u256_to_f64;
use exploder_primitives::encoding::{DecodeError, Decoder, Encoder};
use exploder_storage::{Column, KeyValueStore};
use primitive_types::U256;

use crate::error::{corrupt, ChainError};
use crate::graph::decode_counter;
use crate::query::ChainQuery;
use crate::records::{
    finish, read_record_version, META_BLOCK_COUNT, META_NETWORK_STATS, META_TX_COUNT,
    RECORD_VERSION,
};

pub const HASHRATE_WINDOW_SECS: u32 = 86_400;

#[derive(Clone, Debug, PartialEq)]
pub struct ChainStats {
    pub height: Option<u32>,
    pub supply: Amount,
    pub block_count: u64,
    pub tx_count: u64,
    /// Hashes per second over the trailing window.
    pub hashrate: f64,
    pub chain_size: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncHistoryEntry {
    pub start_time: u64,
    pub end_time: u64,
    pub start_height: Option<u32>,
    pub end_height: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkStats {
    pub supply: Amount,
    pub chain_size: u64,
    pub updated_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HashrateSample {
    pub timestamp: u64,
    pub hashrate: f64,
}

impl<S: KeyValueStore> ChainQuery<S> {
    pub fn chain_stats(&self) -> Result<ChainStats, ChainError> {
        let tip = self.tip()?;
        let height = tip.as_ref().map(|tip| tip.height);
        let chain_size = self
            .network_stats()?
            .map(|stats| stats.chain_size)
            .unwrap_or(0);
        Ok(ChainStats {
            height,
            supply: height
                .map(|height| supply_at_height(height, self.params()))
                .unwrap_or(0),
            block_count: decode_counter(
                self.store().get(Column::Meta, META_BLOCK_COUNT)?,
                META_BLOCK_COUNT,
            )?,
            tx_count: decode_counter(self.store().get(Column::Meta, META_TX_COUNT)?, META_TX_COUNT)?,
            hashrate: self.hashrate_24h()?,
            chain_size,
        })
    }

    /// Work of the MAIN blocks no older than the window before the tip,
    /// divided by the window length.
    pub fn hashrate_24h(&self) -> Result<f64, ChainError> {
        let Some(tip) = self.tip()? else {
            return Ok(0.0);
        };
        let since = tip.time.saturating_sub(HASHRATE_WINDOW_SECS);
        let mut total = U256::zero();
        let mut height = Some(tip.height);
        while let Some(current) = height {
            let Some(block) = self.block_by_height(current)? else {
                break;
            };
            if block.time < since {
                break;
            }
            total = total.saturating_add(block.work);
            height = current.checked_sub(1);
        }
        Ok(u256_to_f64(total) / f64::from(HASHRATE_WINDOW_SECS))
    }

    pub fn network_stats(&self) -> Result<Option<NetworkStats>, ChainError> {
        read_network_stats(self.store())
    }

    /// Newest first.
    pub fn latest_hashrates(&self, limit: usize) -> Result<Vec<HashrateSample>, ChainError> {
        latest_entries(self.store(), Column::Hashrate, limit)?
            .iter()
            .map(|(key, value)| {
                let timestamp = u64::from_be_bytes(
                    key.as_slice()
                        .try_into()
                        .map_err(|_| ChainError::CorruptRecord("hashrate key".to_string()))?,
                );
                let bits = u64::from_be_bytes(
                    value
                        .as_slice()
                        .try_into()
                        .map_err(|_| ChainError::CorruptRecord("hashrate sample".to_string()))?,
                );
                Ok(HashrateSample {
                    timestamp,
                    hashrate: f64::from_bits(bits),
                })
            })
            .collect()
    }

    /// Newest first.
    pub fn latest_sync_history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, ChainError> {
        latest_entries(self.store(), Column::SyncHistory, limit)?
            .iter()
            .map(|(_, value)| SyncHistoryEntry::decode(value).map_err(corrupt("sync history entry")))
            .collect()
    }
}

/// The last `limit` entries of a time-keyed column, newest first, holding
/// no more than `limit` of them at once.
fn latest_entries<S: KeyValueStore>(
    store: &S,
    column: Column,
    limit: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut window: VecDeque<(Vec<u8>, Vec<u8>)> = VecDeque::with_capacity(limit);
    store.for_each_prefix(column, &[], &mut |key, value| {
        if window.len() == limit {
            window.pop_front();
        }
        window.push_back((key.to_vec(), value.to_vec()));
        Ok(())
    })?;
    Ok(window.into_iter().rev().collect())
}

pub fn record_hashrate<S: KeyValueStore>(
    store: &S,
    sample: HashrateSample,
) -> Result<(), ChainError> {
    store.put(
        Column::Hashrate,
        &sample.timestamp.to_be_bytes(),
        &sample.hashrate.to_bits().to_be_bytes(),
    )?;
    Ok(())
}

pub fn record_sync<S: KeyValueStore>(store: &S, entry: &SyncHistoryEntry) -> Result<(), ChainError> {
    store.put(
        Column::SyncHistory,
        &entry.start_time.to_be_bytes(),
        &entry.encode(),
    )?;
    Ok(())
}

pub fn record_network_stats<S: KeyValueStore>(
    store: &S,
    stats: &NetworkStats,
) -> Result<(), ChainError> {
    let mut encoder = Encoder::new();
    encoder.write_u8(RECORD_VERSION);
    encoder.write_i64_le(stats.supply);
    encoder.write_u64_le(stats.chain_size);
    encoder.write_u64_le(stats.updated_at);
    store.put(Column::Meta, META_NETWORK_STATS, &encoder.into_inner())?;
    Ok(())
}

pub fn read_network_stats<S: KeyValueStore>(store: &S) -> Result<Option<NetworkStats>, ChainError> {
    let Some(bytes) = store.get(Column::Meta, META_NETWORK_STATS)? else {
        return Ok(None);
    };
    decode_network_stats(&bytes)
        .map(Some)
        .map_err(corrupt("network stats"))
}

fn decode_network_stats(bytes: &[u8]) -> Result<NetworkStats, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    read_record_version(&mut decoder)?;
    let stats = NetworkStats {
        supply: decoder.read_i64_le()?,
        chain_size: decoder.read_u64_le()?,
        updated_at: decoder.read_u64_le()?,
    };
    finish(&decoder)?;
    Ok(stats)
}

impl SyncHistoryEntry {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(RECORD_VERSION);
        encoder.write_u64_le(self.start_time);
        encoder.write_u64_le(self.end_time);
        write_opt_height(&mut encoder, self.start_height);
        write_opt_height(&mut encoder, self.end_height);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        read_record_version(&mut decoder)?;
        let entry = SyncHistoryEntry {
            start_time: decoder.read_u64_le()?,
            end_time: decoder.read_u64_le()?,
            start_height: read_opt_height(&mut decoder)?,
            end_height: read_opt_height(&mut decoder)?,
        };
        finish(&decoder)?;
        Ok(entry)
    }
}

fn write_opt_height(encoder: &mut Encoder, height: Option<u32>) {
    match height {
        Some(height) => {
            encoder.write_bool(true);
            encoder.write_u32_le(height);
        }
        None => encoder.write_bool(false),
    }
}

fn read_opt_height(decoder: &mut Decoder) -> Result<Option<u32>, DecodeError> {
    if decoder.read_bool()? {
        Ok(Some(decoder.read_u32_le()?))
    } else {
        Ok(None)
    }
}
