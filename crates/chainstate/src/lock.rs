//! Single-writer sync lock kept in the meta column.

use std::fmt;

use exploder_log::log_warn;
use exploder_primitives::encoding::{DecodeError, Decoder, Encoder};
use exploder_storage::{Column, KeyValueStore, StoreError};

use crate::records::{finish, read_record_version, META_SYNC_LOCK, RECORD_VERSION};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncLock {
    pub owner: String,
    pub acquired_at: u64,
    pub timeout_secs: u64,
}

impl SyncLock {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.acquired_at.saturating_add(self.timeout_secs)
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(RECORD_VERSION);
        encoder.write_var_str(&self.owner);
        encoder.write_u64_le(self.acquired_at);
        encoder.write_u64_le(self.timeout_secs);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        read_record_version(&mut decoder)?;
        let lock = Self {
            owner: decoder.read_var_str()?,
            acquired_at: decoder.read_u64_le()?,
            timeout_secs: decoder.read_u64_le()?,
        };
        finish(&decoder)?;
        Ok(lock)
    }
}

#[derive(Debug)]
pub enum LockError {
    Busy { owner: String, acquired_at: u64 },
    Store(StoreError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Busy { owner, acquired_at } => {
                write!(f, "sync lock held by {owner} since {acquired_at}")
            }
            LockError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        LockError::Store(err)
    }
}

pub fn current_sync_lock<S: KeyValueStore>(store: &S) -> Result<Option<SyncLock>, LockError> {
    match store.get(Column::Meta, META_SYNC_LOCK)? {
        Some(bytes) => SyncLock::decode(&bytes).map(Some).map_err(|err| {
            LockError::Store(StoreError::Backend(format!("invalid sync lock: {err}")))
        }),
        None => Ok(None),
    }
}

/// Takes the lock for `owner`. A lock held past its timeout is released with
/// a warning and taken over; a live lock held by anyone else is `Busy`.
pub fn acquire_sync_lock<S: KeyValueStore>(
    store: &S,
    owner: &str,
    timeout_secs: u64,
    now: u64,
) -> Result<SyncLock, LockError> {
    if let Some(held) = current_sync_lock(store)? {
        if held.owner != owner && !held.is_expired(now) {
            return Err(LockError::Busy {
                owner: held.owner,
                acquired_at: held.acquired_at,
            });
        }
        if held.owner != owner {
            log_warn!(
                "releasing expired sync lock of {} (acquired at {}, timeout {}s)",
                held.owner,
                held.acquired_at,
                held.timeout_secs
            );
        }
    }
    let lock = SyncLock {
        owner: owner.to_string(),
        acquired_at: now,
        timeout_secs,
    };
    store.put(Column::Meta, META_SYNC_LOCK, &lock.encode())?;
    Ok(lock)
}

/// Releases the lock if `owner` holds it. Returns whether it was released.
pub fn release_sync_lock<S: KeyValueStore>(store: &S, owner: &str) -> Result<bool, LockError> {
    match current_sync_lock(store)? {
        Some(held) if held.owner == owner => {
            store.delete(Column::Meta, META_SYNC_LOCK)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
