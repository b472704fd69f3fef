//! Column-oriented key-value storage behind a backend-neutral trait.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// hash -> block record
    Block,
    /// height (u32 BE) -> hash of the MAIN block
    HeightIndex,
    /// chain id (u32 BE) ++ height (u32 BE) ++ hash -> ()
    SideChain,
    /// txid -> transaction record
    Tx,
    /// txid ++ block hash -> ()
    TxBlock,
    /// txid ++ index (u32 BE) -> spent flag
    Output,
    /// address ++ txid ++ index -> output entry
    AddressOutput,
    /// txid ++ index ++ spending txid -> ()
    Spender,
    /// start time (u64 BE) -> sync history entry
    SyncHistory,
    /// timestamp (u64 BE) -> hashrate sample
    Hashrate,
    /// named singletons: tip, side-chain counter, sync lock, stats
    Meta,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::Block,
        Column::HeightIndex,
        Column::SideChain,
        Column::Tx,
        Column::TxBlock,
        Column::Output,
        Column::AddressOutput,
        Column::Spender,
        Column::SyncHistory,
        Column::Hashrate,
        Column::Meta,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Column::Block => 1 << 0,
            Column::HeightIndex => 1 << 1,
            Column::SideChain => 1 << 2,
            Column::Tx => 1 << 3,
            Column::TxBlock => 1 << 4,
            Column::Output => 1 << 5,
            Column::AddressOutput => 1 << 6,
            Column::Spender => 1 << 7,
            Column::SyncHistory => 1 << 8,
            Column::Hashrate => 1 << 9,
            Column::Meta => 1 << 10,
        }
    }

    pub const fn index(self) -> usize {
        self.bit().trailing_zeros() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Block => "block",
            Column::HeightIndex => "height_index",
            Column::SideChain => "side_chain",
            Column::Tx => "tx",
            Column::TxBlock => "tx_block",
            Column::Output => "output",
            Column::AddressOutput => "address_output",
            Column::Spender => "spender",
            Column::SyncHistory => "sync_history",
            Column::Hashrate => "hashrate",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 80]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 32]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
